use std::time::Instant;

use anyhow::{Context, Result};
use image::{ImageBuffer, Rgba, RgbaImage};

use darkroom::curve::{self, ControlPoint, ToneCurves};
use darkroom::mask::{MaskPainter, StrokeMode};
use darkroom::render::{filter, BlendRenderer};

fn median_ms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) * 0.5
    } else {
        sorted[mid]
    }
}

fn gradient_image(width: u32, height: u32) -> RgbaImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        let r = (255 * x / width.max(1)) as u8;
        let g = (255 * y / height.max(1)) as u8;
        let b = 128_u8;
        Rgba([r, g, b, 255])
    })
}

fn probe_curves() -> ToneCurves {
    let mut curves = ToneCurves::default();
    curves.master = vec![
        ControlPoint::new(0.0, 0.0),
        ControlPoint::new(0.5, 0.65),
        ControlPoint::new(1.0, 1.0),
    ];
    curves.blue = vec![
        ControlPoint::new(0.0, 0.05),
        ControlPoint::new(1.0, 0.95),
    ];
    curves
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args();
    let _bin = args.next();
    let width = args
        .next()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(1920);
    let height = args
        .next()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(1080);
    let iters = args
        .next()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(30);

    let original = gradient_image(width, height);
    eprintln!("Probing {width}x{height}, {iters} blend iterations");

    let curves = probe_curves();
    let t0 = Instant::now();
    let lut = curve::generate(&curves).context("LUT generation failed")?;
    let lut_ms = t0.elapsed().as_secs_f64() * 1000.0;

    let t0 = Instant::now();
    let cpu_filtered = curve::apply_lut_cpu(&original, &lut);
    let cpu_lut_ms = t0.elapsed().as_secs_f64() * 1000.0;

    // One-shot path: context creation included, like a single filter tap.
    let t0 = Instant::now();
    let filtered = filter::apply_lut(&original, &lut).context("one-shot LUT filter failed")?;
    let oneshot_ms = t0.elapsed().as_secs_f64() * 1000.0;

    // Persistent path: context and base textures created once, then a
    // stroke drag re-blends against a growing mask.
    let t0 = Instant::now();
    let renderer =
        BlendRenderer::init(&filtered, &original).context("blend renderer init failed")?;
    let init_ms = t0.elapsed().as_secs_f64() * 1000.0;
    eprintln!("Adapter: {}", renderer.adapter_summary());

    let mut painter = MaskPainter::new(width, height, 4, 0.5);
    painter
        .begin((0.1, 0.1), width as f32 * 0.04, StrokeMode::Erase)
        .context("probe stroke begin failed")?;

    let mut blend_samples = Vec::with_capacity(iters);
    for i in 0..iters {
        let t = 0.1 + 0.8 * (i as f32 / iters.max(1) as f32);
        painter.extend((t, t)).context("probe stroke extend failed")?;
        let t0 = Instant::now();
        let _ = renderer.blend(painter.mask()).context("blend failed")?;
        blend_samples.push(t0.elapsed().as_secs_f64() * 1000.0);
    }
    painter.end().context("probe stroke end failed")?;
    renderer.release();

    let blend_median = median_ms(&blend_samples);
    let blends_per_sec = if blend_median > 0.0 {
        1000.0 / blend_median
    } else {
        0.0
    };

    println!("METRIC image={width}x{height}");
    println!("METRIC lut_generate_ms={lut_ms:.3}");
    println!("METRIC lut_apply_cpu_ms={cpu_lut_ms:.2}");
    println!("METRIC filter_oneshot_ms={oneshot_ms:.2}");
    println!("METRIC blend_init_ms={init_ms:.2}");
    println!("METRIC blend_ms_median={blend_median:.2}");
    println!("METRIC blends_per_sec={blends_per_sec:.1}");

    Ok(())
}
