use std::path::Path;

use anyhow::bail;
use image::RgbaImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Number of discrete input levels in a generated lookup table.
pub const LUT_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// A normalized curve control point, both coordinates in [0, 1].
pub struct ControlPoint {
    pub x: f32,
    pub y: f32,
}

impl ControlPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

fn identity_points() -> Vec<ControlPoint> {
    vec![ControlPoint::new(0.0, 0.0), ControlPoint::new(1.0, 1.0)]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Per-channel tone curve control points edited by the curve UI.
///
/// Each channel must hold at least the two boundary points at x=0 and x=1
/// with strictly increasing x values. The curve editor enforces this when
/// inserting or dragging points; `generate` rejects anything else.
pub struct ToneCurves {
    pub master: Vec<ControlPoint>,
    pub red: Vec<ControlPoint>,
    pub green: Vec<ControlPoint>,
    pub blue: Vec<ControlPoint>,
}

impl Default for ToneCurves {
    fn default() -> Self {
        Self {
            master: identity_points(),
            red: identity_points(),
            green: identity_points(),
            blue: identity_points(),
        }
    }
}

impl ToneCurves {
    /// Checks the control-point preconditions on every channel.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_channel("master", &self.master)?;
        validate_channel("red", &self.red)?;
        validate_channel("green", &self.green)?;
        validate_channel("blue", &self.blue)?;
        Ok(())
    }

    /// Loads curve state from the image sidecar JSON, if present and valid.
    pub fn load(image_path: &Path) -> Option<Self> {
        let sidecar = sidecar_path(image_path);
        let json = std::fs::read_to_string(sidecar).ok()?;
        serde_json::from_str(&json).ok()
    }

    /// Saves the current curve state to the image sidecar JSON.
    pub fn save(&self, image_path: &Path) -> anyhow::Result<()> {
        let sidecar = sidecar_path(image_path);
        if let Some(parent) = sidecar.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(sidecar, json)?;
        Ok(())
    }
}

fn sidecar_path(image_path: &Path) -> std::path::PathBuf {
    let dir = image_path.parent().unwrap_or(Path::new("."));
    let filename = image_path.file_name().unwrap_or_default().to_string_lossy();
    dir.join(".edits").join(format!("{}.curves.json", filename))
}

fn validate_channel(name: &str, points: &[ControlPoint]) -> anyhow::Result<()> {
    if points.len() < 2 {
        bail!("{name} curve needs at least the two boundary points");
    }
    let first = points[0];
    let last = points[points.len() - 1];
    if first.x != 0.0 || last.x != 1.0 {
        bail!("{name} curve must span x=0 to x=1");
    }
    for pair in points.windows(2) {
        if pair[1].x <= pair[0].x {
            bail!(
                "{name} curve x values must be strictly increasing ({} then {})",
                pair[0].x,
                pair[1].x
            );
        }
    }
    if points.iter().any(|p| !(0.0..=1.0).contains(&p.y)) {
        bail!("{name} curve y values must stay within [0, 1]");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
/// Combined per-channel lookup table, 256 levels per channel, values in [0, 1].
///
/// A `Lut` has no identity of its own: it is always a pure function of the
/// `ToneCurves` it was generated from.
pub struct Lut {
    pub r: [f32; LUT_SIZE],
    pub g: [f32; LUT_SIZE],
    pub b: [f32; LUT_SIZE],
}

/// Generates the combined LUT from per-channel curves.
///
/// Each output channel composes the master curve with the channel curve:
/// `lut[c][i] = curve_c(curve_master(i / 255))`. Curves are evaluated with
/// monotone piecewise-cubic (Fritsch–Carlson) interpolation and clamped to
/// [0, 1]. Identity curves produce the exact identity mapping.
pub fn generate(curves: &ToneCurves) -> anyhow::Result<Lut> {
    curves.validate()?;

    let master = MonotoneCurve::fit(&curves.master);
    let red = MonotoneCurve::fit(&curves.red);
    let green = MonotoneCurve::fit(&curves.green);
    let blue = MonotoneCurve::fit(&curves.blue);

    let mut lut = Lut {
        r: [0.0; LUT_SIZE],
        g: [0.0; LUT_SIZE],
        b: [0.0; LUT_SIZE],
    };
    for i in 0..LUT_SIZE {
        let level = i as f32 / (LUT_SIZE - 1) as f32;
        let m = master.eval(level).clamp(0.0, 1.0);
        lut.r[i] = red.eval(m).clamp(0.0, 1.0);
        lut.g[i] = green.eval(m).clamp(0.0, 1.0);
        lut.b[i] = blue.eval(m).clamp(0.0, 1.0);
    }
    Ok(lut)
}

/// Applies a LUT on the CPU, producing a new image.
///
/// Reference path for tests and debugging; the interactive pipeline uses
/// `render::filter::apply_lut` instead.
pub fn apply_lut_cpu(img: &RgbaImage, lut: &Lut) -> RgbaImage {
    let mut out = img.clone();
    out.par_chunks_mut(4).for_each(|px| {
        px[0] = (lut.r[px[0] as usize] * 255.0).round() as u8;
        px[1] = (lut.g[px[1] as usize] * 255.0).round() as u8;
        px[2] = (lut.b[px[2] as usize] * 255.0).round() as u8;
    });
    out
}

#[derive(Default)]
/// Session-owned LUT cache keyed by value equality of the curve snapshot.
///
/// Regeneration only happens when the curves actually change; `invalidate`
/// forces the next `get` to regenerate.
pub struct LutCache {
    entry: Option<(ToneCurves, Lut)>,
}

impl LutCache {
    pub fn get(&mut self, curves: &ToneCurves) -> anyhow::Result<Lut> {
        if let Some((key, lut)) = &self.entry {
            if key == curves {
                return Ok(lut.clone());
            }
        }
        let lut = generate(curves)?;
        self.entry = Some((curves.clone(), lut.clone()));
        Ok(lut)
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

/// Monotone piecewise-cubic Hermite interpolant (Fritsch–Carlson tangents).
///
/// Never overshoots the control points, and degenerates to exact linear
/// interpolation on linear segments, so identity curves map through exactly.
struct MonotoneCurve {
    xs: Vec<f32>,
    ys: Vec<f32>,
    tangents: Vec<f32>,
}

impl MonotoneCurve {
    fn fit(points: &[ControlPoint]) -> Self {
        let xs: Vec<f32> = points.iter().map(|p| p.x).collect();
        let ys: Vec<f32> = points.iter().map(|p| p.y).collect();
        let n = xs.len();

        let mut secants = Vec::with_capacity(n - 1);
        for k in 0..n - 1 {
            secants.push((ys[k + 1] - ys[k]) / (xs[k + 1] - xs[k]));
        }

        let mut tangents = vec![0.0_f32; n];
        tangents[0] = secants[0];
        tangents[n - 1] = secants[n - 2];
        for k in 1..n - 1 {
            // Zero tangent at local extrema keeps the interpolant monotone.
            if secants[k - 1] * secants[k] <= 0.0 {
                tangents[k] = 0.0;
            } else {
                tangents[k] = (secants[k - 1] + secants[k]) * 0.5;
            }
        }

        // Fritsch–Carlson limiter: rescale tangents that would overshoot.
        for k in 0..n - 1 {
            let d = secants[k];
            if d == 0.0 {
                tangents[k] = 0.0;
                tangents[k + 1] = 0.0;
                continue;
            }
            let a = tangents[k] / d;
            let b = tangents[k + 1] / d;
            let sq = a * a + b * b;
            if sq > 9.0 {
                let tau = 3.0 / sq.sqrt();
                tangents[k] = tau * a * d;
                tangents[k + 1] = tau * b * d;
            }
        }

        Self { xs, ys, tangents }
    }

    fn eval(&self, x: f32) -> f32 {
        let n = self.xs.len();
        if x <= self.xs[0] {
            return self.ys[0];
        }
        if x >= self.xs[n - 1] {
            return self.ys[n - 1];
        }
        let mut k = 0;
        while k + 2 < n && x >= self.xs[k + 1] {
            k += 1;
        }

        let h = self.xs[k + 1] - self.xs[k];
        let d = (self.ys[k + 1] - self.ys[k]) / h;
        let m0 = self.tangents[k];
        let m1 = self.tangents[k + 1];
        let s = x - self.xs[k];
        // Power form: the quadratic/cubic terms vanish when m0 == m1 == d,
        // which makes linear segments (and the identity curve) exact.
        let c2 = (3.0 * d - 2.0 * m0 - m1) / h;
        let c3 = (m0 + m1 - 2.0 * d) / (h * h);
        self.ys[k] + s * (m0 + s * (c2 + s * c3))
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use image::{ImageBuffer, Rgba};

    use super::*;

    fn curves_with_master(master: Vec<ControlPoint>) -> ToneCurves {
        ToneCurves {
            master,
            ..ToneCurves::default()
        }
    }

    #[test]
    fn identity_curves_yield_identity_lut() {
        let lut = generate(&ToneCurves::default()).expect("identity curves are valid");
        for i in 0..LUT_SIZE {
            let expected = i as f32 / 255.0;
            assert!(
                (lut.r[i] - expected).abs() < 1e-6,
                "r[{i}] = {} expected {expected}",
                lut.r[i]
            );
            assert!((lut.g[i] - expected).abs() < 1e-6);
            assert!((lut.b[i] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn master_midpoint_lifts_to_expected_level() {
        let curves = curves_with_master(vec![
            ControlPoint::new(0.0, 0.0),
            ControlPoint::new(0.5, 0.7),
            ControlPoint::new(1.0, 1.0),
        ]);
        let lut = generate(&curves).expect("valid curves");

        // Input 128/255 sits a hair above the 0.5 control point.
        let v = lut.r[128] * 255.0;
        assert!(
            (v - 0.7 * 255.0).abs() < 3.0,
            "level 128 mapped to {v}, expected near {}",
            0.7 * 255.0
        );
        // Identity channel curves mean all three channels agree.
        assert_eq!(lut.r, lut.g);
        assert_eq!(lut.r, lut.b);
    }

    #[test]
    fn lifted_master_curve_is_strictly_increasing() {
        let curves = curves_with_master(vec![
            ControlPoint::new(0.0, 0.0),
            ControlPoint::new(0.5, 0.7),
            ControlPoint::new(1.0, 1.0),
        ]);
        let lut = generate(&curves).expect("valid curves");
        for i in 1..LUT_SIZE {
            assert!(
                lut.r[i] > lut.r[i - 1],
                "lut not increasing at {i}: {} <= {}",
                lut.r[i],
                lut.r[i - 1]
            );
        }
    }

    #[test]
    fn interpolation_never_overshoots_unit_range() {
        let curves = curves_with_master(vec![
            ControlPoint::new(0.0, 0.0),
            ControlPoint::new(0.1, 0.9),
            ControlPoint::new(0.9, 0.95),
            ControlPoint::new(1.0, 1.0),
        ]);
        let lut = generate(&curves).expect("valid curves");
        for i in 0..LUT_SIZE {
            assert!((0.0..=1.0).contains(&lut.r[i]));
        }
    }

    #[test]
    fn channel_curve_composes_after_master() {
        // Master halves the input, red zeroes everything below 0.6.
        let curves = ToneCurves {
            master: vec![ControlPoint::new(0.0, 0.0), ControlPoint::new(1.0, 0.5)],
            red: vec![
                ControlPoint::new(0.0, 0.0),
                ControlPoint::new(0.6, 0.0),
                ControlPoint::new(1.0, 1.0),
            ],
            ..ToneCurves::default()
        };
        let lut = generate(&curves).expect("valid curves");
        // master(1.0) = 0.5 < 0.6, so red flattens the whole range to ~0.
        assert!(lut.r[LUT_SIZE - 1] < 0.05);
        // green stays the plain master curve.
        assert!((lut.g[LUT_SIZE - 1] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn non_monotonic_x_is_rejected() {
        let curves = curves_with_master(vec![
            ControlPoint::new(0.0, 0.0),
            ControlPoint::new(0.5, 0.5),
            ControlPoint::new(0.5, 0.8),
            ControlPoint::new(1.0, 1.0),
        ]);
        assert!(generate(&curves).is_err());
    }

    #[test]
    fn missing_boundary_points_are_rejected() {
        let curves = curves_with_master(vec![
            ControlPoint::new(0.1, 0.0),
            ControlPoint::new(1.0, 1.0),
        ]);
        assert!(generate(&curves).is_err());
    }

    #[test]
    fn cache_regenerates_only_on_change() {
        let mut cache = LutCache::default();
        let identity = ToneCurves::default();
        let a = cache.get(&identity).expect("valid curves");
        let b = cache.get(&identity).expect("valid curves");
        assert_eq!(a, b);

        let lifted = curves_with_master(vec![
            ControlPoint::new(0.0, 0.0),
            ControlPoint::new(0.5, 0.7),
            ControlPoint::new(1.0, 1.0),
        ]);
        let c = cache.get(&lifted).expect("valid curves");
        assert_ne!(a, c);

        cache.invalidate();
        let d = cache.get(&lifted).expect("valid curves");
        assert_eq!(c, d);
    }

    #[test]
    fn cpu_lut_apply_shifts_flat_gray_by_master_only() {
        let curves = curves_with_master(vec![
            ControlPoint::new(0.0, 0.0),
            ControlPoint::new(0.5, 0.7),
            ControlPoint::new(1.0, 1.0),
        ]);
        let lut = generate(&curves).expect("valid curves");
        let img: RgbaImage = ImageBuffer::from_pixel(4, 4, Rgba([128, 128, 128, 255]));
        let out = apply_lut_cpu(&img, &lut);
        let px = out.get_pixel(0, 0).0;
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
        assert!((px[0] as f32 - 0.7 * 255.0).abs() < 4.0);
        assert_eq!(px[3], 255);
    }

    #[test]
    fn sidecar_uses_edits_folder() {
        let p = sidecar_path(Path::new("/photos/IMG_001.RAF"));
        assert_eq!(p, PathBuf::from("/photos/.edits/IMG_001.RAF.curves.json"));
    }
}
