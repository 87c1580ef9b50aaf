//! One-shot shader filter engine.
//!
//! Each call creates an ephemeral GPU context sized to the image, uploads
//! the image, runs one WGSL compute kernel, reads the result back and tears
//! the context down before returning. Stateless between calls; safe from
//! any thread that does not already hold a GPU context.
//!
//! User kernels are opaque strings compiled against a fixed interface:
//! entry point `main`, `@workgroup_size(16, 16, 1)`, and bindings
//! `@binding(0) texture_2d<f32>` (source), `@binding(1)
//! texture_storage_2d<rgba8unorm, write>` (destination) and `@binding(2)`
//! a uniform with the image resolution as two f32s. Kernels that fail
//! validation degrade to a built-in passthrough; filter application never
//! takes the editing session down.

use anyhow::bail;
use image::RgbaImage;
use tracing::warn;

use crate::curve::{LUT_SIZE, Lut};
use crate::render::context::{
    self, PipelineBundle, RenderContext, WORKGROUP_SIZE, f32s_as_bytes,
    tex_storage_uniform_entries,
};

/// Applies a caller-supplied WGSL kernel to an image, producing a new image.
///
/// The only error is GPU context creation failure. Shader compile/link
/// failures fall back to the passthrough kernel; if even that path fails,
/// the input is returned unmodified.
pub fn apply(image: &RgbaImage, shader_src: &str) -> anyhow::Result<RgbaImage> {
    let ctx = RenderContext::new()?;
    let out = apply_with_context(&ctx, image, shader_src);
    ctx.release();
    Ok(out)
}

/// Applies a generated tone-curve LUT to an image via the built-in kernel.
pub fn apply_lut(image: &RgbaImage, lut: &Lut) -> anyhow::Result<RgbaImage> {
    let ctx = RenderContext::new()?;
    let result = apply_lut_with_context(&ctx, image, lut);
    ctx.release();
    result
}

pub(crate) fn apply_with_context(
    ctx: &RenderContext,
    image: &RgbaImage,
    shader_src: &str,
) -> RgbaImage {
    if image.width() == 0 || image.height() == 0 {
        return image.clone();
    }
    if image.width() > ctx.max_texture_dimension() || image.height() > ctx.max_texture_dimension()
    {
        warn!(
            width = image.width(),
            height = image.height(),
            "image exceeds device texture limits; filter skipped"
        );
        return image.clone();
    }

    match ctx.create_pipeline("filter_user", shader_src, &tex_storage_uniform_entries()) {
        Ok(bundle) => match run_kernel(ctx, &bundle, image, None) {
            Ok(out) => return out,
            Err(err) => warn!(%err, "user kernel dispatch failed; falling back to passthrough"),
        },
        Err(err) => warn!(%err, "user kernel failed to compile; falling back to passthrough"),
    }

    let fallback = ctx
        .create_pipeline(
            "filter_passthrough",
            PASSTHROUGH_SHADER_SRC,
            &tex_storage_uniform_entries(),
        )
        .and_then(|bundle| run_kernel(ctx, &bundle, image, None));
    match fallback {
        Ok(out) => out,
        Err(err) => {
            warn!(%err, "passthrough fallback failed; returning input unchanged");
            image.clone()
        }
    }
}

pub(crate) fn apply_lut_with_context(
    ctx: &RenderContext,
    image: &RgbaImage,
    lut: &Lut,
) -> anyhow::Result<RgbaImage> {
    if image.width() == 0 || image.height() == 0 {
        return Ok(image.clone());
    }
    if image.width() > ctx.max_texture_dimension() || image.height() > ctx.max_texture_dimension()
    {
        bail!("image exceeds device texture limits");
    }

    let entries = [
        context::sampled_texture_entry(0),
        context::storage_texture_entry(1),
        context::uniform_entry(2),
        context::uniform_entry(3),
    ];
    let bundle = ctx.create_pipeline("filter_lut", LUT_SHADER_SRC, &entries)?;
    let lut_buffer = ctx.create_uniform("filter_lut_table", f32s_as_bytes(&lut_as_vec4s(lut)));
    run_kernel(ctx, &bundle, image, Some(&lut_buffer))
}

/// Packs the three channel tables into 256 vec4 rows (rgb + pad) matching
/// the uniform layout of the LUT kernel.
fn lut_as_vec4s(lut: &Lut) -> Vec<f32> {
    let mut packed = Vec::with_capacity(LUT_SIZE * 4);
    for i in 0..LUT_SIZE {
        packed.push(lut.r[i]);
        packed.push(lut.g[i]);
        packed.push(lut.b[i]);
        packed.push(0.0);
    }
    packed
}

fn run_kernel(
    ctx: &RenderContext,
    bundle: &PipelineBundle,
    image: &RgbaImage,
    extra_uniform: Option<&wgpu::Buffer>,
) -> anyhow::Result<RgbaImage> {
    let (w, h) = image.dimensions();
    let src = ctx.upload_rgba("filter_src", image);
    let dst = ctx.create_output("filter_dst", w, h);
    let params: [f32; 4] = [w as f32, h as f32, 0.0, 0.0];
    let params_buffer = ctx.create_uniform("filter_params", f32s_as_bytes(&params));

    let src_view = src.create_view(&wgpu::TextureViewDescriptor::default());
    let dst_view = dst.create_view(&wgpu::TextureViewDescriptor::default());
    let mut bg_entries = vec![
        wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::TextureView(&src_view),
        },
        wgpu::BindGroupEntry {
            binding: 1,
            resource: wgpu::BindingResource::TextureView(&dst_view),
        },
        wgpu::BindGroupEntry {
            binding: 2,
            resource: params_buffer.as_entire_binding(),
        },
    ];
    if let Some(buffer) = extra_uniform {
        bg_entries.push(wgpu::BindGroupEntry {
            binding: 3,
            resource: buffer.as_entire_binding(),
        });
    }

    ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
    let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("filter_bg"),
        layout: &bundle.bgl,
        entries: &bg_entries,
    });

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("filter_encoder"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("filter_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&bundle.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(w.div_ceil(WORKGROUP_SIZE), h.div_ceil(WORKGROUP_SIZE), 1);
    }
    ctx.queue.submit([encoder.finish()]);
    if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
        bail!("kernel dispatch failed validation: {err}");
    }

    ctx.read_rgba(&dst, w, h)
}

pub(crate) const PASSTHROUGH_SHADER_SRC: &str = r#"
struct Params {
    width: f32,
    height: f32,
    _pad0: f32,
    _pad1: f32,
};

@group(0) @binding(0)
var src_tex: texture_2d<f32>;
@group(0) @binding(1)
var dst_tex: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2)
var<uniform> params: Params;

@compute @workgroup_size(16, 16, 1)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let width = u32(params.width + 0.5);
    let height = u32(params.height + 0.5);
    if (gid.x >= width || gid.y >= height) {
        return;
    }
    let coord = vec2<i32>(i32(gid.x), i32(gid.y));
    textureStore(dst_tex, coord, textureLoad(src_tex, coord, 0));
}
"#;

// Per-channel LUT lookup. Channel value -> 0..255 index -> table entry.
const LUT_SHADER_SRC: &str = r#"
struct Params {
    width: f32,
    height: f32,
    _pad0: f32,
    _pad1: f32,
};

struct LutTable {
    entries: array<vec4<f32>, 256>,
};

@group(0) @binding(0)
var src_tex: texture_2d<f32>;
@group(0) @binding(1)
var dst_tex: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2)
var<uniform> params: Params;
@group(0) @binding(3)
var<uniform> lut: LutTable;

@compute @workgroup_size(16, 16, 1)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let width = u32(params.width + 0.5);
    let height = u32(params.height + 0.5);
    if (gid.x >= width || gid.y >= height) {
        return;
    }
    let coord = vec2<i32>(i32(gid.x), i32(gid.y));
    let px = textureLoad(src_tex, coord, 0);
    let ir = u32(clamp(px.r, 0.0, 1.0) * 255.0 + 0.5);
    let ig = u32(clamp(px.g, 0.0, 1.0) * 255.0 + 0.5);
    let ib = u32(clamp(px.b, 0.0, 1.0) * 255.0 + 0.5);
    let out = vec3<f32>(lut.entries[ir].r, lut.entries[ig].g, lut.entries[ib].b);
    textureStore(dst_tex, coord, vec4<f32>(clamp(out, vec3<f32>(0.0), vec3<f32>(1.0)), px.a));
}
"#;

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgba};

    use super::*;
    use crate::curve::{ControlPoint, ToneCurves, apply_lut_cpu, generate};

    fn gpu_available() -> bool {
        match RenderContext::new() {
            Ok(ctx) => {
                ctx.release();
                true
            }
            Err(_) => false,
        }
    }

    fn gradient_image() -> RgbaImage {
        ImageBuffer::from_fn(64, 32, |x, y| {
            Rgba([(x * 4) as u8, (y * 8) as u8, 128, 255])
        })
    }

    #[test]
    fn passthrough_kernel_returns_identical_pixels() {
        if !gpu_available() {
            return;
        }
        let img = gradient_image();
        let out = apply(&img, PASSTHROUGH_SHADER_SRC).expect("gpu available");
        assert_eq!(out, img);
    }

    #[test]
    fn invalid_shader_degrades_to_identity() {
        if !gpu_available() {
            return;
        }
        let img = gradient_image();
        let out = apply(&img, "this is not wgsl").expect("gpu available");
        assert_eq!(out, img);
    }

    #[test]
    fn shader_without_main_entry_degrades_to_identity() {
        if !gpu_available() {
            return;
        }
        // Valid WGSL, but the pipeline cannot link its `main` entry point.
        let src = "@compute @workgroup_size(1) fn not_main() {}";
        let img = gradient_image();
        let out = apply(&img, src).expect("gpu available");
        assert_eq!(out, img);
    }

    #[test]
    fn gpu_lut_matches_cpu_reference() {
        if !gpu_available() {
            return;
        }
        let curves = ToneCurves {
            master: vec![
                ControlPoint::new(0.0, 0.0),
                ControlPoint::new(0.5, 0.7),
                ControlPoint::new(1.0, 1.0),
            ],
            ..ToneCurves::default()
        };
        let lut = generate(&curves).expect("valid curves");
        let img = gradient_image();

        let gpu = apply_lut(&img, &lut).expect("gpu available");
        let cpu = apply_lut_cpu(&img, &lut);
        for (a, b) in gpu.pixels().zip(cpu.pixels()) {
            for c in 0..4 {
                assert!(
                    (a.0[c] as i16 - b.0[c] as i16).abs() <= 1,
                    "gpu {:?} vs cpu {:?}",
                    a.0,
                    b.0
                );
            }
        }
    }

    #[test]
    fn flat_gray_shifts_by_master_curve_only() {
        if !gpu_available() {
            return;
        }
        let curves = ToneCurves {
            master: vec![
                ControlPoint::new(0.0, 0.0),
                ControlPoint::new(0.5, 0.7),
                ControlPoint::new(1.0, 1.0),
            ],
            ..ToneCurves::default()
        };
        let lut = generate(&curves).expect("valid curves");
        let img: RgbaImage = ImageBuffer::from_pixel(100, 100, Rgba([128, 128, 128, 255]));
        let out = apply_lut(&img, &lut).expect("gpu available");
        let px = out.get_pixel(50, 50).0;
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
        assert!((px[0] as f32 - 0.7 * 255.0).abs() < 4.0);
    }
}
