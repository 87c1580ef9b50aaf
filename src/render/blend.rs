//! Persistent blend renderer for interactive erase/restore painting.
//!
//! Creating a GPU context per stroke update is far too slow, so this
//! renderer creates the context and uploads the filtered/original textures
//! exactly once per editing session. Every `blend` call re-uploads only the
//! mask texture and re-runs a fixed kernel. All calls after `init` must
//! happen on the thread that owns the renderer; the session keeps it on its
//! dedicated GPU thread.

use std::marker::PhantomData;

use anyhow::bail;
use image::RgbaImage;

use crate::mask::Mask;
use crate::render::context::{
    self, PipelineBundle, RenderContext, WORKGROUP_SIZE, f32s_as_bytes,
};

pub struct BlendRenderer {
    ctx: RenderContext,
    width: u32,
    height: u32,
    filtered_tex: wgpu::Texture,
    original_tex: wgpu::Texture,
    mask_tex: wgpu::Texture,
    output_tex: wgpu::Texture,
    params_buffer: wgpu::Buffer,
    bundle: PipelineBundle,
    // Pin the renderer to the thread that created it.
    _not_send: PhantomData<*const ()>,
}

impl BlendRenderer {
    /// Creates the GPU context and uploads both base textures once.
    ///
    /// `filtered` and `original` must share dimensions; the mask passed to
    /// every later `blend` call must match them too.
    pub fn init(filtered: &RgbaImage, original: &RgbaImage) -> anyhow::Result<Self> {
        if filtered.dimensions() != original.dimensions() {
            bail!(
                "filtered ({}x{}) and original ({}x{}) images must match",
                filtered.width(),
                filtered.height(),
                original.width(),
                original.height()
            );
        }
        let (width, height) = filtered.dimensions();
        if width == 0 || height == 0 {
            bail!("blend images must be non-empty");
        }

        let ctx = RenderContext::new()?;
        let max_dim = ctx.max_texture_dimension();
        if width > max_dim || height > max_dim {
            ctx.release();
            bail!("image {width}x{height} exceeds device texture limit {max_dim}");
        }

        let filtered_tex = ctx.upload_rgba("blend_filtered", filtered);
        let original_tex = ctx.upload_rgba("blend_original", original);
        let mask_tex = ctx.create_mask_texture("blend_mask", width, height);
        // Start from an all-zero mask so the first blend shows the original.
        ctx.write_mask(
            &mask_tex,
            width,
            height,
            &vec![0_u8; (width as usize) * (height as usize)],
        );
        let output_tex = ctx.create_output("blend_out", width, height);
        let params: [f32; 4] = [width as f32, height as f32, 0.0, 0.0];
        let params_buffer = ctx.create_uniform("blend_params", f32s_as_bytes(&params));

        let entries = [
            context::sampled_texture_entry(0),
            context::sampled_texture_entry(1),
            context::sampled_texture_entry(2),
            context::storage_texture_entry(3),
            context::uniform_entry(4),
        ];
        let bundle = match ctx.create_pipeline("blend_mix", BLEND_SHADER_SRC, &entries) {
            Ok(bundle) => bundle,
            Err(err) => {
                ctx.release();
                return Err(err);
            }
        };

        Ok(Self {
            ctx,
            width,
            height,
            filtered_tex,
            original_tex,
            mask_tex,
            output_tex,
            params_buffer,
            bundle,
            _not_send: PhantomData,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn adapter_summary(&self) -> String {
        self.ctx.adapter_summary()
    }

    /// Replaces the filtered base texture, e.g. after a curve edit
    /// re-derived it. The original texture never changes.
    pub fn set_filtered(&self, filtered: &RgbaImage) -> anyhow::Result<()> {
        if filtered.dimensions() != (self.width, self.height) {
            bail!(
                "filtered image {}x{} does not match renderer {}x{}",
                filtered.width(),
                filtered.height(),
                self.width,
                self.height
            );
        }
        self.ctx.write_rgba(&self.filtered_tex, filtered);
        Ok(())
    }

    /// Re-uploads the mask and re-executes the blend kernel:
    /// mask 0 shows the original, 255 the filtered image.
    pub fn blend(&self, mask: &Mask) -> anyhow::Result<RgbaImage> {
        if (mask.width(), mask.height()) != (self.width, self.height) {
            bail!(
                "mask {}x{} does not match renderer {}x{}",
                mask.width(),
                mask.height(),
                self.width,
                self.height
            );
        }
        self.ctx
            .write_mask(&self.mask_tex, self.width, self.height, mask.data());

        let filtered_view = self
            .filtered_tex
            .create_view(&wgpu::TextureViewDescriptor::default());
        let original_view = self
            .original_tex
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mask_view = self
            .mask_tex
            .create_view(&wgpu::TextureViewDescriptor::default());
        let output_view = self
            .output_tex
            .create_view(&wgpu::TextureViewDescriptor::default());

        let bind_group = self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blend_bg"),
            layout: &self.bundle.bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&filtered_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&original_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&mask_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&output_view),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: self.params_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder =
            self.ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("blend_encoder"),
                });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("blend_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.bundle.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                self.width.div_ceil(WORKGROUP_SIZE),
                self.height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        self.ctx.queue.submit([encoder.finish()]);

        self.ctx.read_rgba(&self.output_tex, self.width, self.height)
    }

    /// Runs the built-in LUT kernel on this renderer's context, e.g. to
    /// re-derive the filtered base after a curve edit.
    pub fn apply_lut_to(
        &self,
        image: &RgbaImage,
        lut: &crate::curve::Lut,
    ) -> anyhow::Result<RgbaImage> {
        crate::render::filter::apply_lut_with_context(&self.ctx, image, lut)
    }

    /// Destroys all GPU resources. Must be called exactly once when the
    /// editing session ends; skipping it leaks GPU memory.
    pub fn release(self) {
        drop(self.filtered_tex);
        drop(self.original_tex);
        drop(self.mask_tex);
        drop(self.output_tex);
        drop(self.params_buffer);
        drop(self.bundle);
        self.ctx.release();
    }
}

const BLEND_SHADER_SRC: &str = r#"
struct Params {
    width: f32,
    height: f32,
    _pad0: f32,
    _pad1: f32,
};

@group(0) @binding(0)
var filtered_tex: texture_2d<f32>;
@group(0) @binding(1)
var original_tex: texture_2d<f32>;
@group(0) @binding(2)
var mask_tex: texture_2d<f32>;
@group(0) @binding(3)
var dst_tex: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(4)
var<uniform> params: Params;

@compute @workgroup_size(16, 16, 1)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let width = u32(params.width + 0.5);
    let height = u32(params.height + 0.5);
    if (gid.x >= width || gid.y >= height) {
        return;
    }
    let coord = vec2<i32>(i32(gid.x), i32(gid.y));
    let f = textureLoad(filtered_tex, coord, 0);
    let o = textureLoad(original_tex, coord, 0);
    let m = textureLoad(mask_tex, coord, 0).r;
    textureStore(dst_tex, coord, mix(o, f, m));
}
"#;

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgba};

    use super::*;
    use crate::mask::{MaskPainter, StrokeMode};

    fn flat(w: u32, h: u32, rgba: [u8; 4]) -> RgbaImage {
        ImageBuffer::from_pixel(w, h, Rgba(rgba))
    }

    fn renderer_100() -> Option<BlendRenderer> {
        let filtered = flat(100, 100, [200, 40, 40, 255]);
        let original = flat(100, 100, [10, 120, 230, 255]);
        BlendRenderer::init(&filtered, &original).ok()
    }

    #[test]
    fn zero_mask_returns_original_exactly() {
        let Some(renderer) = renderer_100() else {
            return;
        };
        let mask = Mask::new(100, 100);
        let out = renderer.blend(&mask).expect("blend succeeds");
        assert!(out.pixels().all(|p| p.0 == [10, 120, 230, 255]));
        renderer.release();
    }

    #[test]
    fn full_mask_returns_filtered_exactly() {
        let Some(renderer) = renderer_100() else {
            return;
        };
        let mut mask = Mask::new(100, 100);
        mask.fill(255);
        let out = renderer.blend(&mask).expect("blend succeeds");
        assert!(out.pixels().all(|p| p.0 == [200, 40, 40, 255]));
        renderer.release();
    }

    #[test]
    fn stroke_blend_is_original_off_path_and_filtered_on_path() {
        let Some(renderer) = renderer_100() else {
            return;
        };
        let mut painter = MaskPainter::new(100, 100, 4, 0.5);
        painter.begin((0.2, 0.2), 20.0, StrokeMode::Erase).unwrap();
        painter.extend((0.8, 0.8)).unwrap();
        painter.end().unwrap();

        let out = renderer.blend(painter.mask()).expect("blend succeeds");
        // On the stroke spine the filtered image shows through.
        assert_eq!(out.get_pixel(50, 50).0, [200, 40, 40, 255]);
        // Far corners stay the original.
        assert_eq!(out.get_pixel(90, 10).0, [10, 120, 230, 255]);
        assert_eq!(out.get_pixel(10, 90).0, [10, 120, 230, 255]);
        renderer.release();
    }

    #[test]
    fn set_filtered_takes_effect_on_next_blend() {
        let Some(renderer) = renderer_100() else {
            return;
        };
        let mut mask = Mask::new(100, 100);
        mask.fill(255);
        renderer
            .set_filtered(&flat(100, 100, [1, 2, 3, 255]))
            .expect("dimensions match");
        let out = renderer.blend(&mask).expect("blend succeeds");
        assert!(out.pixels().all(|p| p.0 == [1, 2, 3, 255]));
        renderer.release();
    }

    #[test]
    fn mismatched_mask_is_rejected() {
        let Some(renderer) = renderer_100() else {
            return;
        };
        let mask = Mask::new(64, 64);
        assert!(renderer.blend(&mask).is_err());
        renderer.release();
    }

    #[test]
    fn mismatched_base_images_are_rejected() {
        let filtered = flat(64, 64, [0, 0, 0, 255]);
        let original = flat(100, 100, [0, 0, 0, 255]);
        assert!(BlendRenderer::init(&filtered, &original).is_err());
    }
}
