use std::sync::mpsc;

use anyhow::Context as _;
use image::RgbaImage;

pub(crate) const WORKGROUP_SIZE: u32 = 16;

pub(crate) struct PipelineBundle {
    pub pipeline: wgpu::ComputePipeline,
    pub bgl: wgpu::BindGroupLayout,
}

/// Owned handle to a GPU device and queue plus adapter details.
///
/// A context is owned by exactly one thread: the one-shot filter engine
/// creates and tears one down per call, the blend renderer keeps one alive
/// for the session on its GPU thread. Teardown is explicit via [`release`];
/// the engine never relies on implicit finalization for GPU resources.
///
/// [`release`]: RenderContext::release
pub struct RenderContext {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    adapter_name: String,
    adapter_backend: String,
}

impl RenderContext {
    /// Requests an adapter and device on the calling thread.
    ///
    /// Fails with an explicit error when no adapter or device is available;
    /// callers surface this rather than producing a corrupt image.
    pub fn new() -> anyhow::Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .context("no compatible GPU adapter found")?;
        let adapter_info = adapter.get_info();

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("darkroom_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .context("GPU device request failed")?;

        Ok(Self {
            device,
            queue,
            adapter_name: adapter_info.name,
            adapter_backend: adapter_info.backend.to_string(),
        })
    }

    /// Human-readable adapter description for logs and diagnostics.
    pub fn adapter_summary(&self) -> String {
        format!("{} ({})", self.adapter_name, self.adapter_backend)
    }

    /// The device's maximum 2D texture dimension.
    pub fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    /// Compiles a compute pipeline, reporting shader compile/link problems
    /// through a validation error scope instead of a device panic.
    pub(crate) fn create_pipeline(
        &self,
        label: &str,
        shader_src: &str,
        bgl_entries: &[wgpu::BindGroupLayoutEntry],
    ) -> anyhow::Result<PipelineBundle> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bgl = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: bgl_entries,
            });
        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                module: &shader,
                entry_point: Some("main"),
                cache: None,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            anyhow::bail!("pipeline '{label}' failed validation: {err}");
        }
        Ok(PipelineBundle { pipeline, bgl })
    }

    /// Uploads an RGBA image as a sampled texture.
    pub(crate) fn upload_rgba(&self, label: &str, img: &RgbaImage) -> wgpu::Texture {
        let extent = wgpu::Extent3d {
            width: img.width(),
            height: img.height(),
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.write_rgba(&texture, img);
        texture
    }

    pub(crate) fn write_rgba(&self, texture: &wgpu::Texture, img: &RgbaImage) {
        let extent = wgpu::Extent3d {
            width: img.width(),
            height: img.height(),
            depth_or_array_layers: 1,
        };
        self.queue.write_texture(
            texture.as_image_copy(),
            img.as_raw(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(img.width().saturating_mul(4)),
                rows_per_image: Some(img.height()),
            },
            extent,
        );
    }

    /// Creates a single-channel texture for the erase mask.
    pub(crate) fn create_mask_texture(&self, label: &str, width: u32, height: u32) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    pub(crate) fn write_mask(&self, texture: &wgpu::Texture, width: u32, height: u32, data: &[u8]) {
        self.queue.write_texture(
            texture.as_image_copy(),
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Creates an rgba8unorm storage texture the kernels write into.
    pub(crate) fn create_output(&self, label: &str, width: u32, height: u32) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        })
    }

    pub(crate) fn create_uniform(&self, label: &str, bytes: &[u8]) -> wgpu::Buffer {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes.len() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue.write_buffer(&buffer, 0, bytes);
        buffer
    }

    /// Copies a texture into a padded readback buffer and returns the pixels
    /// as a new image.
    pub(crate) fn read_rgba(
        &self,
        texture: &wgpu::Texture,
        width: u32,
        height: u32,
    ) -> anyhow::Result<RgbaImage> {
        let unpadded_bytes_per_row = width.saturating_mul(4);
        let padded_bytes_per_row = ((unpadded_bytes_per_row + wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
            - 1)
            / wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let readback_size = padded_bytes_per_row as u64 * height as u64;
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("darkroom_readback"),
            size: readback_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("darkroom_readback_encoder"),
            });
        encoder.copy_texture_to_buffer(
            texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit([encoder.finish()]);

        let slice = readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::wait());
        rx.recv()
            .context("readback mapping callback dropped")?
            .context("readback buffer mapping failed")?;

        let mapped = slice.get_mapped_range();
        let unpadded = unpadded_bytes_per_row as usize;
        let padded = padded_bytes_per_row as usize;
        let mut out = vec![0_u8; unpadded * (height as usize)];
        for row in 0..height as usize {
            let src_offset = row * padded;
            let dst_offset = row * unpadded;
            out[dst_offset..dst_offset + unpadded]
                .copy_from_slice(&mapped[src_offset..src_offset + unpadded]);
        }
        drop(mapped);
        readback.unmap();

        RgbaImage::from_raw(width, height, out).context("readback produced truncated image")
    }

    /// Flushes outstanding work and destroys the device. GPU resources need
    /// a deterministic teardown sequence, so sessions call this exactly once.
    pub fn release(self) {
        let _ = self.device.poll(wgpu::Maintain::wait());
        self.device.destroy();
    }
}

/// Standard bind group layout: sampled texture input, storage texture
/// output, uniform params buffer.
pub(crate) fn tex_storage_uniform_entries() -> [wgpu::BindGroupLayoutEntry; 3] {
    [
        sampled_texture_entry(0),
        storage_texture_entry(1),
        uniform_entry(2),
    ]
}

pub(crate) fn sampled_texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

pub(crate) fn storage_texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::Rgba8Unorm,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

pub(crate) fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn f32s_as_bytes(values: &[f32]) -> &[u8] {
    // f32 has no invalid bit patterns; reinterpreting as bytes is safe.
    unsafe {
        std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), std::mem::size_of_val(values))
    }
}
