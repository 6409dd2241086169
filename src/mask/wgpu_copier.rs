use super::MaskCopier;
use crate::error::SetupError;
use crate::segmentation::ConfidenceMask;
use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use std::borrow::Cow;
use wgpu::util::DeviceExt;

/// Maps the [-1, 1] quad to texture coordinates, flipping Y
pub const VERTEX_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    var uv = (position + vec2<f32>(1.0, 1.0)) / 2.0;
    uv.y = 1.0 - uv.y;
    out.tex_coords = uv;
    out.clip_position = vec4<f32>(position, 0.0, 1.0);
    return out;
}
"#;

/// Writes the mask's red channel to all four output channels
pub const MASK_COPY_SHADER: &str = r#"
@group(0) @binding(0) var mask_texture: texture_2d<f32>;
@group(0) @binding(1) var mask_sampler: sampler;

@fragment
fn fs_main(@location(0) tex_coords: vec2<f32>) -> @location(0) vec4<f32> {
    let a = textureSample(mask_texture, mask_sampler, tex_coords).r;
    return vec4<f32>(a, a, a, a);
}
"#;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct QuadVertex {
    position: [f32; 2],
}

impl QuadVertex {
    /// Two triangles covering clip space
    const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0] },
        QuadVertex { position: [-1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0] },
        QuadVertex { position: [-1.0, -1.0] },
        QuadVertex { position: [1.0, 1.0] },
        QuadVertex { position: [1.0, -1.0] },
    ];

    const ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x2];

    fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

/// Parse and validate a WGSL stage before it reaches the device
pub fn validate_wgsl(stage: &'static str, source: &str) -> Result<(), SetupError> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| SetupError::ShaderCompile {
        stage,
        message: e.emit_to_string(source),
    })?;

    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| SetupError::ShaderCompile {
            stage,
            message: format!("{:?}", e),
        })?;

    Ok(())
}

/// Per-size GPU resources, rebuilt when the mask dimensions change
struct CopyTargets {
    width: u32,
    height: u32,
    mask_texture: wgpu::Texture,
    mask_view: wgpu::TextureView,
    output_texture: wgpu::Texture,
    output_view: wgpu::TextureView,
    readback: wgpu::Buffer,
    padded_bytes_per_row: u32,
}

/// Mask copier running a full-screen quad pass on the GPU
pub struct GpuMaskCopier {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    vertex_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    targets: Option<CopyTargets>,
}

impl GpuMaskCopier {
    /// Acquire a device and build the copy program. Fails loudly on any setup error.
    pub fn new() -> Result<Self, SetupError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(SetupError::NoAdapter)?;

        tracing::info!("Mask copier using GPU adapter {}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Mask Copy Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))?;

        device.on_uncaptured_error(Box::new(|error| {
            tracing::error!("Uncaptured GPU error: {}", error);
        }));

        validate_wgsl("vertex", VERTEX_SHADER)?;
        validate_wgsl("fragment", MASK_COPY_SHADER)?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Mask Copy Vertex Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(VERTEX_SHADER)),
        });
        let fragment_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Mask Copy Fragment Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(MASK_COPY_SHADER)),
        });

        // R32Float is not filterable without an extra feature, so sample it unfiltered
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Mask Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Mask Copy Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Mask Copy Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vertex_module,
                entry_point: Some("vs_main"),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(SetupError::PipelineLink(error.to_string()));
        }

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Mask Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        tracing::info!("Mask copy program ready");

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            vertex_buffer,
            sampler,
            targets: None,
        })
    }

    fn create_targets(&self, width: u32, height: u32) -> CopyTargets {
        tracing::debug!("Allocating mask copy targets at {}x{}", width, height);

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        let mask_texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Mask Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let output_texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Mask Output Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let unpadded = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = unpadded.div_ceil(align) * align;

        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Mask Readback Buffer"),
            size: (padded_bytes_per_row * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        CopyTargets {
            width,
            height,
            mask_view: mask_texture.create_view(&wgpu::TextureViewDescriptor::default()),
            mask_texture,
            output_view: output_texture.create_view(&wgpu::TextureViewDescriptor::default()),
            output_texture,
            readback,
            padded_bytes_per_row,
        }
    }
}

impl MaskCopier for GpuMaskCopier {
    fn copy(&mut self, mask: &ConfidenceMask) -> Result<RgbaImage> {
        let _span = tracing::debug_span!("mask_copy_gpu").entered();
        let (width, height) = mask.dimensions();

        let stale = self
            .targets
            .as_ref()
            .map_or(true, |t| (t.width, t.height) != (width, height));
        if stale {
            self.targets = Some(self.create_targets(width, height));
        }
        let targets = self.targets.as_ref().context("mask copy targets missing")?;

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &targets.mask_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(mask.as_slice()),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            size,
        );

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Mask Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&targets.mask_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Mask Copy Encoder"),
            });

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Mask Copy Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &targets.output_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::WHITE),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            render_pass.draw(0..QuadVertex::VERTICES.len() as u32, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &targets.output_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &targets.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(targets.padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            size,
        );

        self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(anyhow!("mask copy pass failed: {}", error));
        }

        // Read back the output
        let buffer_slice = targets.readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .context("GPU readback was abandoned")?
            .context("Failed to map readback buffer")?;

        let row_bytes = (width * 4) as usize;
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        {
            let data = buffer_slice.get_mapped_range();
            for row in data.chunks(targets.padded_bytes_per_row as usize) {
                pixels.extend_from_slice(&row[..row_bytes]);
            }
        }
        targets.readback.unmap();

        RgbaImage::from_raw(width, height, pixels).context("readback size mismatch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::confidence_to_unorm;

    #[test]
    fn builtin_shaders_validate() {
        validate_wgsl("vertex", VERTEX_SHADER).unwrap();
        validate_wgsl("fragment", MASK_COPY_SHADER).unwrap();
    }

    #[test]
    fn broken_shader_is_reported_with_its_stage() {
        let broken = MASK_COPY_SHADER.replace("let a", "let a: i32");
        match validate_wgsl("fragment", &broken) {
            Err(SetupError::ShaderCompile { stage, message }) => {
                assert_eq!(stage, "fragment");
                assert!(!message.is_empty());
            }
            other => panic!("expected a compile error, got {other:?}"),
        }
    }

    #[test]
    fn gpu_copy_writes_mask_into_every_channel() {
        let mut copier = match GpuMaskCopier::new() {
            Ok(copier) => copier,
            Err(err) => {
                eprintln!("skipping GPU copy test: {err}");
                return;
            }
        };

        // 70 columns forces row padding in the readback buffer
        let (width, height) = (70, 5);
        let values: Vec<f32> = (0..width * height)
            .map(|i| (i % 11) as f32 / 10.0)
            .collect();
        let mask = ConfidenceMask::new(width, height, values).unwrap();

        let bitmap = copier.copy(&mask).unwrap();
        assert_eq!(bitmap.dimensions(), (width, height));
        for (x, y, pixel) in bitmap.enumerate_pixels() {
            let expected = confidence_to_unorm(mask.get(x, y)) as i16;
            let [r, g, b, a] = pixel.0;
            assert_eq!((r, g, b), (a, a, a), "channels differ at ({x}, {y})");
            assert!((a as i16 - expected).abs() <= 1, "alpha off at ({x}, {y})");
        }

        // Reuse with a different size rebuilds the targets
        let small = ConfidenceMask::uniform(3, 2, 1.0).unwrap();
        let bitmap = copier.copy(&small).unwrap();
        assert!(bitmap.pixels().all(|p| p.0 == [255; 4]));
    }
}
