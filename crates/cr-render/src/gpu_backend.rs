//! wgpu implementation of the compositing pipeline.
//!
//! Renders into a headless RGBA8 target that stands in for the visible
//! surface; [`read_pixels`](CompositorBackend::read_pixels) copies it back
//! through a mapped buffer.

use crate::backend::{CompositorBackend, CompositorError, QuadGeometry, Uniforms};
use crate::gpu::GpuContext;
use cr_surface::{Color, PixelSource, Raster};
use std::sync::Arc;
use tracing::{debug, info};
use wgpu::util::DeviceExt;
use wgpu::{
    BindGroupLayout, Buffer, Device, Extent3d, Queue, RenderPipeline, Sampler,
    TextureFormat, TextureUsages, TextureView,
};

/// Exact 8-bit storage, no sRGB conversion
const FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

const POSITION_ATTRIBS: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x2];
const TEXCOORD_ATTRIBS: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![1 => Float32x2];

fn vertex_layout(attributes: &'static [wgpu::VertexAttribute]) -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes,
    }
}

fn wgpu_color(color: Color) -> wgpu::Color {
    let [r, g, b, a] = color.to_array();
    wgpu::Color {
        r: r as f64,
        g: g as f64,
        b: b as f64,
        a: a as f64,
    }
}

fn extent(width: u32, height: u32) -> Extent3d {
    Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

/// A GPU texture holding one uploaded frame.
pub struct GpuTexture {
    texture: wgpu::Texture,
    view: TextureView,
    width: u32,
    height: u32,
}

impl GpuTexture {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Persistent state built once by `setup`.
struct Pipeline {
    pipeline: RenderPipeline,
    bind_group_layout: BindGroupLayout,
    sampler: Sampler,
    uniform_buffer: Buffer,
    position_buffer: Buffer,
    texcoord_buffer: Buffer,
}

/// GPU compositor backend.
pub struct WgpuBackend {
    device: Arc<Device>,
    queue: Arc<Queue>,
    pipeline: Option<Pipeline>,
    target: wgpu::Texture,
    target_view: TextureView,
    width: u32,
    height: u32,
}

impl WgpuBackend {
    /// Create a backend drawing into a `width` x `height` target.
    pub fn new(gpu: &GpuContext, width: u32, height: u32) -> Result<Self, CompositorError> {
        let max = gpu.max_texture_dimension();
        if width == 0 || height == 0 || width > max || height > max {
            return Err(CompositorError::Backend(format!(
                "visible surface {}x{} outside 1..={}",
                width, height, max
            )));
        }

        let target = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Visible Surface"),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FORMAT,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());

        info!("Created GPU visible surface ({}x{})", width, height);
        Ok(Self {
            device: gpu.device.clone(),
            queue: gpu.queue.clone(),
            pipeline: None,
            target,
            target_view,
            width,
            height,
        })
    }

    fn build_pipeline(&self, quad: &QuadGeometry) -> Pipeline {
        let device = &self.device;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Composite Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/composite.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Composite Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Composite Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Composite Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[vertex_layout(&POSITION_ATTRIBS), vertex_layout(&TEXCOORD_ATTRIBS)],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Composite Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Composite Uniforms"),
            size: std::mem::size_of::<Uniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let position_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Positions"),
            contents: bytemuck::cast_slice(&quad.position_data()),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let texcoord_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Texcoords"),
            contents: bytemuck::cast_slice(&quad.texcoord_data()),
            usage: wgpu::BufferUsages::VERTEX,
        });

        Pipeline {
            pipeline,
            bind_group_layout,
            sampler,
            uniform_buffer,
            position_buffer,
            texcoord_buffer,
        }
    }

    fn clear_target(&self) {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Clear Encoder"),
        });
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Clear Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &self.target_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu_color(Color::TRANSPARENT)),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        self.queue.submit(std::iter::once(encoder.finish()));
    }
}

impl CompositorBackend for WgpuBackend {
    type Texture = GpuTexture;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn output_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn setup(&mut self, quad: &QuadGeometry) -> Result<(), CompositorError> {
        self.pipeline = Some(self.build_pipeline(quad));
        self.clear_target();
        debug!("GPU pipeline ready");
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<GpuTexture, CompositorError> {
        let max = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(CompositorError::ResourceExhaustion(format!(
                "texture {}x{} exceeds device limit {}",
                width, height, max
            )));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Frame Texture"),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FORMAT,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(CompositorError::ResourceExhaustion(error.to_string()));
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(GpuTexture {
            texture,
            view,
            width,
            height,
        })
    }

    fn upload(&mut self, texture: &GpuTexture, source: &dyn PixelSource) -> Result<(), CompositorError> {
        if source.dimensions() != texture.dimensions() {
            return Err(CompositorError::SourceMismatch {
                expected: texture.dimensions(),
                actual: source.dimensions(),
            });
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            source.rgba8(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * texture.width),
                rows_per_image: Some(texture.height),
            },
            extent(texture.width, texture.height),
        );
        Ok(())
    }

    fn draw(&mut self, texture: &GpuTexture, uniforms: &Uniforms, vertex_count: u32) -> Result<(), CompositorError> {
        let pipeline = self.pipeline.as_ref().ok_or(CompositorError::NotSetUp)?;

        self.queue
            .write_buffer(&pipeline.uniform_buffer, 0, bytemuck::bytes_of(uniforms));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Composite Bind Group"),
            layout: &pipeline.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: pipeline.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&texture.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&pipeline.sampler),
                },
            ],
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Composite Encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Composite Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu_color(Color::TRANSPARENT)),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.set_vertex_buffer(0, pipeline.position_buffer.slice(..));
            pass.set_vertex_buffer(1, pipeline.texcoord_buffer.slice(..));
            pass.draw(0..vertex_count, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn release_texture(&mut self, texture: GpuTexture) {
        texture.texture.destroy();
    }

    fn read_pixels(&mut self) -> Result<Raster, CompositorError> {
        let unpadded = 4 * self.width;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;

        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: padded as u64 * self.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(self.height),
                },
            },
            extent(self.width, self.height),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| CompositorError::Readback(e.to_string()))?
            .map_err(|e| CompositorError::Readback(e.to_string()))?;

        let mut data = Vec::with_capacity(unpadded as usize * self.height as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks_exact(padded as usize) {
                data.extend_from_slice(&row[..unpadded as usize]);
            }
        }
        readback.unmap();

        Raster::from_rgba(self.width, self.height, data).map_err(|e| CompositorError::Readback(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::{Compositor, TexturePolicy};
    use cr_surface::Color;

    #[test]
    fn test_vertex_layouts() {
        let position = vertex_layout(&POSITION_ATTRIBS);
        assert_eq!(position.array_stride, 8);
        assert_eq!(position.attributes[0].shader_location, 0);
        assert_eq!(vertex_layout(&TEXCOORD_ATTRIBS).attributes[0].shader_location, 1);
    }

    #[test]
    #[ignore = "requires GPU"]
    fn test_gpu_matches_source() {
        let gpu = pollster::block_on(GpuContext::with_defaults()).unwrap();
        let backend = WgpuBackend::new(&gpu, 400, 400).unwrap();
        let mut compositor = Compositor::new(backend, (400, 400), TexturePolicy::Pooled).unwrap();

        let mut source = Raster::new(400, 400);
        source.fill_rect(0.0, 150.0, 100.0, 100.0, Color::GREEN);
        compositor.draw(&source).unwrap();
        let first = compositor.read_pixels().unwrap();
        compositor.draw(&source).unwrap();
        let second = compositor.read_pixels().unwrap();

        assert_eq!(first.pixel(0, 150), Some([0, 128, 0, 255]));
        assert_eq!(first.pixel(399, 399), Some([0, 0, 0, 0]));
        assert_eq!(first, second);
    }
}
