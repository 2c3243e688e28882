//! wgpu render context
//!
//! The display connection is a wgpu adapter and device. The window surface
//! is an offscreen render target the size of the encoded frame; every swap
//! copies it back to host memory and queues the pixels on the encoder.

use std::sync::mpsc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use super::{FrameGeometry, RasterError, RenderContext, ShaderProgram};
use crate::capture::{Frame, PixelFormat};
use crate::encoder::EncoderSink;

/// A readback slower than this fails the frame instead of stalling the loop
const READBACK_TIMEOUT: Duration = Duration::from_secs(2);

const SURFACE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Size of the `Placement` uniform block in `compose.wgsl`
const PLACEMENT_SIZE: usize = 32;

struct Gpu {
    device: wgpu::Device,
    queue: wgpu::Queue,
    /// Drives wgpu's setup futures on the main task
    executor: Runtime,
}

struct Surface {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    readback: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_row: u32,
    pixels: Vec<u8>,
}

struct Program {
    name: &'static str,
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    placement: wgpu::Buffer,
    input: Option<InputTexture>,
}

struct InputTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
}

#[derive(Default)]
pub struct WgpuContext {
    gpu: Option<Gpu>,
    surface: Option<Surface>,
    program: Option<Program>,
}

impl WgpuContext {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenderContext for WgpuContext {
    fn connect(&mut self) -> Result<(), RasterError> {
        let executor = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| RasterError::Connection(format!("no executor: {}", e)))?;

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = executor
            .block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            }))
            .map_err(|e| RasterError::Connection(e.to_string()))?;

        let adapter_info = adapter.get_info();
        let (device, queue) = executor
            .block_on(adapter.request_device(&wgpu::DeviceDescriptor {
                label: Some("screenrec device"),
                required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
                ..Default::default()
            }))
            .map_err(|e| RasterError::Connection(e.to_string()))?;

        info!(
            "Connected to {} ({:?}, {:?})",
            adapter_info.name, adapter_info.device_type, adapter_info.backend
        );
        self.gpu = Some(Gpu {
            device,
            queue,
            executor,
        });
        Ok(())
    }

    fn create_window_surface(&mut self, width: u32, height: u32) -> Result<(), RasterError> {
        let gpu = self
            .gpu
            .as_ref()
            .ok_or_else(|| RasterError::Connection("not connected".to_string()))?;

        let max = gpu.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(RasterError::Surface(format!(
                "invalid size {}x{} (device maximum {})",
                width, height, max
            )));
        }

        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("encoder surface"),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: SURFACE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let padded_row = padded_bytes_per_row(width);
        let readback = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("encoder surface readback"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        debug!("Created {}x{} encoder surface", width, height);
        self.surface = Some(Surface {
            texture,
            view,
            readback,
            width,
            height,
            padded_row,
            pixels: Vec::with_capacity(PixelFormat::Rgba.frame_size(width, height)),
        });
        Ok(())
    }

    fn use_program(&mut self, program: &ShaderProgram, geometry: FrameGeometry) -> Result<(), RasterError> {
        let gpu = self.gpu.as_ref().ok_or(RasterError::NotReady("not connected"))?;
        if self.surface.is_none() {
            return Err(RasterError::NotReady("no surface"));
        }
        let device = &gpu.device;

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.name),
            source: wgpu::ShaderSource::Wgsl(program.source.into()),
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("compose bind group layout"),
            entries: &[
                // binding 0: captured frame
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                // binding 1: sampler
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                // binding 2: placement
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("compose pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(program.name),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some(program.vertex_entry),
                buffers: &[],
                compilation_options: Default::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some(program.fragment_entry),
                targets: &[Some(wgpu::ColorTargetState {
                    format: SURFACE_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            multiview: None,
            cache: None,
        });

        // Nearest sampling keeps the scaled output identical to the CPU path
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("compose sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            lod_min_clamp: 0.0,
            lod_max_clamp: 1.0,
            compare: None,
            anisotropy_clamp: 1,
            border_color: None,
        });

        let placement = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("compose placement"),
            size: PLACEMENT_SIZE as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::UNIFORM,
            mapped_at_creation: false,
        });
        gpu.queue.write_buffer(&placement, 0, &placement_bytes(&geometry));

        if let Some(e) = gpu.executor.block_on(device.pop_error_scope()) {
            return Err(RasterError::Program {
                name: program.name,
                reason: e.to_string(),
            });
        }

        debug!("Using shader program {}", program.name);
        self.program = Some(Program {
            name: program.name,
            pipeline,
            layout,
            sampler,
            placement,
            input: None,
        });
        Ok(())
    }

    fn draw(&mut self, input: &Frame) -> Result<(), RasterError> {
        let (Some(gpu), Some(surface), Some(program)) =
            (self.gpu.as_ref(), self.surface.as_ref(), self.program.as_mut())
        else {
            return Err(RasterError::NotReady("no program bound"));
        };
        if input.format != PixelFormat::Rgba || input.width == 0 || input.height == 0 {
            return Err(RasterError::Render(format!(
                "cannot draw {:?} frame of {}x{}",
                input.format, input.width, input.height
            )));
        }

        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let reuse = matches!(
            &program.input,
            Some(texture) if texture.width == input.width && texture.height == input.height
        );
        if !reuse {
            debug!("Input texture {}x{}", input.width, input.height);
            program.input = Some(create_input_texture(&gpu.device, program, input.width, input.height));
        }
        let Some(texture) = program.input.as_ref() else {
            return Err(RasterError::NotReady("no input texture"));
        };

        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &input.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(input.width * 4),
                rows_per_image: Some(input.height),
            },
            extent(input.width, input.height),
        );

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("compose"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("compose pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &surface.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        // Padding stays black
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &texture.bind_group, &[]);
            pass.draw(0..4, 0..1);
        }
        gpu.queue.submit(Some(encoder.finish()));

        match gpu.executor.block_on(gpu.device.pop_error_scope()) {
            Some(e) => Err(RasterError::Render(format!("{}: {}", program.name, e))),
            None => Ok(()),
        }
    }

    fn swap_buffers(&mut self, sink: &mut dyn EncoderSink, pts: Duration) -> Result<(), RasterError> {
        let (Some(gpu), Some(surface)) = (self.gpu.as_ref(), self.surface.as_mut()) else {
            return Err(RasterError::NotReady("no surface"));
        };

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("surface readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &surface.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &surface.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(surface.padded_row),
                    rows_per_image: Some(surface.height),
                },
            },
            extent(surface.width, surface.height),
        );
        gpu.queue.submit(Some(encoder.finish()));

        read_back(&gpu.device, surface)?;
        sink.queue_frame(&surface.pixels, pts)?;
        Ok(())
    }

    fn destroy_surface(&mut self) {
        if let Some(program) = self.program.take() {
            if let Some(input) = program.input {
                input.texture.destroy();
            }
            program.placement.destroy();
        }
        if let Some(surface) = self.surface.take() {
            surface.readback.destroy();
            surface.texture.destroy();
        }
    }

    fn disconnect(&mut self) {
        if let Some(gpu) = self.gpu.take() {
            gpu.device.destroy();
            debug!("Display connection closed");
        }
    }
}

fn create_input_texture(device: &wgpu::Device, program: &Program, width: u32, height: u32) -> InputTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("captured frame"),
        size: extent(width, height),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("compose bind group"),
        layout: &program.layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&view),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(&program.sampler),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &program.placement,
                    offset: 0,
                    size: None,
                }),
            },
        ],
    });

    InputTexture {
        texture,
        bind_group,
        width,
        height,
    }
}

/// Map the readback buffer and copy it into `surface.pixels` without row padding
fn read_back(device: &wgpu::Device, surface: &mut Surface) -> Result<(), RasterError> {
    let slice = surface.readback.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });

    let deadline = Instant::now() + READBACK_TIMEOUT;
    let mapped = loop {
        device
            .poll(wgpu::PollType::Poll)
            .map_err(|e| RasterError::Render(e.to_string()))?;
        match rx.try_recv() {
            Ok(result) => break result,
            Err(mpsc::TryRecvError::Empty) if Instant::now() < deadline => std::thread::yield_now(),
            Err(_) => return Err(RasterError::Render("surface readback timed out".to_string())),
        }
    };
    mapped.map_err(|e| RasterError::Render(e.to_string()))?;

    {
        let data = slice.get_mapped_range();
        let row = surface.width as usize * 4;
        surface.pixels.clear();
        for line in data.chunks(surface.padded_row as usize).take(surface.height as usize) {
            surface.pixels.extend_from_slice(&line[..row]);
        }
    }
    surface.readback.unmap();
    Ok(())
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

/// Texture-to-buffer copies need rows aligned to [`wgpu::COPY_BYTES_PER_ROW_ALIGNMENT`]
fn padded_bytes_per_row(width: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (width * 4).div_ceil(align) * align
}

/// `Placement` uniform: content rectangle in clip space, then quarter turns
fn placement_bytes(geometry: &FrameGeometry) -> [u8; PLACEMENT_SIZE] {
    let (ox, oy) = geometry.content_offset();
    let (w, h) = (geometry.video_width as f32, geometry.video_height as f32);
    let left = 2.0 * ox as f32 / w - 1.0;
    let right = 2.0 * (ox + geometry.content_width) as f32 / w - 1.0;
    let top = 1.0 - 2.0 * oy as f32 / h;
    let bottom = 1.0 - 2.0 * (oy + geometry.content_height) as f32 / h;

    let mut bytes = [0u8; PLACEMENT_SIZE];
    for (slot, value) in bytes.chunks_exact_mut(4).zip([left, top, right, bottom]) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
    bytes[16..20].copy_from_slice(&(geometry.rotation.degrees() / 90).to_le_bytes());
    bytes
}
