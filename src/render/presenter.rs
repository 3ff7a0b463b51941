//! Render-thread presentation of the camera texture.
//!
//! The notification thread only flips the [`FrameSignal`]. Everything that
//! touches the GPU happens in [`FramePresenter::draw`], on the render thread.

use super::orientation::{DisplayOrientation, DisplayRotation, OrientationTracker, RotationMatrix};
use super::surface::{ExternalSurface, FrameSignal};
use super::viewport::{ClippedViewport, ScaleType, ViewportFitter, ViewportRect};
use crate::capture::Facing;
use crate::error::{PipelineError, Result};
use crate::frame::{CaptureSize, PixelFormat, QuadVertex, VideoFrame};
use crate::shader::{self, compile_presentation_program};
use crate::utils::FpsCounter;
use bytemuck::{Pod, Zeroable};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterState {
    Uninitialized,
    Ready,
}

/// Matches the `Transform` block of the vertex stage.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TransformUniform {
    pub tex_rotate: [f32; 16],
    pub uv_offset: [f32; 2],
    pub uv_scale: [f32; 2],
}

impl TransformUniform {
    pub fn new(rotation: &RotationMatrix, viewport: Option<&ClippedViewport>) -> Self {
        Self {
            tex_rotate: rotation.0,
            uv_offset: viewport.map_or([0.0, 0.0], |v| v.uv_offset),
            uv_scale: viewport.map_or([1.0, 1.0], |v| v.uv_scale),
        }
    }
}

struct CameraTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    size: CaptureSize,
}

struct GpuState {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    vertex_buffer: wgpu::Buffer,
    uniform_buffer: wgpu::Buffer,
    camera: Option<CameraTexture>,
}

/// Draws the latest camera image as one full-surface quad.
pub struct FramePresenter {
    surface: Arc<ExternalSurface>,
    signal: Arc<FrameSignal>,
    orientation: OrientationTracker,
    fitter: ViewportFitter,
    scale_type: ScaleType,
    surface_size: (u32, u32),
    image_size: Option<CaptureSize>,
    viewport: Option<ClippedViewport>,
    uniforms_dirty: bool,
    gpu: Option<GpuState>,
    draw_rate: FpsCounter,
}

impl FramePresenter {
    pub fn new(surface: Arc<ExternalSurface>, signal: Arc<FrameSignal>, facing: Facing, scale_type: ScaleType) -> Self {
        Self {
            surface,
            signal,
            orientation: OrientationTracker::new(facing),
            fitter: ViewportFitter::new(),
            scale_type,
            surface_size: (0, 0),
            image_size: None,
            viewport: None,
            uniforms_dirty: true,
            gpu: None,
            draw_rate: FpsCounter::new(),
        }
    }

    pub fn state(&self) -> PresenterState {
        if self.gpu.is_some() {
            PresenterState::Ready
        } else {
            PresenterState::Uninitialized
        }
    }

    /// Compiles the program, allocates GPU resources and starts listening for
    /// surface updates. Compile failures are fatal.
    pub fn initialize(&mut self, device: &wgpu::Device, format: wgpu::TextureFormat) -> Result<()> {
        if self.gpu.is_some() {
            return Ok(());
        }

        let program = compile_presentation_program()?;
        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Camera Vertex Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(program.vertex_wgsl)),
        });
        let fragment_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Camera Fragment Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(program.fragment_wgsl)),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Camera Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: shader::TEXTURE_BINDING,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: shader::SAMPLER_BINDING,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: shader::TRANSFORM_BINDING,
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
            label: Some("Camera Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Camera Render Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vertex_module,
                entry_point: Some(shader::ENTRY_POINT),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                entry_point: Some(shader::ENTRY_POINT),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Camera Quad"),
            contents: bytemuck::cast_slice(QuadVertex::STRIP),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let uniform = TransformUniform::new(self.orientation.matrix(), self.viewport.as_ref());
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Camera Transform"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Camera Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        self.gpu = Some(GpuState {
            pipeline,
            bind_group_layout,
            sampler,
            vertex_buffer,
            uniform_buffer,
            camera: None,
        });
        self.uniforms_dirty = false;
        self.attach();
        info!(?format, "Frame presenter ready");
        Ok(())
    }

    /// Routes the surface's frame-available notifications to the signal.
    pub fn attach(&self) {
        let signal = Arc::clone(&self.signal);
        self.surface
            .set_on_frame_available(Arc::new(move || signal.notify_frame_available()));
    }

    /// Drops GPU resources; the next `initialize` starts over.
    pub fn release(&mut self) {
        self.surface.clear_on_frame_available();
        self.gpu = None;
        self.fitter.invalidate();
        self.uniforms_dirty = true;
    }

    pub fn on_surface_changed(&mut self, width: u32, height: u32, rotation: DisplayRotation) {
        self.surface_size = (width, height);
        if self
            .orientation
            .on_surface_changed(rotation, DisplayOrientation::from_size(width, height))
        {
            self.uniforms_dirty = true;
        }
        self.refresh_viewport();
    }

    pub fn on_orientation_event(&mut self, rotation: DisplayRotation) {
        if self.orientation.on_orientation_event(rotation) {
            self.uniforms_dirty = true;
        }
    }

    pub fn set_facing(&mut self, facing: Facing) {
        if self.orientation.set_facing(facing) {
            self.uniforms_dirty = true;
        }
    }

    pub fn set_scale_type(&mut self, scale_type: ScaleType) {
        if self.scale_type != scale_type {
            info!(?scale_type, "Scale type changed");
            self.scale_type = scale_type;
            self.refresh_viewport();
        }
    }

    pub fn scale_type(&self) -> ScaleType {
        self.scale_type
    }

    pub fn rotation_matrix(&self) -> &RotationMatrix {
        self.orientation.matrix()
    }

    pub fn viewport_rect(&self) -> Option<ViewportRect> {
        self.fitter.current()
    }

    /// Visible part of the viewport, as issued to the render pass.
    pub fn viewport(&self) -> Option<ClippedViewport> {
        self.viewport
    }

    /// How many times the viewport actually changed.
    pub fn viewport_updates(&self) -> u64 {
        self.fitter.updates()
    }

    /// Clears the pending flag and takes the newest image, if one was signalled.
    /// The viewport is refit since the image size may have changed.
    pub fn latch_pending_image(&mut self) -> Option<VideoFrame> {
        if !self.signal.take_pending() {
            return None;
        }
        let frame = self.surface.take_latest();
        if let Some(frame) = &frame {
            self.image_size = Some(frame.size());
        }
        self.refresh_viewport();
        frame
    }

    fn refresh_viewport(&mut self) {
        let Some(image) = self.image_size.or_else(|| self.surface.default_buffer_size()) else {
            return;
        };
        let (surface_width, surface_height) = self.surface_size;
        if surface_width == 0 || surface_height == 0 {
            return;
        }
        // Sensor frames are landscape; in portrait the displayed image is transposed.
        let (image_width, image_height) = if self.orientation.orientation().is_portrait() {
            (image.height, image.width)
        } else {
            (image.width, image.height)
        };
        self.fitter
            .update(image_width, image_height, surface_width, surface_height, self.scale_type);
        let viewport = self
            .fitter
            .current()
            .and_then(|rect| rect.clip_to(surface_width, surface_height));
        if viewport != self.viewport {
            self.viewport = viewport;
            self.uniforms_dirty = true;
        }
    }

    /// Uploads a pending image if there is one, then draws the quad into `target`.
    pub fn draw(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, target: &wgpu::TextureView) -> Result<()> {
        if self.gpu.is_none() {
            return Err(PipelineError::Gpu("presenter drawn before initialization".into()));
        }

        if let Some(frame) = self.latch_pending_image() {
            self.upload(device, queue, &frame);
        }

        let Some(gpu) = self.gpu.as_ref() else {
            return Ok(());
        };
        if self.uniforms_dirty {
            let uniform = TransformUniform::new(self.orientation.matrix(), self.viewport.as_ref());
            queue.write_buffer(&gpu.uniform_buffer, 0, bytemuck::bytes_of(&uniform));
            self.uniforms_dirty = false;
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Camera Render Encoder"),
        });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Camera Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            if let (Some(camera), Some(viewport)) = (&gpu.camera, self.viewport) {
                render_pass.set_viewport(
                    viewport.x as f32,
                    viewport.y as f32,
                    viewport.width as f32,
                    viewport.height as f32,
                    0.0,
                    1.0,
                );
                render_pass.set_pipeline(&gpu.pipeline);
                render_pass.set_bind_group(0, &camera.bind_group, &[]);
                render_pass.set_vertex_buffer(0, gpu.vertex_buffer.slice(..));
                render_pass.draw(0..QuadVertex::STRIP.len() as u32, 0..1);
            }
        }
        queue.submit(std::iter::once(encoder.finish()));

        if let Some(fps) = self.draw_rate.update() {
            debug!(fps, "Presenter draw rate");
        }
        Ok(())
    }

    fn upload(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, frame: &VideoFrame) {
        let rgba = if frame.format == PixelFormat::Rgba {
            Cow::Borrowed(frame)
        } else {
            match frame.to_rgba() {
                Ok(converted) => Cow::Owned(converted),
                Err(err) => {
                    warn!(%err, "Skipping camera image that could not be converted");
                    return;
                }
            }
        };
        let size = rgba.size();
        if rgba.data.len() < size.pixel_count() * 4 {
            warn!(%size, bytes = rgba.data.len(), "Skipping truncated camera image");
            return;
        }

        let Some(gpu) = self.gpu.as_mut() else {
            return;
        };
        if gpu.camera.as_ref().map(|camera| camera.size) != Some(size) {
            debug!(%size, "Allocating camera texture");
            gpu.camera = Some(create_camera_texture(device, gpu, size));
        }
        let Some(camera) = gpu.camera.as_ref() else {
            return;
        };

        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &camera.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &rgba.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.width * 4),
                rows_per_image: Some(size.height),
            },
            wgpu::Extent3d {
                width: size.width,
                height: size.height,
                depth_or_array_layers: 1,
            },
        );
    }
}

fn create_camera_texture(device: &wgpu::Device, gpu: &GpuState, size: CaptureSize) -> CameraTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Camera Texture"),
        size: wgpu::Extent3d {
            width: size.width,
            height: size.height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8UnormSrgb,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Camera Bind Group"),
        layout: &gpu.bind_group_layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: shader::TEXTURE_BINDING,
                resource: wgpu::BindingResource::TextureView(&view),
            },
            wgpu::BindGroupEntry {
                binding: shader::SAMPLER_BINDING,
                resource: wgpu::BindingResource::Sampler(&gpu.sampler),
            },
            wgpu::BindGroupEntry {
                binding: shader::TRANSFORM_BINDING,
                resource: gpu.uniform_buffer.as_entire_binding(),
            },
        ],
    });
    CameraTexture {
        texture,
        bind_group,
        size,
    }
}

impl std::fmt::Debug for FramePresenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePresenter")
            .field("state", &self.state())
            .field("scale_type", &self.scale_type)
            .field("surface_size", &self.surface_size)
            .field("viewport", &self.viewport)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn presenter(facing: Facing) -> (FramePresenter, Arc<ExternalSurface>, Arc<AtomicUsize>) {
        let surface = Arc::new(ExternalSurface::new());
        let renders = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&renders);
        let signal = Arc::new(FrameSignal::new(
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        ));
        let presenter = FramePresenter::new(Arc::clone(&surface), signal, facing, ScaleType::CenterCrop);
        (presenter, surface, renders)
    }

    fn rgba(width: u32, height: u32) -> VideoFrame {
        VideoFrame::from_data(width, height, PixelFormat::Rgba, vec![0; (width * height * 4) as usize])
    }

    #[test]
    fn starts_uninitialized() {
        let (presenter, _, _) = presenter(Facing::Back);
        assert_eq!(presenter.state(), PresenterState::Uninitialized);
        assert_eq!(presenter.viewport(), None);
    }

    #[test]
    fn notification_marks_pending_and_requests_redraw() {
        let (mut presenter, surface, renders) = presenter(Facing::Back);
        presenter.attach();
        presenter.on_surface_changed(1280, 720, DisplayRotation::Rotation0);

        surface.queue_image(rgba(640, 480));
        assert_eq!(renders.load(Ordering::SeqCst), 1);

        let latched = presenter.latch_pending_image().unwrap();
        assert_eq!(latched.size(), CaptureSize::new(640, 480));
        assert!(presenter.latch_pending_image().is_none());

        let rect = presenter.viewport_rect().unwrap();
        assert_eq!(rect, ViewportRect::new(0, -120, 1280, 960));
        let visible = presenter.viewport().unwrap();
        assert_eq!((visible.x, visible.y, visible.width, visible.height), (0, 0, 1280, 720));
    }

    #[test]
    fn portrait_transposes_image_before_fitting() {
        let (mut presenter, surface, _) = presenter(Facing::Front);
        surface.set_default_buffer_size(CaptureSize::new(1920, 1080));
        presenter.on_surface_changed(1080, 1920, DisplayRotation::Rotation0);

        assert_eq!(presenter.viewport_rect(), Some(ViewportRect::new(0, 0, 1080, 1920)));
        assert_eq!(*presenter.rotation_matrix(), RotationMatrix::about_z(90));
    }

    #[test]
    fn repeated_surface_change_does_not_refit() {
        let (mut presenter, surface, _) = presenter(Facing::Back);
        surface.set_default_buffer_size(CaptureSize::new(640, 480));
        presenter.on_surface_changed(800, 600, DisplayRotation::Rotation0);
        presenter.on_surface_changed(800, 600, DisplayRotation::Rotation0);
        assert_eq!(presenter.viewport_updates(), 1);

        presenter.set_scale_type(ScaleType::FitStart);
        assert_eq!(presenter.viewport_updates(), 1);
        presenter.on_surface_changed(1000, 600, DisplayRotation::Rotation0);
        assert_eq!(presenter.viewport_updates(), 1);
        assert_eq!(presenter.viewport_rect(), Some(ViewportRect::new(0, 0, 800, 600)));

        presenter.set_scale_type(ScaleType::FitEnd);
        assert_eq!(presenter.viewport_updates(), 2);
        assert_eq!(presenter.viewport_rect(), Some(ViewportRect::new(200, 0, 800, 600)));
    }

    #[test]
    fn uniform_layout_matches_std140_block() {
        assert_eq!(std::mem::size_of::<TransformUniform>(), 80);
        let uniform = TransformUniform::new(&RotationMatrix::IDENTITY, None);
        assert_eq!(uniform.uv_scale, [1.0, 1.0]);
    }
}
