//! winit window backing the presenter.

use super::orientation::DisplayRotation;
use super::presenter::FramePresenter;
use crate::error::{PipelineError, Result};
use crate::shader::GpuContext;
use std::sync::Arc;
use tracing::{info, warn};
use winit::dpi::PhysicalSize;
use winit::window::Window;

/// Owns the window surface and drives the presenter on the render thread.
pub struct WindowTarget {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    gpu: GpuContext,
    config: wgpu::SurfaceConfiguration,
    presenter: FramePresenter,
    rotation: DisplayRotation,
}

impl WindowTarget {
    /// Sets up the GPU for `window` and initializes the presenter.
    pub fn new(window: Arc<Window>, mut presenter: FramePresenter, rotation: DisplayRotation) -> Result<Self> {
        let (gpu, surface) = GpuContext::with_window(Arc::clone(&window))?;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&gpu.adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first())
            .copied()
            .ok_or_else(|| PipelineError::Gpu("surface reports no formats".into()))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&gpu.device, &config);

        presenter.initialize(&gpu.device, surface_format)?;
        presenter.on_surface_changed(config.width, config.height, rotation);
        info!(width = config.width, height = config.height, format = ?surface_format, "Window surface configured");

        Ok(Self {
            window,
            surface,
            gpu,
            config,
            presenter,
            rotation,
        })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn presenter(&self) -> &FramePresenter {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut FramePresenter {
        &mut self.presenter
    }

    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.gpu.device, &self.config);
            self.presenter
                .on_surface_changed(new_size.width, new_size.height, self.rotation);
        }
    }

    /// Simulated display rotation change.
    pub fn set_rotation(&mut self, rotation: DisplayRotation) {
        self.rotation = rotation;
        self.presenter.on_orientation_event(rotation);
    }

    pub fn rotation(&self) -> DisplayRotation {
        self.rotation
    }

    /// Draws one frame and presents it.
    pub fn render(&mut self) -> Result<()> {
        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                warn!("Surface lost, reconfiguring");
                self.surface.configure(&self.gpu.device, &self.config);
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => return Ok(()),
            Err(err) => return Err(PipelineError::Gpu(format!("failed to acquire surface texture: {err}"))),
        };
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        self.presenter.draw(&self.gpu.device, &self.gpu.queue, &view)?;
        self.window.pre_present_notify();
        output.present();
        Ok(())
    }
}
