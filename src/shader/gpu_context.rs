//! wgpu device setup for a window surface.

use crate::error::{PipelineError, Result};
use std::sync::Arc;
use tracing::info;
use winit::window::Window;

/// Device, queue and the adapter they came from.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
}

impl GpuContext {
    /// Creates a surface for `window` and a device able to present to it.
    pub fn with_window(window: Arc<Window>) -> Result<(Self, wgpu::Surface<'static>)> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window)
            .map_err(|e| PipelineError::Gpu(format!("failed to create surface: {e}")))?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .map_err(|e| PipelineError::Gpu(format!("failed to obtain GPU adapter: {e:?}")))?;
        info!(adapter = %adapter.get_info().name, backend = ?adapter.get_info().backend, "Using GPU adapter");

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Periscope Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| PipelineError::Gpu(format!("failed to create device: {e}")))?;

        Ok((
            Self {
                device,
                queue,
                instance,
                adapter,
            },
            surface,
        ))
    }
}
