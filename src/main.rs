//! Periscope: live camera preview with a CPU frame path.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use periscope::capture::acquire::{PackedFrame, PackedFrameConsumer};
use periscope::capture::{CameraHost, Facing};
use periscope::config::{ConfigWatcher, PipelineConfig};
use periscope::error::PipelineError;
use periscope::pipeline::CameraPipeline;
use periscope::render::{DisplayRotation, RenderRequester, ScaleType, WindowTarget};
use periscope::utils::FpsCounter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop, EventLoopProxy};
use winit::keyboard::Key;
use winit::window::{Window, WindowAttributes, WindowId};

/// Live camera preview with GPU presentation and CPU frame hooks.
#[derive(Parser, Debug)]
#[command(name = "periscope")]
#[command(about = "Preview a camera with orientation-aware scaling and a CPU frame path")]
struct Args {
    /// YAML config file, watched for changes in window mode
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Desired capture width
    #[arg(long)]
    width: Option<u32>,

    /// Desired capture height
    #[arg(long)]
    height: Option<u32>,

    /// Camera facing to open
    #[arg(long, value_enum)]
    facing: Option<Facing>,

    /// How the image is fitted into the window
    #[arg(long, value_enum)]
    scale_type: Option<ScaleType>,

    /// Redraw after each CPU conversion instead of on every camera frame
    #[arg(long)]
    sync: bool,

    /// Simulated display rotation in degrees (0, 90, 180, 270)
    #[arg(long, default_value = "0", value_parser = parse_rotation)]
    rotation: DisplayRotation,

    /// Run the CPU path only, without a window
    #[arg(long)]
    headless: bool,

    /// List available cameras and exit
    #[arg(long)]
    list_devices: bool,
}

fn parse_rotation(value: &str) -> std::result::Result<DisplayRotation, String> {
    let degrees: u32 = value.parse().map_err(|e| format!("{e}"))?;
    DisplayRotation::from_degrees(degrees).ok_or_else(|| format!("{degrees} is not one of 0, 90, 180, 270"))
}

impl Args {
    /// Config file values with command line overrides applied.
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(facing) = self.facing {
            config.facing = facing;
        }
        if let Some(scale_type) = self.scale_type {
            config.scale_type = scale_type;
        }
        if self.sync {
            config.sync_preview_and_processing = true;
        }
        Ok(config)
    }
}

#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
fn camera_host(facing: Facing) -> Result<Arc<dyn CameraHost>> {
    Ok(Arc::new(periscope::capture::NokhwaHost::new(facing)))
}

#[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
fn camera_host(_facing: Facing) -> Result<Arc<dyn CameraHost>> {
    bail!("no camera backend for this platform")
}

/// Logs the CPU path frame rate.
fn logging_consumer(label: &'static str) -> PackedFrameConsumer {
    let rate = Mutex::new(FpsCounter::new());
    Arc::new(move |frame: PackedFrame<'_>| {
        let mut rate = rate.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(fps) = rate.update() {
            debug!("[Perf] {} converting at {:.2} FPS ({}x{})", label, fps, frame.width, frame.height);
        }
    })
}

#[derive(Debug)]
enum UserEvent {
    Redraw,
    CaptureFailed(PipelineError),
}

fn redraw_requester(proxy: EventLoopProxy<UserEvent>) -> RenderRequester {
    let proxy = Mutex::new(proxy);
    Arc::new(move || {
        // Fails only once the event loop has exited.
        let _ = proxy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send_event(UserEvent::Redraw);
    })
}

/// Application state for the event loop.
struct PeriscopeApp {
    pipeline: CameraPipeline,
    rotation: DisplayRotation,
    target: Option<WindowTarget>,
    watcher: Option<ConfigWatcher>,
    failure: Option<PipelineError>,
}

impl PeriscopeApp {
    fn request_redraw(&self) {
        if let Some(target) = &self.target {
            target.window().request_redraw();
        }
    }

    fn create_target(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let config = self.pipeline.config();
        let window_attrs = WindowAttributes::default()
            .with_title("Periscope")
            .with_inner_size(PhysicalSize::new(config.width, config.height));
        let window: Arc<Window> = Arc::new(event_loop.create_window(window_attrs)?);
        let target = WindowTarget::new(window, self.pipeline.presenter(), self.rotation)?;
        info!("Window created successfully");
        self.target = Some(target);
        Ok(())
    }

    fn rotate(&mut self) {
        let Some(target) = &mut self.target else {
            return;
        };
        let next = DisplayRotation::quantize(target.rotation().degrees() as i32 + 90);
        info!(degrees = next.degrees(), "Display rotation changed");
        target.set_rotation(next);
        target.window().request_redraw();
    }

    fn cycle_scale_type(&mut self) {
        let Some(target) = &mut self.target else {
            return;
        };
        let all = ScaleType::value_variants();
        let current = target.presenter().scale_type();
        let index = all.iter().position(|s| *s == current).unwrap_or(0);
        target.presenter_mut().set_scale_type(all[(index + 1) % all.len()]);
        target.window().request_redraw();
    }

    fn check_config(&mut self) {
        let Some(changes) = self.watcher.as_mut().and_then(|w| w.check_for_changes()) else {
            return;
        };
        self.pipeline.apply_live_changes(&changes);
        if let (Some(scale_type), Some(target)) = (changes.scale_type, &mut self.target) {
            target.presenter_mut().set_scale_type(scale_type);
        }
        self.request_redraw();
    }
}

impl ApplicationHandler<UserEvent> for PeriscopeApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.target.is_none() {
            if let Err(e) = self.create_target(event_loop) {
                error!("Failed to set up window: {:#}", e);
                event_loop.exit();
                return;
            }
        }

        match self.pipeline.resume() {
            Ok(size) => info!("Camera streaming at {}", size),
            Err(e) => {
                error!("Failed to open camera: {}", e);
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        self.pipeline.pause();
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: UserEvent) {
        match event {
            UserEvent::Redraw => self.request_redraw(),
            UserEvent::CaptureFailed(e) => {
                error!("Camera failed: {}", e);
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window closed");
                self.pipeline.pause();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(target) = &mut self.target {
                    target.resize(size);
                }
            }
            WindowEvent::KeyboardInput { event, .. } if event.state == ElementState::Pressed => {
                match event.logical_key.as_ref() {
                    Key::Character("r") => self.rotate(),
                    Key::Character("s") => self.cycle_scale_type(),
                    _ => {}
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(target) = &mut self.target {
                    if let Err(e) = target.render() {
                        error!("Render error: {}", e);
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        self.check_config();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = args.pipeline_config()?;

    if args.list_devices {
        println!("Available cameras:");
        match camera_host(config.facing)?.devices() {
            Ok(devices) => {
                for device in devices {
                    let sizes: Vec<String> = device.output_sizes.iter().map(|s| s.to_string()).collect();
                    println!("  [{}] {} ({})", device.id, device.name, sizes.join(", "));
                }
            }
            Err(e) => eprintln!("Failed to list devices: {}", e),
        }
        return Ok(());
    }

    info!("Starting Periscope...");
    if args.headless {
        run_headless(config)
    } else {
        run_window(args, config)
    }
}

/// Window mode: preview plus CPU path.
fn run_window(args: Args, config: PipelineConfig) -> Result<()> {
    let event_loop = EventLoop::<UserEvent>::with_user_event().build()?;
    event_loop.set_control_flow(ControlFlow::Wait);

    let proxy = event_loop.create_proxy();
    let host = camera_host(config.facing)?;
    let pipeline = CameraPipeline::new(
        host,
        config.clone(),
        redraw_requester(proxy.clone()),
        logging_consumer("Preview"),
    )?;
    let failures = Mutex::new(proxy);
    pipeline.set_error_listener(Arc::new(move |err: &PipelineError| {
        let _ = failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send_event(UserEvent::CaptureFailed(err.clone()));
    }));

    let watcher = match args.config {
        Some(path) => match ConfigWatcher::new(path, config) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Config hot reload disabled: {:#}", e);
                None
            }
        },
        None => None,
    };

    let mut app = PeriscopeApp {
        pipeline,
        rotation: args.rotation,
        target: None,
        watcher,
        failure: None,
    };
    event_loop.run_app(&mut app)?;
    app.pipeline.shutdown();

    match app.failure {
        Some(e) => Err(e).context("camera pipeline stopped"),
        None => Ok(()),
    }
}

/// Headless mode: CPU path only, until Ctrl-C.
fn run_headless(config: PipelineConfig) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let host = camera_host(config.facing)?;
    let pipeline = CameraPipeline::headless(host, config, logging_consumer("Headless"))?;
    let failed = Arc::new(AtomicBool::new(false));
    let f = failed.clone();
    pipeline.set_error_listener(Arc::new(move |err: &PipelineError| {
        error!("Camera failed: {}", err);
        f.store(true, Ordering::SeqCst);
    }));

    let size = pipeline.resume()?;
    info!("Headless capture running at {}", size);

    let mut rate = FpsCounter::with_interval(Duration::from_secs(5));
    let mut last_processed = 0;
    while running.load(Ordering::SeqCst) && !failed.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
        let processor = pipeline.processor();
        let processed = processor.frames_processed();
        let delta = (processed - last_processed) as u32;
        last_processed = processed;
        if let Some(fps) = rate.record(delta, std::time::Instant::now()) {
            info!(
                processed,
                dropped = processor.frames_dropped(),
                skipped = processor.frames_skipped(),
                last_us = processor.last_processing_time_us(),
                "CPU path: {:.2} FPS",
                fps
            );
        }
    }

    pipeline.pause();
    pipeline.shutdown();
    if failed.load(Ordering::SeqCst) {
        bail!("camera pipeline stopped after a capture failure");
    }
    info!("Headless capture stopped");
    Ok(())
}
