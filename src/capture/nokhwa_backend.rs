//! Nokhwa-based webcam host.
//!
//! Each opened device gets a capture thread that owns the `nokhwa::Camera`
//! (it is not `Send` on every platform). Device and session handles talk to
//! that thread over a command channel; frames are decoded to RGB there and
//! written to the session outputs.

use super::{
    CameraHost, CaptureRequest, DeviceCallback, DeviceEvent, DeviceInfo, Facing, HostDevice, HostSession,
    OutputSurface, SessionCallback, SessionConfig, SessionEvent,
};
use crate::error::HostError;
use crate::frame::{CaptureSize, PixelFormat, VideoFrame};
use anyhow::{anyhow, Context, Result};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Sizes offered when the driver does not report its formats.
const FALLBACK_SIZES: [(u32, u32); 3] = [(1920, 1080), (1280, 720), (640, 480)];

/// Consecutive failed reads after which the device counts as disconnected.
const MAX_FRAME_ERRORS: u32 = 30;

/// Formats tried in order until one opens a stream: uncompressed first for
/// built-in cameras, MJPEG for USB webcams.
fn seed_formats() -> Vec<CameraFormat> {
    let mut seeds = Vec::new();
    for (width, height) in FALLBACK_SIZES {
        for fps in [30, 25, 15] {
            for format in [FrameFormat::NV12, FrameFormat::YUYV, FrameFormat::MJPEG] {
                seeds.push(CameraFormat::new(Resolution::new(width, height), format, fps));
            }
        }
    }
    seeds
}

fn camera_index(id: &str) -> CameraIndex {
    match id.parse::<u32>() {
        Ok(index) => CameraIndex::Index(index),
        Err(_) => CameraIndex::String(id.to_string()),
    }
}

/// Opens `index` with the first seed format that actually streams.
fn open_camera(index: &CameraIndex) -> Result<Camera> {
    for seed in seed_formats() {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(seed));
        if let Ok(mut camera) = Camera::new(index.clone(), requested) {
            // Some drivers accept the format but fail when streaming starts.
            if camera.open_stream().is_ok() {
                info!("Verified connection with seed format: {:?}", seed);
                return Ok(camera);
            }
        }
    }
    Err(anyhow!("could not open a stream on camera {} with any standard format", index))
}

/// Webcams found through nokhwa, all reported with one configured facing.
///
/// Desktop drivers do not say which way a camera points.
pub struct NokhwaHost {
    facing: Facing,
    sizes: Mutex<HashMap<String, Vec<CaptureSize>>>,
}

impl NokhwaHost {
    pub fn new(facing: Facing) -> Self {
        Self {
            facing,
            sizes: Mutex::new(HashMap::new()),
        }
    }

    /// Output sizes for a device, queried once and cached.
    fn output_sizes(&self, id: &str) -> Vec<CaptureSize> {
        let mut cache = self.sizes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sizes) = cache.get(id) {
            return sizes.clone();
        }
        let sizes = match query_sizes(&camera_index(id)) {
            Ok(sizes) if !sizes.is_empty() => sizes,
            Ok(_) => {
                warn!(device = id, "Device reported no formats, using fallback sizes");
                fallback_sizes()
            }
            Err(e) => {
                warn!(device = id, "Failed to query formats ({:#}), using fallback sizes", e);
                fallback_sizes()
            }
        };
        cache.insert(id.to_string(), sizes.clone());
        sizes
    }
}

fn fallback_sizes() -> Vec<CaptureSize> {
    FALLBACK_SIZES.iter().map(|&(w, h)| CaptureSize::new(w, h)).collect()
}

/// Distinct sizes the driver reports, largest first.
fn query_sizes(index: &CameraIndex) -> Result<Vec<CaptureSize>> {
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution);
    let mut camera = Camera::new(index.clone(), requested).context("failed to probe camera")?;
    let formats = camera
        .compatible_camera_formats()
        .context("failed to list camera formats")?;

    let mut sizes: Vec<CaptureSize> = formats
        .iter()
        .map(|format| CaptureSize::new(format.width(), format.height()))
        .collect();
    sizes.sort_by_key(|size| std::cmp::Reverse(size.pixel_count()));
    sizes.dedup();
    Ok(sizes)
}

impl CameraHost for NokhwaHost {
    fn devices(&self) -> Result<Vec<DeviceInfo>, HostError> {
        let cameras = nokhwa::query(ApiBackend::Auto).map_err(|e| HostError::Backend(e.to_string()))?;
        let devices = cameras
            .into_iter()
            .map(|camera| {
                let id = camera.index().to_string();
                DeviceInfo {
                    output_sizes: self.output_sizes(&id),
                    name: camera.human_name().to_string(),
                    facing: self.facing,
                    id,
                }
            })
            .collect::<Vec<_>>();
        debug!(count = devices.len(), "Enumerated cameras");
        Ok(devices)
    }

    fn open_device(&self, id: &str, callback: DeviceCallback) -> Result<(), HostError> {
        let index = camera_index(id);
        let device_id = id.to_string();
        thread::Builder::new()
            .name(format!("nokhwa-capture-{id}"))
            .spawn(move || capture_thread(index, device_id, callback))
            .map_err(|e| HostError::Backend(format!("failed to spawn capture thread: {e}")))?;
        Ok(())
    }
}

enum Command {
    /// Carries the sender the configured session will hold
    Configure(SessionConfig, SessionCallback, Sender<Command>),
    Streaming(bool),
    Close,
}

fn send(commands: &Sender<Command>, command: Command) -> Result<(), HostError> {
    commands
        .send(command)
        .map_err(|_| HostError::Backend("capture thread has exited".into()))
}

fn capture_thread(index: CameraIndex, id: String, mut callback: DeviceCallback) {
    let mut camera = match open_camera(&index) {
        Ok(camera) => camera,
        Err(e) => {
            error!(device = %id, "{:#}", e);
            callback(DeviceEvent::Error(e.to_string()));
            return;
        }
    };
    info!(device = %id, resolution = %camera.resolution(), "Camera opened");

    let (tx, rx) = mpsc::channel();
    callback(DeviceEvent::Opened(Box::new(NokhwaDevice {
        id: id.clone(),
        commands: tx,
        closed: false,
    })));
    run_capture_loop(&mut camera, &id, &rx, &mut callback);

    if let Err(e) = camera.stop_stream() {
        warn!(device = %id, "Failed to stop camera stream: {}", e);
    }
    info!(device = %id, "Capture thread exiting");
}

/// Serves commands and, while streaming, reads frames until closed.
///
/// Session handles hold their own sender, so the loop also ends once every
/// handle is gone.
fn run_capture_loop(camera: &mut Camera, id: &str, rx: &Receiver<Command>, callback: &mut DeviceCallback) {
    let started = Instant::now();
    let mut outputs: Vec<OutputSurface> = Vec::new();
    let mut streaming = false;
    let mut errors = 0u32;

    loop {
        let command = if streaming {
            match rx.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => return,
            }
        } else {
            match rx.recv() {
                Ok(command) => Some(command),
                Err(_) => return,
            }
        };

        match command {
            Some(Command::Configure(config, mut session_callback, commands)) => match configure(camera, config.size) {
                Ok(()) => {
                    outputs = config.outputs;
                    session_callback(SessionEvent::Configured(Box::new(NokhwaSession {
                        commands,
                        closed: false,
                    })));
                }
                Err(e) => session_callback(SessionEvent::ConfigureFailed(format!("{e:#}"))),
            },
            Some(Command::Streaming(on)) => {
                debug!(device = %id, on, "Streaming toggled");
                streaming = on;
            }
            Some(Command::Close) => return,
            None => match read_frame(camera, started) {
                Ok(frame) => {
                    errors = 0;
                    route(&frame, &outputs);
                }
                Err(e) => {
                    errors += 1;
                    warn!(device = %id, "Frame capture failed: {:#}", e);
                    if errors >= MAX_FRAME_ERRORS {
                        error!(device = %id, "Camera stopped delivering frames");
                        callback(DeviceEvent::Disconnected);
                        return;
                    }
                }
            },
        }
    }
}

/// Switches the stream to the format closest to `size`.
fn configure(camera: &mut Camera, size: CaptureSize) -> Result<()> {
    let current = camera.resolution();
    if current.width() == size.width && current.height() == size.height {
        return Ok(());
    }

    let previous = camera.camera_format();
    camera.stop_stream().context("failed to stop stream for reconfiguration")?;
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(CameraFormat::new(
        Resolution::new(size.width, size.height),
        previous.format(),
        previous.frame_rate(),
    )));
    let switched = camera
        .set_camera_requset(requested)
        .context("camera rejected the requested format")
        .and_then(|format| {
            camera.open_stream().context("failed to open stream")?;
            Ok(format)
        });

    match switched {
        Ok(format) => {
            info!(requested = %size, actual = %format.resolution(), "Camera format switched");
            Ok(())
        }
        Err(e) => {
            // Best effort: go back to the format that was streaming.
            warn!("Failed to switch camera format ({:#}), restoring {:?}", e, previous);
            let restore = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Exact(previous));
            if camera.set_camera_requset(restore).is_ok() && camera.open_stream().is_ok() {
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

fn read_frame(camera: &mut Camera, started: Instant) -> Result<VideoFrame> {
    let frame = camera.frame().context("failed to read frame")?;
    let resolution = frame.resolution();
    let decoded = frame.decode_image::<RgbFormat>().context("failed to decode frame")?;
    Ok(
        VideoFrame::from_data(resolution.width(), resolution.height(), PixelFormat::Rgb, decoded.into_raw())
            .with_timestamp(started.elapsed().as_nanos() as u64),
    )
}

/// Writes one frame to every output in the format it expects.
fn route(frame: &VideoFrame, outputs: &[OutputSurface]) {
    for output in outputs {
        let delivered = match output {
            OutputSurface::Display(surface) => frame.to_rgba().map(|rgba| surface.queue_image(rgba)),
            OutputSurface::Reader(reader) => frame
                .to_nv12()
                .and_then(|nv12| nv12.to_planar_frame())
                .map(|planar| reader.push(planar)),
        };
        if let Err(e) = delivered {
            warn!(?output, "Dropping frame for output: {:#}", e);
        }
    }
}

struct NokhwaDevice {
    id: String,
    commands: Sender<Command>,
    closed: bool,
}

impl HostDevice for NokhwaDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_session(&mut self, config: SessionConfig, callback: SessionCallback) -> Result<(), HostError> {
        if self.closed {
            return Err(HostError::Backend("device closed".into()));
        }
        let commands = Sender::clone(&self.commands);
        send(&self.commands, Command::Configure(config, callback, commands))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // The thread may already be gone after a disconnect.
        let _ = self.commands.send(Command::Close);
        debug!(device = %self.id, "Camera device closed");
    }
}

impl Drop for NokhwaDevice {
    fn drop(&mut self) {
        self.close();
    }
}

struct NokhwaSession {
    commands: Sender<Command>,
    closed: bool,
}

impl HostSession for NokhwaSession {
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), HostError> {
        if self.closed {
            return Err(HostError::Backend("session closed".into()));
        }
        // Webcams run their own focus and exposure; the request only starts the stream.
        debug!(?request, "Starting repeating request");
        send(&self.commands, Command::Streaming(true))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.commands.send(Command::Streaming(false));
    }
}

impl Drop for NokhwaSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_map_to_indices() {
        assert_eq!(camera_index("2"), CameraIndex::Index(2));
        assert_eq!(camera_index("/dev/video0"), CameraIndex::String("/dev/video0".into()));
    }

    #[test]
    fn seeds_cover_every_fallback_size() {
        let seeds = seed_formats();
        assert_eq!(seeds.len(), FALLBACK_SIZES.len() * 9);
        assert_eq!(seeds[0].format(), FrameFormat::NV12);
        for (w, h) in FALLBACK_SIZES {
            assert!(seeds.iter().any(|s| s.width() == w && s.height() == h));
        }
    }
}
