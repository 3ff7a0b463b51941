//! Camera capture: host capabilities, the capture session and the frame path.
//!
//! The host (platform camera stack) is reached only through the traits in this
//! module. Its asynchronous callbacks are plain closures receiving tagged events.

pub mod acquire;
#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
mod nokhwa_backend;
pub mod reader;
pub mod session;
pub mod worker;

#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
pub use nokhwa_backend::NokhwaHost;

use crate::error::HostError;
use crate::frame::CaptureSize;
use crate::render::surface::ExternalSurface;
use reader::FrameReader;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which way the sensor faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Facing {
    /// Towards the user (selfie / webcam)
    Front,
    /// Away from the user
    Back,
}

/// A capture device as enumerated by the host.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Host-specific identifier passed back to [`CameraHost::open_device`]
    pub id: String,
    /// Human-readable name
    pub name: String,
    pub facing: Facing,
    /// Output sizes supported for the display/reader surfaces
    pub output_sizes: Vec<CaptureSize>,
}

/// Outcome of an asynchronous device open.
pub enum DeviceEvent {
    Opened(Box<dyn HostDevice>),
    Disconnected,
    Error(String),
}

/// Outcome of an asynchronous session configuration.
pub enum SessionEvent {
    Configured(Box<dyn HostSession>),
    ConfigureFailed(String),
}

impl std::fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEvent::Opened(device) => write!(f, "Opened({})", device.id()),
            DeviceEvent::Disconnected => write!(f, "Disconnected"),
            DeviceEvent::Error(reason) => write!(f, "Error({reason})"),
        }
    }
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Configured(_) => write!(f, "Configured"),
            SessionEvent::ConfigureFailed(reason) => write!(f, "ConfigureFailed({reason})"),
        }
    }
}

/// Receives device state changes. May be invoked on any host thread.
pub type DeviceCallback = Box<dyn FnMut(DeviceEvent) + Send>;

/// Receives session configuration results. May be invoked on any host thread.
pub type SessionCallback = Box<dyn FnMut(SessionEvent) + Send>;

/// A destination the capture stream writes into.
#[derive(Clone)]
pub enum OutputSurface {
    /// Displayable surface backing the external texture
    Display(Arc<ExternalSurface>),
    /// Off-screen planar frame reader for the CPU path
    Reader(Arc<FrameReader>),
}

impl std::fmt::Debug for OutputSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSurface::Display(_) => write!(f, "Display"),
            OutputSurface::Reader(_) => write!(f, "Reader"),
        }
    }
}

/// Size and destinations bound to one capture session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub size: CaptureSize,
    pub outputs: Vec<OutputSurface>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    Preview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoFocusMode {
    Off,
    ContinuousPicture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoExposureMode {
    Off,
    On,
    OnAutoFlash,
}

/// The single repeating request driving a streaming session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub template: RequestTemplate,
    pub af_mode: AutoFocusMode,
    pub ae_mode: AutoExposureMode,
    /// Number of output surfaces targeted by the request
    pub target_count: usize,
}

impl CaptureRequest {
    /// Preview request with continuous autofocus and auto exposure.
    pub fn preview(target_count: usize) -> Self {
        Self {
            template: RequestTemplate::Preview,
            af_mode: AutoFocusMode::ContinuousPicture,
            ae_mode: AutoExposureMode::OnAutoFlash,
            target_count,
        }
    }
}

/// Platform camera stack.
pub trait CameraHost: Send + Sync {
    /// Lists capture devices and the output sizes each supports.
    fn devices(&self) -> Result<Vec<DeviceInfo>, HostError>;

    /// Starts opening a device. The result is delivered through `callback`.
    fn open_device(&self, id: &str, callback: DeviceCallback) -> Result<(), HostError>;
}

/// An opened capture device.
pub trait HostDevice: Send {
    fn id(&self) -> &str;

    /// Binds output surfaces. The result is delivered through `callback`.
    fn create_session(&mut self, config: SessionConfig, callback: SessionCallback) -> Result<(), HostError>;

    /// Releases the device. Must be safe to call more than once.
    fn close(&mut self);
}

/// A configured capture session.
pub trait HostSession: Send {
    /// Replaces the repeating request; frames start flowing to the outputs.
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), HostError>;

    /// Stops the stream. Must be safe to call more than once.
    fn close(&mut self);
}

/// Picks the supported size closest to `desired`.
///
/// Closeness is squared Euclidean distance; the first of several equally close
/// sizes wins, and an exact match always wins.
pub fn select_capture_size(supported: &[CaptureSize], desired: CaptureSize) -> Option<CaptureSize> {
    let mut best: Option<(CaptureSize, u64)> = None;
    for size in supported {
        let distance = size.distance_squared(&desired);
        match best {
            Some((_, best_distance)) if best_distance <= distance => {}
            _ => best = Some((*size, distance)),
        }
    }
    best.map(|(size, _)| size)
}

/// Picks the first device with the requested facing.
pub fn select_device(devices: &[DeviceInfo], facing: Facing) -> Option<&DeviceInfo> {
    devices.iter().find(|device| device.facing == facing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(list: &[(u32, u32)]) -> Vec<CaptureSize> {
        list.iter().map(|&(w, h)| CaptureSize::new(w, h)).collect()
    }

    #[test]
    fn exact_match_is_chosen() {
        let supported = sizes(&[(1920, 1080), (1280, 720), (640, 480), (320, 240)]);
        let chosen = select_capture_size(&supported, CaptureSize::new(640, 480));
        assert_eq!(chosen, Some(CaptureSize::new(640, 480)));
    }

    #[test]
    fn nearest_size_minimises_squared_distance() {
        let supported = sizes(&[(1920, 1080), (1280, 720), (640, 480)]);
        let chosen = select_capture_size(&supported, CaptureSize::new(1200, 700));
        assert_eq!(chosen, Some(CaptureSize::new(1280, 720)));

        let desired = CaptureSize::new(1000, 600);
        let chosen = select_capture_size(&supported, desired).unwrap();
        assert!(supported
            .iter()
            .all(|s| chosen.distance_squared(&desired) <= s.distance_squared(&desired)));
    }

    #[test]
    fn ties_resolve_to_first_encountered() {
        // Both are 100 pixels away in one axis.
        let supported = sizes(&[(740, 480), (540, 480)]);
        let chosen = select_capture_size(&supported, CaptureSize::new(640, 480));
        assert_eq!(chosen, Some(CaptureSize::new(740, 480)));
    }

    #[test]
    fn empty_list_has_no_choice() {
        assert_eq!(select_capture_size(&[], CaptureSize::new(640, 480)), None);
    }

    #[test]
    fn device_selection_matches_facing() {
        let devices = vec![
            DeviceInfo { id: "0".into(), name: "rear".into(), facing: Facing::Back, output_sizes: vec![] },
            DeviceInfo { id: "1".into(), name: "selfie".into(), facing: Facing::Front, output_sizes: vec![] },
        ];
        assert_eq!(select_device(&devices, Facing::Front).map(|d| d.id.as_str()), Some("1"));
        assert_eq!(select_device(&devices[..1], Facing::Front).map(|d| d.id.as_str()), None);
    }

    #[test]
    fn preview_request_uses_continuous_af_and_auto_exposure() {
        let request = CaptureRequest::preview(2);
        assert_eq!(request.af_mode, AutoFocusMode::ContinuousPicture);
        assert_eq!(request.ae_mode, AutoExposureMode::OnAutoFlash);
        assert_eq!(request.target_count, 2);
    }
}
