//! Scripted in-memory camera host.
//!
//! `FakeHost` records every call the pipeline makes and lets a test decide how
//! and when the device open completes. Frames are injected with
//! [`FakeHost::emit_frame`] and routed to the configured outputs the way a
//! platform camera stack would.

use crate::capture::{
    CameraHost, CaptureRequest, DeviceCallback, DeviceEvent, DeviceInfo, Facing, HostDevice, HostSession,
    OutputSurface, SessionCallback, SessionConfig, SessionEvent,
};
use crate::error::HostError;
use crate::frame::{CaptureSize, VideoFrame};
use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// How [`CameraHost::open_device`] completes.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenBehavior {
    /// The device opens before `open_device` returns
    Immediate,
    /// The device opens on another thread after the delay
    Delayed(Duration),
    /// The device opens when the test calls [`FakeHost::complete_pending_open`]
    Manual,
    /// `open_device` itself fails
    Reject(HostError),
    /// The open callback reports an error
    ReportError(String),
}

/// A host call observed by the fake.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    OpenDevice(String),
    CreateSession(CaptureSize),
    SetRepeatingRequest(CaptureRequest),
    CloseSession,
    CloseDevice,
}

struct State {
    devices: Vec<DeviceInfo>,
    behavior: OpenBehavior,
    configure_fails: bool,
    calls: Vec<HostCall>,
    outputs: Vec<OutputSurface>,
    streaming: bool,
    pending_open: Option<String>,
}

struct Shared {
    state: Mutex<State>,
    // Kept apart from `state` so it can be invoked while device calls lock `state`.
    callback: Mutex<Option<DeviceCallback>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: HostCall) {
        debug!(?call, "Fake host call");
        self.lock().calls.push(call);
    }

    fn deliver(&self, event: DeviceEvent) -> bool {
        let mut slot = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_mut() {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    fn opened(self: &Arc<Self>, id: String) {
        let device = FakeDevice {
            id,
            shared: Arc::clone(self),
            closed: false,
        };
        self.deliver(DeviceEvent::Opened(Box::new(device)));
    }
}

/// In-memory [`CameraHost`] for tests and embedders without a camera.
pub struct FakeHost {
    shared: Arc<Shared>,
}

impl FakeHost {
    pub fn new(devices: Vec<DeviceInfo>) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    devices,
                    behavior: OpenBehavior::Immediate,
                    configure_fails: false,
                    calls: Vec::new(),
                    outputs: Vec::new(),
                    streaming: false,
                    pending_open: None,
                }),
                callback: Mutex::new(None),
            }),
        })
    }

    /// One front-facing device with the given output sizes.
    pub fn with_front_camera(sizes: &[(u32, u32)]) -> Arc<Self> {
        Self::new(vec![fake_device("front-0", Facing::Front, sizes)])
    }

    /// One back-facing device with the given output sizes.
    pub fn with_back_camera(sizes: &[(u32, u32)]) -> Arc<Self> {
        Self::new(vec![fake_device("back-0", Facing::Back, sizes)])
    }

    pub fn set_open_behavior(&self, behavior: OpenBehavior) {
        self.shared.lock().behavior = behavior;
    }

    /// Makes the next session configurations fail.
    pub fn set_configure_fails(&self, fails: bool) {
        self.shared.lock().configure_fails = fails;
    }

    /// Completes an open started under [`OpenBehavior::Manual`].
    pub fn complete_pending_open(&self) -> bool {
        let pending = self.shared.lock().pending_open.take();
        match pending {
            Some(id) => {
                self.shared.opened(id);
                true
            }
            None => false,
        }
    }

    /// Reports the opened device as disconnected.
    pub fn disconnect(&self) -> bool {
        self.shared.lock().streaming = false;
        self.shared.deliver(DeviceEvent::Disconnected)
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.shared.lock().calls.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.lock().streaming
    }

    /// Writes `frame` to every output of the streaming session.
    ///
    /// Display outputs receive RGBA, reader outputs a planar 4:2:0 frame.
    /// Returns how many outputs received it; nothing is written while the
    /// session is not streaming.
    pub fn emit_frame(&self, frame: &VideoFrame) -> Result<usize> {
        let outputs = {
            let state = self.shared.lock();
            if !state.streaming {
                return Ok(0);
            }
            state.outputs.clone()
        };

        for output in &outputs {
            match output {
                OutputSurface::Display(surface) => surface.queue_image(frame.to_rgba()?),
                OutputSurface::Reader(reader) => reader.push(frame.to_nv12()?.to_planar_frame()?),
            }
        }
        Ok(outputs.len())
    }
}

impl CameraHost for FakeHost {
    fn devices(&self) -> Result<Vec<DeviceInfo>, HostError> {
        Ok(self.shared.lock().devices.clone())
    }

    fn open_device(&self, id: &str, callback: DeviceCallback) -> Result<(), HostError> {
        let behavior = self.shared.lock().behavior.clone();
        if let OpenBehavior::Reject(err) = behavior {
            return Err(err);
        }
        self.shared.record(HostCall::OpenDevice(id.to_string()));
        *self.shared.callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);

        match behavior {
            OpenBehavior::Immediate => self.shared.opened(id.to_string()),
            OpenBehavior::Delayed(delay) => {
                let shared = Arc::clone(&self.shared);
                let id = id.to_string();
                thread::spawn(move || {
                    thread::sleep(delay);
                    shared.opened(id);
                });
            }
            OpenBehavior::Manual => self.shared.lock().pending_open = Some(id.to_string()),
            OpenBehavior::ReportError(reason) => {
                self.shared.deliver(DeviceEvent::Error(reason));
            }
            OpenBehavior::Reject(_) => {}
        }
        Ok(())
    }
}

struct FakeDevice {
    id: String,
    shared: Arc<Shared>,
    closed: bool,
}

impl HostDevice for FakeDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_session(&mut self, config: SessionConfig, mut callback: SessionCallback) -> Result<(), HostError> {
        if self.closed {
            return Err(HostError::Backend("device closed".into()));
        }
        self.shared.record(HostCall::CreateSession(config.size));
        let fails = {
            let mut state = self.shared.lock();
            state.outputs = config.outputs;
            state.configure_fails
        };

        if fails {
            callback(SessionEvent::ConfigureFailed("outputs rejected".into()));
        } else {
            callback(SessionEvent::Configured(Box::new(FakeSession {
                shared: Arc::clone(&self.shared),
                closed: false,
            })));
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.record(HostCall::CloseDevice);
        self.shared.lock().streaming = false;
    }
}

struct FakeSession {
    shared: Arc<Shared>,
    closed: bool,
}

impl HostSession for FakeSession {
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), HostError> {
        if self.closed {
            return Err(HostError::Backend("session closed".into()));
        }
        self.shared.record(HostCall::SetRepeatingRequest(request.clone()));
        self.shared.lock().streaming = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.record(HostCall::CloseSession);
        self.shared.lock().streaming = false;
    }
}

fn fake_device(id: &str, facing: Facing, sizes: &[(u32, u32)]) -> DeviceInfo {
    DeviceInfo {
        id: id.to_string(),
        name: format!("Fake {facing:?} camera"),
        facing,
        output_sizes: sizes.iter().map(|&(w, h)| CaptureSize::new(w, h)).collect(),
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}
