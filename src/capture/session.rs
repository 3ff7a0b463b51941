//! Capture session lifecycle.
//!
//! Every host call runs on one background worker. Host callbacks may arrive on
//! any thread: they record an opened device, release the open/close gate and
//! hand the event to the worker. A generation number taken at `open` lets
//! stale callbacks be discarded without touching the gate.

use super::worker::BackgroundWorker;
use super::{
    select_capture_size, select_device, CameraHost, CaptureRequest, DeviceCallback, DeviceEvent, Facing,
    HostDevice, HostSession, OutputSurface, SessionCallback, SessionConfig, SessionEvent,
};
use crate::error::{PipelineError, Result};
use crate::frame::CaptureSize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long `open` and `close` wait for the gate by default.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(2500);

/// Receives failures reported after `open` has returned.
pub type ErrorListener = Arc<dyn Fn(&PipelineError) + Send + Sync>;

/// Invoked on the worker each time the session ends up closed, by `close`
/// or by a failure.
pub type ClosedListener = Arc<dyn Fn() + Send + Sync>;

/// Binary permit serialising device open against device close.
///
/// Releasing an already available gate is a no-op.
#[derive(Debug)]
pub struct Gate {
    available: Mutex<bool>,
    cond: Condvar,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        Self {
            available: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    /// Waits up to `timeout` for the permit.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let guard = self.available.lock().unwrap_or_else(|e| e.into_inner());
        let (mut available, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |available| !*available)
            .unwrap_or_else(|e| e.into_inner());
        if *available {
            *available = false;
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        *self.available.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cond.notify_one();
    }

    pub fn is_available(&self) -> bool {
        *self.available.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases the gate when dropped, whether or not it was acquired.
struct ReleaseOnDrop<'a>(&'a Gate);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Closed,
    Opening,
    Open,
    SessionConfiguring,
    Streaming,
    Closing,
}

struct Inner {
    state: CaptureState,
    generation: u64,
    config: Option<SessionConfig>,
    device: Option<Box<dyn HostDevice>>,
    session: Option<Box<dyn HostSession>>,
}

struct Shared {
    gate: Gate,
    inner: Mutex<Inner>,
    listener: Mutex<Option<ErrorListener>>,
    closed_listener: Mutex<Option<ClosedListener>>,
    last_error: Mutex<Option<PipelineError>>,
}

/// A device event after the callback thread has recorded it.
enum DeviceUpdate {
    /// The device is stored in the session and awaits configuration
    Opened,
    /// Opened for a session that has since been closed
    Stale(Box<dyn HostDevice>),
    Disconnected,
    Error(String),
}

/// Owns the device handle and the capture session for one facing.
pub struct CaptureSession {
    host: Arc<dyn CameraHost>,
    facing: Facing,
    outputs: Mutex<Vec<OutputSurface>>,
    open_timeout: Duration,
    shared: Arc<Shared>,
    worker: Mutex<Option<Arc<BackgroundWorker>>>,
}

impl CaptureSession {
    pub fn new(host: Arc<dyn CameraHost>, facing: Facing, outputs: Vec<OutputSurface>) -> Self {
        Self::with_open_timeout(host, facing, outputs, DEFAULT_OPEN_TIMEOUT)
    }

    pub fn with_open_timeout(
        host: Arc<dyn CameraHost>,
        facing: Facing,
        outputs: Vec<OutputSurface>,
        open_timeout: Duration,
    ) -> Self {
        Self {
            host,
            facing,
            outputs: Mutex::new(outputs),
            open_timeout,
            shared: Arc::new(Shared {
                gate: Gate::new(),
                inner: Mutex::new(Inner {
                    state: CaptureState::Closed,
                    generation: 0,
                    config: None,
                    device: None,
                    session: None,
                }),
                listener: Mutex::new(None),
                closed_listener: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn state(&self) -> CaptureState {
        self.shared.lock().state
    }

    /// Size chosen by the most recent successful `open`.
    pub fn chosen_size(&self) -> Option<CaptureSize> {
        self.shared.lock().config.as_ref().map(|config| config.size)
    }

    pub fn set_error_listener(&self, listener: ErrorListener) {
        *self.shared.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    pub fn set_closed_listener(&self, listener: ClosedListener) {
        *self.shared.closed_listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// The most recent asynchronous failure, if any.
    pub fn last_error(&self) -> Option<PipelineError> {
        self.shared.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether the open/close gate is currently free.
    pub fn gate_available(&self) -> bool {
        self.shared.gate.is_available()
    }

    /// Replaces the output surfaces. The host session binding them is
    /// configured by the next `open`.
    pub fn set_outputs(&self, outputs: Vec<OutputSurface>) {
        *self.outputs.lock().unwrap_or_else(|e| e.into_inner()) = outputs;
    }

    /// Selects a device and size, then starts opening the device.
    ///
    /// Returns once the open has been issued; configuration and streaming
    /// continue on the worker and failures after this point go to the error
    /// listener.
    pub fn open(&self, desired: CaptureSize) -> Result<CaptureSize> {
        let devices = self.host.devices()?;
        let device = select_device(&devices, self.facing)
            .ok_or_else(|| PipelineError::DeviceUnavailable(format!("no {:?} facing camera", self.facing)))?;
        let size = select_capture_size(&device.output_sizes, desired).ok_or_else(|| {
            PipelineError::DeviceUnavailable(format!("camera {} reports no output sizes", device.id))
        })?;
        info!(device = %device.id, name = %device.name, desired = %desired, chosen = %size, "Selected capture device");

        if !self.shared.gate.try_acquire_for(self.open_timeout) {
            return Err(PipelineError::Timeout(self.open_timeout));
        }

        let worker = match self.ensure_worker() {
            Ok(worker) => worker,
            Err(err) => {
                self.shared.gate.release();
                return Err(PipelineError::DeviceUnavailable(format!("failed to start camera worker: {err}")));
            }
        };

        let outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let generation = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            inner.config = Some(SessionConfig { size, outputs });
            inner.generation
        };

        let shared = Arc::clone(&self.shared);
        let host = Arc::clone(&self.host);
        let id = device.id.clone();
        let weak = Arc::downgrade(&worker);
        let posted = worker.post(move || {
            shared.release_leftovers();
            shared.set_state(generation, CaptureState::Opening);
            let callback = device_callback(Arc::clone(&shared), generation, weak);
            if let Err(err) = host.open_device(&id, callback) {
                shared.gate.release();
                shared.fail(generation, err.into());
            }
        });
        if !posted {
            self.shared.gate.release();
            return Err(PipelineError::DeviceUnavailable("camera worker stopped".into()));
        }
        Ok(size)
    }

    /// Stops streaming and releases the session and the device.
    ///
    /// Waits a bounded time for an in-flight open; on timeout it logs and
    /// proceeds. Safe to call in any state and more than once.
    pub fn close(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let shared = Arc::clone(&self.shared);
        let timeout = self.open_timeout;
        let task = move || shared.close_now(timeout);
        match worker {
            Some(worker) => {
                if let Err(err) = worker.run_sync(task) {
                    error!(%err, "Camera close did not complete");
                }
            }
            None => task(),
        }
    }

    /// Closes and stops the worker thread.
    pub fn shutdown(&self) {
        self.close();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            worker.quit_safely();
        }
    }

    fn ensure_worker(&self) -> std::io::Result<Arc<BackgroundWorker>> {
        let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = slot.as_ref() {
            return Ok(Arc::clone(worker));
        }
        let worker = Arc::new(BackgroundWorker::start("camera-background")?);
        *slot = Some(Arc::clone(&worker));
        Ok(worker)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("facing", &self.facing)
            .field("state", &self.state())
            .finish()
    }
}

/// Posts `task` to the worker, or runs it here once the worker is gone.
fn dispatch<F>(worker: &Weak<BackgroundWorker>, task: F)
where
    F: FnOnce() + Send + 'static,
{
    // The task is parked in a slot so it survives a rejected post.
    let slot = Arc::new(Mutex::new(Some(task)));
    let queued = Arc::clone(&slot);
    let posted = match worker.upgrade() {
        Some(worker) => worker.post(move || {
            if let Some(task) = queued.lock().unwrap_or_else(|e| e.into_inner()).take() {
                task();
            }
        }),
        None => false,
    };
    if !posted {
        let task = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task();
        }
    }
}

fn device_callback(shared: Arc<Shared>, generation: u64, worker: Weak<BackgroundWorker>) -> DeviceCallback {
    Box::new(move |event: DeviceEvent| {
        let event = shared.accept_device_event(generation, event);
        let target = Arc::clone(&shared);
        let next = worker.clone();
        dispatch(&worker, move || target.on_device_event(generation, event, next));
    })
}

fn session_callback(shared: Arc<Shared>, generation: u64, worker: Weak<BackgroundWorker>) -> SessionCallback {
    Box::new(move |event: SessionEvent| {
        let target = Arc::clone(&shared);
        dispatch(&worker, move || target.on_session_event(generation, event));
    })
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, generation: u64, state: CaptureState) {
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.state = state;
        }
    }

    /// Closes whatever a previous open left behind before reopening.
    fn release_leftovers(&self) {
        let (session, device) = {
            let mut inner = self.lock();
            (inner.session.take(), inner.device.take())
        };
        if session.is_some() || device.is_some() {
            warn!("Reopening with a device still held, closing it first");
        }
        close_handles(session, device);
    }

    /// Records a device event on the callback thread, then frees the gate.
    ///
    /// An opened device is stored before the gate is released, so a `close`
    /// waiting on the gate always finds it.
    fn accept_device_event(&self, generation: u64, event: DeviceEvent) -> DeviceUpdate {
        let mut inner = self.lock();
        let current = inner.generation == generation;
        let update = match event {
            DeviceEvent::Opened(device) if current && inner.state == CaptureState::Opening => {
                info!(device = device.id(), "Camera device opened");
                inner.device = Some(device);
                inner.state = CaptureState::Open;
                DeviceUpdate::Opened
            }
            DeviceEvent::Opened(device) => DeviceUpdate::Stale(device),
            DeviceEvent::Disconnected => DeviceUpdate::Disconnected,
            DeviceEvent::Error(reason) => DeviceUpdate::Error(reason),
        };
        drop(inner);
        // A stale callback must not free a gate held by a newer open.
        if current {
            self.gate.release();
        }
        update
    }

    fn on_device_event(self: &Arc<Self>, generation: u64, update: DeviceUpdate, worker: Weak<BackgroundWorker>) {
        match update {
            DeviceUpdate::Opened => self.configure(generation, worker),
            DeviceUpdate::Stale(mut device) => {
                info!(device = device.id(), "Device opened after close, releasing it");
                device.close();
            }
            DeviceUpdate::Disconnected => {
                warn!("Camera device disconnected");
                self.fail(generation, PipelineError::DeviceUnavailable("device disconnected".into()));
            }
            DeviceUpdate::Error(reason) => {
                error!(%reason, "Camera device error");
                self.fail(generation, PipelineError::DeviceUnavailable(reason));
            }
        }
    }

    /// Binds the outputs on the opened device.
    fn configure(self: &Arc<Self>, generation: u64, worker: Weak<BackgroundWorker>) {
        // Worker only: nothing else takes the device while it is out of `inner`.
        let (mut device, config) = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != CaptureState::Open {
                return;
            }
            let Some(config) = inner.config.clone() else {
                drop(inner);
                self.fail(generation, PipelineError::SessionConfigurationFailed("no session config".into()));
                return;
            };
            let Some(device) = inner.device.take() else {
                return;
            };
            inner.state = CaptureState::SessionConfiguring;
            (device, config)
        };

        for output in &config.outputs {
            if let OutputSurface::Display(surface) = output {
                surface.set_default_buffer_size(config.size);
            }
        }

        let callback = session_callback(Arc::clone(self), generation, worker);
        let result = device.create_session(config, callback);

        let mut inner = self.lock();
        if inner.generation != generation {
            drop(inner);
            device.close();
            return;
        }
        inner.device = Some(device);
        drop(inner);

        if let Err(err) = result {
            self.fail(generation, PipelineError::SessionConfigurationFailed(err.to_string()));
        }
    }

    fn on_session_event(&self, generation: u64, event: SessionEvent) {
        match event {
            SessionEvent::Configured(mut session) => {
                let target_count = {
                    let inner = self.lock();
                    let current = inner.generation == generation
                        && inner.state == CaptureState::SessionConfiguring
                        && inner.device.is_some();
                    if !current {
                        drop(inner);
                        debug!("Session configured after close, releasing it");
                        session.close();
                        return;
                    }
                    inner.config.as_ref().map_or(0, |config| config.outputs.len())
                };

                let request = CaptureRequest::preview(target_count);
                if let Err(err) = session.set_repeating_request(&request) {
                    session.close();
                    self.fail(generation, PipelineError::SessionConfigurationFailed(err.to_string()));
                    return;
                }

                let mut inner = self.lock();
                if inner.generation != generation {
                    drop(inner);
                    session.close();
                    return;
                }
                inner.session = Some(session);
                inner.state = CaptureState::Streaming;
                info!(targets = target_count, "Capture session streaming");
            }
            SessionEvent::ConfigureFailed(reason) => {
                error!(%reason, "Capture session configuration failed");
                self.fail(generation, PipelineError::SessionConfigurationFailed(reason));
            }
        }
    }

    /// Tears down the current generation and reports `err`.
    fn fail(&self, generation: u64, err: PipelineError) {
        let (session, device) = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(%err, "Ignoring failure from a closed session");
                return;
            }
            inner.state = CaptureState::Closed;
            (inner.session.take(), inner.device.take())
        };
        close_handles(session, device);
        self.notify_closed();

        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.clone());
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match listener {
            Some(listener) => listener(&err),
            None => error!(%err, "Capture failure with no error listener"),
        }
    }

    fn close_now(&self, timeout: Duration) {
        let acquired = self.gate.try_acquire_for(timeout);
        let _release = ReleaseOnDrop(&self.gate);
        if !acquired {
            warn!(?timeout, "Timed out waiting for camera open, closing anyway");
        }

        let (session, device) = {
            let mut inner = self.lock();
            if inner.state == CaptureState::Closed && inner.device.is_none() && inner.session.is_none() {
                // Invalidate any open still in flight.
                inner.generation += 1;
                drop(inner);
                self.notify_closed();
                return;
            }
            inner.state = CaptureState::Closing;
            inner.generation += 1;
            (inner.session.take(), inner.device.take())
        };
        close_handles(session, device);
        self.lock().state = CaptureState::Closed;
        self.notify_closed();
        info!("Camera closed");
    }

    fn notify_closed(&self) {
        let listener = self.closed_listener.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(listener) = listener {
            listener();
        }
    }
}

fn close_handles(session: Option<Box<dyn HostSession>>, device: Option<Box<dyn HostDevice>>) {
    if let Some(mut session) = session {
        session.close();
    }
    if let Some(mut device) = device {
        device.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, FakeHost, HostCall, OpenBehavior};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(2);

    fn session(host: &Arc<FakeHost>, timeout: Duration) -> CaptureSession {
        CaptureSession::with_open_timeout(host.clone(), Facing::Front, Vec::new(), timeout)
    }

    #[test]
    fn gate_times_out_while_held() {
        let gate = Gate::new();
        assert!(gate.try_acquire_for(Duration::from_millis(10)));
        assert!(!gate.try_acquire_for(Duration::from_millis(20)));
        gate.release();
        gate.release();
        assert!(gate.try_acquire_for(Duration::from_millis(10)));
    }

    #[test]
    fn gate_wakes_waiter_on_release() {
        let gate = Arc::new(Gate::new());
        assert!(gate.try_acquire_for(Duration::ZERO));
        let releaser = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            releaser.release();
        });
        assert!(gate.try_acquire_for(Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn open_reaches_streaming_with_chosen_size() {
        let host = FakeHost::with_front_camera(&[(1920, 1080), (1280, 720), (640, 480)]);
        let capture = session(&host, DEFAULT_OPEN_TIMEOUT);

        let chosen = capture.open(CaptureSize::new(640, 480)).unwrap();
        assert_eq!(chosen, CaptureSize::new(640, 480));
        assert!(wait_until(WAIT, || capture.state() == CaptureState::Streaming));
        assert_eq!(capture.chosen_size(), Some(chosen));
        assert!(capture.gate_available());

        let calls = host.calls();
        assert!(calls.contains(&HostCall::CreateSession(chosen)));
        assert!(calls.contains(&HostCall::SetRepeatingRequest(CaptureRequest::preview(0))));
    }

    #[test]
    fn set_outputs_applies_to_the_next_open() {
        let host = FakeHost::with_front_camera(&[(640, 480)]);
        let capture = session(&host, DEFAULT_OPEN_TIMEOUT);
        let reader = Arc::new(crate::capture::reader::FrameReader::new(2));
        capture.set_outputs(vec![OutputSurface::Reader(reader)]);

        capture.open(CaptureSize::new(640, 480)).unwrap();
        assert!(wait_until(WAIT, || capture.state() == CaptureState::Streaming));
        assert!(host
            .calls()
            .contains(&HostCall::SetRepeatingRequest(CaptureRequest::preview(1))));
    }

    #[test]
    fn missing_facing_is_device_unavailable() {
        let host = FakeHost::with_back_camera(&[(640, 480)]);
        let capture = session(&host, DEFAULT_OPEN_TIMEOUT);
        let err = capture.open(CaptureSize::new(640, 480)).unwrap_err();
        assert!(matches!(err, PipelineError::DeviceUnavailable(_)));
        assert_eq!(capture.state(), CaptureState::Closed);
    }

    #[test]
    fn open_times_out_when_gate_is_held() {
        let host = FakeHost::with_front_camera(&[(640, 480)]);
        host.set_open_behavior(OpenBehavior::Manual);
        let capture = session(&host, Duration::from_millis(50));

        capture.open(CaptureSize::new(640, 480)).unwrap();
        let err = capture.open(CaptureSize::new(640, 480)).unwrap_err();
        assert_eq!(err, PipelineError::Timeout(Duration::from_millis(50)));
    }

    #[test]
    fn configuration_failure_is_reported_and_closes_device() {
        let host = FakeHost::with_front_camera(&[(640, 480)]);
        host.set_configure_fails(true);
        let capture = session(&host, DEFAULT_OPEN_TIMEOUT);
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        capture.set_error_listener(Arc::new(move |err: &PipelineError| sink.lock().unwrap().push(err.clone())));

        capture.open(CaptureSize::new(640, 480)).unwrap();
        assert!(wait_until(WAIT, || !reported.lock().unwrap().is_empty()));
        assert!(matches!(reported.lock().unwrap()[0], PipelineError::SessionConfigurationFailed(_)));
        assert!(wait_until(WAIT, || capture.state() == CaptureState::Closed));
        assert!(host.calls().contains(&HostCall::CloseDevice));
        assert!(matches!(capture.last_error(), Some(PipelineError::SessionConfigurationFailed(_))));
    }

    #[test]
    fn close_is_idempotent_and_releases_everything() {
        let host = FakeHost::with_front_camera(&[(640, 480)]);
        let capture = session(&host, DEFAULT_OPEN_TIMEOUT);
        capture.close();
        assert_eq!(capture.state(), CaptureState::Closed);

        capture.open(CaptureSize::new(640, 480)).unwrap();
        assert!(wait_until(WAIT, || capture.state() == CaptureState::Streaming));
        capture.close();
        capture.close();

        assert_eq!(capture.state(), CaptureState::Closed);
        assert!(capture.gate_available());
        assert!(!host.is_streaming());
        let calls = host.calls();
        assert_eq!(calls.iter().filter(|c| **c == HostCall::CloseSession).count(), 1);
        assert_eq!(calls.iter().filter(|c| **c == HostCall::CloseDevice).count(), 1);
    }

    #[test]
    fn close_racing_a_late_open_leaves_nothing_open() {
        for _ in 0..20 {
            let host = FakeHost::with_front_camera(&[(640, 480)]);
            host.set_open_behavior(OpenBehavior::Delayed(Duration::from_millis(15)));
            let capture = session(&host, DEFAULT_OPEN_TIMEOUT);

            capture.open(CaptureSize::new(640, 480)).unwrap();
            capture.close();

            // The device is closed by the time close returns.
            assert!(host.calls().contains(&HostCall::CloseDevice));
            assert_eq!(capture.state(), CaptureState::Closed);
            assert!(capture.gate_available());
            assert!(!host.is_streaming());
        }
    }

    #[test]
    fn close_proceeds_after_bounded_wait_on_stuck_open() {
        let host = FakeHost::with_front_camera(&[(640, 480)]);
        host.set_open_behavior(OpenBehavior::Manual);
        let capture = session(&host, Duration::from_millis(50));

        capture.open(CaptureSize::new(640, 480)).unwrap();
        capture.close();
        assert_eq!(capture.state(), CaptureState::Closed);
        assert!(capture.gate_available());

        // A completion arriving afterwards is released immediately.
        host.complete_pending_open();
        assert!(wait_until(WAIT, || host.calls().contains(&HostCall::CloseDevice)));
        assert_eq!(capture.state(), CaptureState::Closed);
    }

    #[test]
    fn stale_device_callback_leaves_a_newer_open_gated() {
        let host = FakeHost::with_front_camera(&[(640, 480)]);
        host.set_open_behavior(OpenBehavior::Manual);
        let capture = session(&host, Duration::from_millis(50));
        capture.open(CaptureSize::new(640, 480)).unwrap();
        assert!(wait_until(WAIT, || capture.state() == CaptureState::Opening));
        assert!(!capture.gate_available());

        let mut stale = device_callback(Arc::clone(&capture.shared), 0, Weak::new());
        stale(DeviceEvent::Disconnected);

        assert!(!capture.gate_available());
        assert_eq!(capture.state(), CaptureState::Opening);
        assert!(capture.last_error().is_none());
        let err = capture.open(CaptureSize::new(640, 480)).unwrap_err();
        assert_eq!(err, PipelineError::Timeout(Duration::from_millis(50)));
    }

    #[test]
    fn closed_listener_fires_on_close_and_on_failure() {
        let host = FakeHost::with_front_camera(&[(640, 480)]);
        let capture = session(&host, DEFAULT_OPEN_TIMEOUT);
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        capture.set_closed_listener(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        capture.set_error_listener(Arc::new(|_: &PipelineError| {}));

        capture.open(CaptureSize::new(640, 480)).unwrap();
        assert!(wait_until(WAIT, || capture.state() == CaptureState::Streaming));
        host.disconnect();
        assert!(wait_until(WAIT, || closed.load(Ordering::SeqCst) == 1));

        capture.close();
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn disconnect_while_streaming_reports_device_unavailable() {
        let host = FakeHost::with_front_camera(&[(640, 480)]);
        let capture = session(&host, DEFAULT_OPEN_TIMEOUT);
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        capture.set_error_listener(Arc::new(move |err: &PipelineError| {
            assert!(matches!(err, PipelineError::DeviceUnavailable(_)));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        capture.open(CaptureSize::new(640, 480)).unwrap();
        assert!(wait_until(WAIT, || capture.state() == CaptureState::Streaming));
        host.disconnect();

        assert!(wait_until(WAIT, || failures.load(Ordering::SeqCst) == 1));
        assert_eq!(capture.state(), CaptureState::Closed);
        assert!(!host.is_streaming());
    }

    #[test]
    fn rejected_open_releases_gate() {
        let host = FakeHost::with_front_camera(&[(640, 480)]);
        host.set_open_behavior(OpenBehavior::Reject(crate::error::HostError::PermissionDenied));
        let capture = session(&host, DEFAULT_OPEN_TIMEOUT);
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        capture.set_error_listener(Arc::new(move |_: &PipelineError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        capture.open(CaptureSize::new(640, 480)).unwrap();
        assert!(wait_until(WAIT, || reported.load(Ordering::SeqCst) == 1));
        assert!(capture.gate_available());
        assert!(matches!(capture.last_error(), Some(PipelineError::DeviceUnavailable(_))));
    }
}
