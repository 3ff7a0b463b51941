//! Wires the capture session, both output surfaces and the CPU frame path.

use crate::capture::acquire::{FrameProcessor, PackedFrameConsumer};
use crate::capture::reader::FrameReader;
use crate::capture::session::{CaptureSession, CaptureState, ErrorListener};
use crate::capture::{CameraHost, OutputSurface};
use crate::config::{LiveChanges, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::frame::CaptureSize;
use crate::render::presenter::FramePresenter;
use crate::render::surface::{ExternalSurface, FrameSignal, RenderRequester};
use std::sync::Arc;
use tracing::{debug, info};

/// One camera feeding the display surface and the frame processor.
///
/// `resume` and `pause` follow the host lifecycle: pause releases the device
/// synchronously and discards in-flight conversions.
pub struct CameraPipeline {
    config: PipelineConfig,
    surface: Arc<ExternalSurface>,
    reader: Arc<FrameReader>,
    signal: Arc<FrameSignal>,
    processor: Arc<FrameProcessor>,
    session: CaptureSession,
    requester: RenderRequester,
    display: bool,
}

impl CameraPipeline {
    /// Binds the display surface and the frame reader.
    ///
    /// `requester` is called from capture threads whenever a redraw is wanted;
    /// `consumer` receives converted frames on the conversion thread.
    pub fn new(
        host: Arc<dyn CameraHost>,
        config: PipelineConfig,
        requester: RenderRequester,
        consumer: PackedFrameConsumer,
    ) -> Result<Self> {
        Self::build(host, config, requester, consumer, true)
    }

    /// CPU path only: the session binds the frame reader alone.
    pub fn headless(host: Arc<dyn CameraHost>, config: PipelineConfig, consumer: PackedFrameConsumer) -> Result<Self> {
        Self::build(host, config, Arc::new(|| {}), consumer, false)
    }

    fn build(
        host: Arc<dyn CameraHost>,
        config: PipelineConfig,
        requester: RenderRequester,
        consumer: PackedFrameConsumer,
        display: bool,
    ) -> Result<Self> {
        let surface = Arc::new(ExternalSurface::new());
        let reader = Arc::new(FrameReader::new(config.max_images));
        let signal = Arc::new(FrameSignal::new(Arc::clone(&requester), true));

        let processor = FrameProcessor::new(consumer)
            .map_err(|e| PipelineError::DeviceUnavailable(format!("failed to start frame processor: {e}")))?;
        processor.attach(&reader);

        let mut outputs = Vec::with_capacity(2);
        if display {
            outputs.push(OutputSurface::Display(Arc::clone(&surface)));
        }
        outputs.push(OutputSurface::Reader(Arc::clone(&reader)));
        let session = CaptureSession::with_open_timeout(host, config.facing, outputs, config.open_timeout());
        // Frames converted for a closed session are never counted or rendered.
        session.set_closed_listener(processor.invalidator());

        let pipeline = Self {
            config,
            surface,
            reader,
            signal,
            processor,
            session,
            requester,
            display,
        };
        pipeline.set_sync_preview_and_processing(pipeline.config.sync_preview_and_processing);
        Ok(pipeline)
    }

    /// Presenter reading this pipeline's display surface. Lives on the render thread.
    pub fn presenter(&self) -> FramePresenter {
        FramePresenter::new(
            Arc::clone(&self.surface),
            Arc::clone(&self.signal),
            self.config.facing,
            self.config.scale_type,
        )
    }

    /// Opens the camera at the configured size.
    pub fn resume(&self) -> Result<CaptureSize> {
        let size = self.session.open(self.config.desired_size())?;
        info!(size = %size, facing = ?self.config.facing, display = self.display, "Camera pipeline resumed");
        Ok(size)
    }

    /// Closes the camera and forgets everything in flight.
    pub fn pause(&self) {
        self.session.close();
        if let Some(frame) = self.reader.acquire_latest() {
            frame.close();
        }
        self.signal.reset();
        info!("Camera pipeline paused");
    }

    /// In sync mode the display is redrawn after each CPU conversion instead of
    /// on every camera frame.
    pub fn set_sync_preview_and_processing(&self, sync: bool) {
        self.signal.set_request_on_frame(!sync);
        self.processor
            .set_render_requester(sync.then(|| Arc::clone(&self.requester)));
        debug!(sync, "Preview and processing sync mode set");
    }

    /// Applies hot-reloaded settings that do not need the device reopened.
    ///
    /// Scale type belongs to the presenter and is returned for the render thread.
    pub fn apply_live_changes(&mut self, changes: &LiveChanges) {
        if let Some(sync) = changes.sync_preview_and_processing {
            self.config.sync_preview_and_processing = sync;
            self.set_sync_preview_and_processing(sync);
        }
        if let Some(scale_type) = changes.scale_type {
            self.config.scale_type = scale_type;
        }
    }

    pub fn set_error_listener(&self, listener: ErrorListener) {
        self.session.set_error_listener(listener);
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> CaptureState {
        self.session.state()
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn surface(&self) -> &Arc<ExternalSurface> {
        &self.surface
    }

    pub fn reader(&self) -> &Arc<FrameReader> {
        &self.reader
    }

    pub fn signal(&self) -> &Arc<FrameSignal> {
        &self.signal
    }

    pub fn processor(&self) -> &Arc<FrameProcessor> {
        &self.processor
    }

    /// Closes the camera and stops both worker threads.
    pub fn shutdown(&self) {
        self.session.shutdown();
        self.reader.clear_listener();
        self.processor.shutdown();
    }
}

impl Drop for CameraPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CameraPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraPipeline")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("processor", &self.processor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Facing;
    use crate::frame::{PixelFormat, VideoFrame};
    use crate::render::viewport::ScaleType;
    use crate::testing::{wait_until, FakeHost};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn counting_requester() -> (RenderRequester, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        (Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }), count)
    }

    fn grey_frame(width: u32, height: u32) -> VideoFrame {
        let data = vec![128u8; (width * height * 3) as usize];
        VideoFrame::from_data(width, height, PixelFormat::Rgb, data)
    }

    #[test]
    fn async_mode_requests_render_per_surface_frame() {
        let host = FakeHost::with_front_camera(&[(64, 48)]);
        let (requester, renders) = counting_requester();
        let pipeline = CameraPipeline::new(host.clone(), PipelineConfig::default(), requester, Arc::new(|_| {})).unwrap();

        pipeline.resume().unwrap();
        assert!(wait_until(WAIT, || pipeline.state() == CaptureState::Streaming));
        assert_eq!(pipeline.surface().default_buffer_size(), Some(CaptureSize::new(64, 48)));

        pipeline.presenter().attach();
        assert_eq!(host.emit_frame(&grey_frame(64, 48)).unwrap(), 2);
        assert!(pipeline.signal().is_pending());
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sync_mode_renders_after_conversion() {
        let host = FakeHost::with_front_camera(&[(64, 48)]);
        let (requester, renders) = counting_requester();
        let converted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&converted);
        let config = PipelineConfig {
            sync_preview_and_processing: true,
            ..PipelineConfig::default()
        };
        let pipeline = CameraPipeline::new(
            host.clone(),
            config,
            requester,
            Arc::new(move |frame| {
                assert_eq!(frame.pixels.len(), 64 * 48);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        pipeline.presenter().attach();

        pipeline.resume().unwrap();
        assert!(wait_until(WAIT, || pipeline.state() == CaptureState::Streaming));
        host.emit_frame(&grey_frame(64, 48)).unwrap();

        assert!(wait_until(WAIT, || converted.load(Ordering::SeqCst) == 1));
        assert!(wait_until(WAIT, || renders.load(Ordering::SeqCst) == 1));
        assert!(pipeline.signal().is_pending());
    }

    #[test]
    fn pause_releases_device_and_clears_pending() {
        let host = FakeHost::with_front_camera(&[(64, 48)]);
        let (requester, _) = counting_requester();
        let pipeline = CameraPipeline::new(host.clone(), PipelineConfig::default(), requester, Arc::new(|_| {})).unwrap();
        pipeline.presenter().attach();

        pipeline.resume().unwrap();
        assert!(wait_until(WAIT, || pipeline.state() == CaptureState::Streaming));
        host.emit_frame(&grey_frame(64, 48)).unwrap();
        assert!(pipeline.signal().is_pending());

        pipeline.pause();
        assert_eq!(pipeline.state(), CaptureState::Closed);
        assert!(!pipeline.signal().is_pending());
        assert!(!host.is_streaming());
        assert_eq!(host.emit_frame(&grey_frame(64, 48)).unwrap(), 0);

        pipeline.resume().unwrap();
        assert!(wait_until(WAIT, || pipeline.state() == CaptureState::Streaming));
    }

    #[test]
    fn headless_binds_reader_only() {
        let host = FakeHost::with_front_camera(&[(64, 48)]);
        let pipeline = CameraPipeline::headless(host.clone(), PipelineConfig::default(), Arc::new(|_| {})).unwrap();
        pipeline.resume().unwrap();
        assert!(wait_until(WAIT, || pipeline.state() == CaptureState::Streaming));
        assert_eq!(host.emit_frame(&grey_frame(64, 48)).unwrap(), 1);
        assert_eq!(pipeline.surface().images_queued(), 0);
    }

    #[test]
    fn live_changes_toggle_sync_mode() {
        let host = FakeHost::with_front_camera(&[(64, 48)]);
        let (requester, renders) = counting_requester();
        let mut pipeline =
            CameraPipeline::new(host.clone(), PipelineConfig::default(), requester, Arc::new(|_| {})).unwrap();

        pipeline.apply_live_changes(&LiveChanges {
            scale_type: Some(ScaleType::FitCenter),
            sync_preview_and_processing: Some(true),
            needs_reopen: false,
        });
        assert_eq!(pipeline.config().scale_type, ScaleType::FitCenter);
        assert!(pipeline.config().sync_preview_and_processing);

        pipeline.signal().notify_frame_available();
        assert_eq!(renders.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_camera_fails_resume() {
        let host = FakeHost::with_back_camera(&[(64, 48)]);
        let config = PipelineConfig {
            facing: Facing::Front,
            ..PipelineConfig::default()
        };
        let pipeline = CameraPipeline::headless(host, config, Arc::new(|_| {})).unwrap();
        assert!(matches!(pipeline.resume(), Err(PipelineError::DeviceUnavailable(_))));
    }
}
