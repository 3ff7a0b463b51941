//! The externally written image source behind the presenter's texture, and the
//! `pendingUpdate` signal shared with the notification thread.

use crate::frame::{CaptureSize, VideoFrame};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Asks the host to schedule a redraw.
pub type RenderRequester = Arc<dyn Fn() + Send + Sync>;

/// Invoked on the producer thread after a new image is queued.
pub type SurfaceListener = Arc<dyn Fn() + Send + Sync>;

/// Latest RGBA image written by the capture subsystem.
///
/// Producers call [`ExternalSurface::queue_image`]; only the render thread
/// calls [`ExternalSurface::take_latest`].
#[derive(Default)]
pub struct ExternalSurface {
    latest: Mutex<Option<VideoFrame>>,
    default_size: Mutex<Option<CaptureSize>>,
    listener: Mutex<Option<SurfaceListener>>,
    queued: AtomicU64,
}

impl ExternalSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size producers should write at, set when the session is configured.
    pub fn set_default_buffer_size(&self, size: CaptureSize) {
        *self.default_size.lock().unwrap_or_else(|e| e.into_inner()) = Some(size);
    }

    pub fn default_buffer_size(&self) -> Option<CaptureSize> {
        *self.default_size.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_on_frame_available(&self, listener: SurfaceListener) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    pub fn clear_on_frame_available(&self) {
        self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Replaces the latest image and fires the frame-available listener.
    pub fn queue_image(&self, frame: VideoFrame) {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
        self.queued.fetch_add(1, Ordering::Relaxed);

        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    /// Takes the newest image, if one arrived since the last call.
    pub fn take_latest(&self) -> Option<VideoFrame> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn images_queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ExternalSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalSurface")
            .field("default_size", &self.default_buffer_size())
            .field("queued", &self.images_queued())
            .finish()
    }
}

/// The only state shared between the surface notification thread and the
/// render thread.
pub struct FrameSignal {
    pending_update: AtomicBool,
    request_on_frame: AtomicBool,
    requester: RenderRequester,
}

impl FrameSignal {
    /// `request_on_frame` decides whether each notification asks for a redraw
    /// or leaves that to the CPU path.
    pub fn new(requester: RenderRequester, request_on_frame: bool) -> Self {
        Self {
            pending_update: AtomicBool::new(false),
            request_on_frame: AtomicBool::new(request_on_frame),
            requester,
        }
    }

    /// Called from the notification thread. Never draws.
    pub fn notify_frame_available(&self) {
        self.pending_update.store(true, Ordering::Release);
        if self.request_on_frame.load(Ordering::Acquire) {
            (self.requester)();
        }
    }

    /// Clears and returns the pending flag. Render thread only.
    pub fn take_pending(&self) -> bool {
        self.pending_update.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending_update.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.pending_update.store(false, Ordering::Release);
    }

    pub fn set_request_on_frame(&self, value: bool) {
        self.request_on_frame.store(value, Ordering::Release);
    }

    pub fn request_render(&self) {
        (self.requester)();
    }
}

impl std::fmt::Debug for FrameSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSignal")
            .field("pending_update", &self.is_pending())
            .field("request_on_frame", &self.request_on_frame.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::sync::atomic::AtomicUsize;

    fn counting_requester() -> (RenderRequester, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        (Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }), count)
    }

    #[test]
    fn notification_sets_pending_and_requests_render() {
        let (requester, renders) = counting_requester();
        let signal = FrameSignal::new(requester, true);
        signal.notify_frame_available();
        assert!(signal.is_pending());
        assert_eq!(renders.load(Ordering::SeqCst), 1);

        assert!(signal.take_pending());
        assert!(!signal.take_pending());
    }

    #[test]
    fn sync_mode_leaves_render_request_to_cpu_path() {
        let (requester, renders) = counting_requester();
        let signal = FrameSignal::new(requester, false);
        signal.notify_frame_available();
        assert!(signal.is_pending());
        assert_eq!(renders.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn queue_image_replaces_latest_and_notifies() {
        let surface = ExternalSurface::new();
        let (requester, _) = counting_requester();
        let signal = Arc::new(FrameSignal::new(requester, true));
        let listener_signal = Arc::clone(&signal);
        surface.set_on_frame_available(Arc::new(move || listener_signal.notify_frame_available()));

        surface.queue_image(VideoFrame::from_data(1, 1, PixelFormat::Rgba, vec![1, 2, 3, 4]));
        surface.queue_image(VideoFrame::from_data(1, 1, PixelFormat::Rgba, vec![5, 6, 7, 8]));

        assert!(signal.take_pending());
        assert_eq!(surface.take_latest().unwrap().data, vec![5, 6, 7, 8]);
        assert!(surface.take_latest().is_none());
        assert_eq!(surface.images_queued(), 2);
    }
}
