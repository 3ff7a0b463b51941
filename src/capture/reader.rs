//! Bounded off-screen frame reader.

use crate::frame::Frame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Invoked on the producer thread after a frame is queued.
pub type FrameAvailableListener = Arc<dyn Fn(&FrameReader) + Send + Sync>;

/// Holds at most `max_images` undelivered planar frames.
///
/// The producer never blocks: when the buffer is full the oldest frame is
/// released to make room.
pub struct FrameReader {
    max_images: usize,
    queue: Mutex<VecDeque<Frame>>,
    listener: Mutex<Option<FrameAvailableListener>>,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl FrameReader {
    pub fn new(max_images: usize) -> Self {
        Self {
            max_images: max_images.max(1),
            queue: Mutex::new(VecDeque::with_capacity(max_images.max(1))),
            listener: Mutex::new(None),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn max_images(&self) -> usize {
        self.max_images
    }

    pub fn set_listener(&self, listener: FrameAvailableListener) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    pub fn clear_listener(&self) {
        self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Queues a frame from the producer and notifies the listener.
    pub fn push(&self, frame: Frame) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            while queue.len() >= self.max_images {
                if let Some(oldest) = queue.pop_front() {
                    trace!(timestamp_ns = oldest.timestamp_ns, "Reader full, releasing oldest frame");
                    oldest.close();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            queue.push_back(frame);
        }
        self.pushed.fetch_add(1, Ordering::Relaxed);

        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(listener) = listener {
            listener(self);
        }
    }

    /// Takes the newest frame and releases every older one.
    pub fn acquire_latest(&self) -> Option<Frame> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let latest = queue.pop_back();
        let stale = queue.len() as u64;
        for frame in queue.drain(..) {
            frame.close();
        }
        if stale > 0 {
            self.dropped.fetch_add(stale, Ordering::Relaxed);
        }
        latest
    }

    /// Number of frames currently waiting.
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn frames_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Frames released without ever being acquired.
    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("max_images", &self.max_images)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PlaneDescriptor;
    use std::sync::atomic::AtomicUsize;

    fn frame(ts: u64) -> Frame {
        Frame::new(2, 2, ts, vec![PlaneDescriptor::new(vec![0; 4], 2, 1)])
    }

    #[test]
    fn acquire_latest_wins_and_drops_older() {
        let reader = FrameReader::new(3);
        reader.push(frame(1));
        reader.push(frame(2));
        reader.push(frame(3));

        let latest = reader.acquire_latest().unwrap();
        assert_eq!(latest.timestamp_ns, 3);
        assert_eq!(reader.pending(), 0);
        assert_eq!(reader.frames_dropped(), 2);
        assert!(reader.acquire_latest().is_none());
    }

    #[test]
    fn producer_never_exceeds_capacity() {
        let reader = FrameReader::new(2);
        for ts in 0..10 {
            reader.push(frame(ts));
            assert!(reader.pending() <= 2);
        }
        assert_eq!(reader.frames_pushed(), 10);
        assert_eq!(reader.frames_dropped(), 8);
        assert_eq!(reader.acquire_latest().unwrap().timestamp_ns, 9);
    }

    #[test]
    fn listener_fires_per_push() {
        let reader = FrameReader::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        reader.set_listener(Arc::new(move |reader: &FrameReader| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(reader.pending() >= 1);
        }));
        reader.push(frame(1));
        reader.push(frame(2));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        reader.clear_listener();
        reader.push(frame(3));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
