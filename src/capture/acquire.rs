//! CPU frame path: latest-wins acquisition with a single in-flight conversion.

use super::reader::FrameReader;
use super::worker::BackgroundWorker;
use crate::convert::{ColorConverter, PlaneBuffers};
use crate::render::surface::RenderRequester;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// A converted ARGB8888 frame handed to the consumer.
#[derive(Debug, Clone, Copy)]
pub struct PackedFrame<'a> {
    pub pixels: &'a [u32],
    pub width: u32,
    pub height: u32,
    pub timestamp_ns: u64,
}

/// Receives converted frames on the conversion executor.
pub type PackedFrameConsumer = Arc<dyn Fn(PackedFrame<'_>) + Send + Sync>;

#[derive(Default)]
struct Scratch {
    planes: PlaneBuffers,
    converter: ColorConverter,
}

struct Shared {
    busy: AtomicBool,
    generation: AtomicU64,
    scratch: Mutex<Scratch>,
    consumer: PackedFrameConsumer,
    render_requester: Mutex<Option<RenderRequester>>,
    processed: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    last_processing_us: AtomicU64,
}

/// Clears `busy` when the hand-off finishes, however it finishes.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Converts reader frames to packed ARGB, dropping frames while busy.
pub struct FrameProcessor {
    shared: Arc<Shared>,
    executor: Arc<BackgroundWorker>,
}

impl FrameProcessor {
    /// Starts a dedicated conversion executor.
    pub fn new(consumer: PackedFrameConsumer) -> std::io::Result<Arc<Self>> {
        let executor = Arc::new(BackgroundWorker::start("frame-processor")?);
        Ok(Self::with_executor(consumer, executor))
    }

    /// Runs conversions on an existing executor.
    pub fn with_executor(consumer: PackedFrameConsumer, executor: Arc<BackgroundWorker>) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                busy: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                scratch: Mutex::new(Scratch::default()),
                consumer,
                render_requester: Mutex::new(None),
                processed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                last_processing_us: AtomicU64::new(0),
            }),
            executor,
        })
    }

    /// When set, a redraw is requested after each completed conversion.
    pub fn set_render_requester(&self, requester: Option<RenderRequester>) {
        *self.shared.render_requester.lock().unwrap_or_else(|e| e.into_inner()) = requester;
    }

    /// Registers this processor as the reader's frame-available listener.
    pub fn attach(self: &Arc<Self>, reader: &FrameReader) {
        let weak = Arc::downgrade(self);
        reader.set_listener(Arc::new(move |reader: &FrameReader| {
            if let Some(processor) = weak.upgrade() {
                processor.on_frame_available(reader);
            }
        }));
    }

    /// Frame-available handler. Never blocks on conversion.
    pub fn on_frame_available(&self, reader: &FrameReader) {
        let Some(frame) = reader.acquire_latest() else {
            return;
        };

        if self.shared.busy.swap(true, Ordering::AcqRel) {
            trace!(timestamp_ns = frame.timestamp_ns, "Conversion in flight, dropping frame");
            frame.close();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let (width, height, timestamp_ns) = (frame.width, frame.height, frame.timestamp_ns);
        self.shared
            .scratch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .planes
            .fill(frame.planes());
        frame.close();

        let generation = self.shared.generation.load(Ordering::Acquire);
        let shared = Arc::clone(&self.shared);
        let posted = self
            .executor
            .post(move || shared.process(generation, width, height, timestamp_ns));
        if !posted {
            self.shared.busy.store(false, Ordering::Release);
        }
    }

    /// Discards the result of any conversion already handed off.
    pub fn invalidate(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// A handle that invalidates this processor from another owner.
    pub fn invalidator(&self) -> Arc<dyn Fn() + Send + Sync> {
        let shared = Arc::clone(&self.shared);
        Arc::new(move || {
            shared.generation.fetch_add(1, Ordering::AcqRel);
        })
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    pub fn frames_processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    /// Frames released unconverted because a conversion was in flight.
    pub fn frames_dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Frames whose planes could not be converted.
    pub fn frames_skipped(&self) -> u64 {
        self.shared.skipped.load(Ordering::Relaxed)
    }

    pub fn last_processing_time_us(&self) -> u64 {
        self.shared.last_processing_us.load(Ordering::Relaxed)
    }

    /// Waits for queued conversions and stops the executor.
    pub fn shutdown(&self) {
        self.invalidate();
        self.executor.quit_safely();
    }
}

impl Shared {
    fn process(&self, generation: u64, width: u32, height: u32, timestamp_ns: u64) {
        let _busy = BusyGuard(&self.busy);
        let started = Instant::now();

        let delivered = {
            let mut scratch = self.scratch.lock().unwrap_or_else(|e| e.into_inner());
            let Scratch { planes, converter } = &mut *scratch;
            match converter.convert(planes, width, height) {
                Ok(pixels) => {
                    if self.generation.load(Ordering::Acquire) != generation {
                        debug!(timestamp_ns, "Discarding conversion from a closed session");
                        false
                    } else {
                        let frame = PackedFrame {
                            pixels,
                            width,
                            height,
                            timestamp_ns,
                        };
                        let consumer = &self.consumer;
                        if panic::catch_unwind(AssertUnwindSafe(|| consumer(frame))).is_err() {
                            error!(timestamp_ns, "Frame consumer panicked, skipping frame");
                        }
                        true
                    }
                }
                Err(err) => {
                    warn!(%err, width, height, "Skipping malformed frame");
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        };

        self.last_processing_us
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        // The session may have closed while the consumer ran.
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        if delivered {
            self.processed.fetch_add(1, Ordering::Relaxed);
        }

        // A skipped frame still wakes the renderer so it never waits on it.
        let requester = self.render_requester.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(requester) = requester {
            requester();
        }
    }
}

impl std::fmt::Debug for FrameProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameProcessor")
            .field("busy", &self.is_busy())
            .field("processed", &self.frames_processed())
            .field("dropped", &self.frames_dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, PlaneDescriptor};
    use crate::testing::wait_until;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn gray_frame(ts: u64) -> Frame {
        Frame::new(
            4,
            2,
            ts,
            vec![
                PlaneDescriptor::new(vec![128; 8], 4, 1),
                PlaneDescriptor::new(vec![128; 2], 2, 1),
                PlaneDescriptor::new(vec![128; 2], 2, 1),
            ],
        )
    }

    fn recording_consumer() -> (PackedFrameConsumer, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let consumer: PackedFrameConsumer = Arc::new(move |frame: PackedFrame<'_>| {
            assert_eq!(frame.pixels.len(), 8);
            sink.lock().unwrap().push(frame.timestamp_ns);
        });
        (consumer, seen)
    }

    #[test]
    fn converts_latest_frame() {
        let (consumer, seen) = recording_consumer();
        let processor = FrameProcessor::new(consumer).unwrap();
        let reader = FrameReader::new(2);
        processor.attach(&reader);

        reader.push(gray_frame(7));
        assert!(wait_until(WAIT, || processor.frames_processed() == 1));
        assert!(wait_until(WAIT, || !processor.is_busy()));
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn notifications_during_conversion_are_dropped() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let conversions = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&conversions);
        let consumer: PackedFrameConsumer = Arc::new(move |_frame: PackedFrame<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = entered_tx.send(());
            let _ = release_rx.lock().unwrap().recv();
        });
        let processor = FrameProcessor::new(consumer).unwrap();
        let reader = FrameReader::new(2);
        processor.attach(&reader);

        reader.push(gray_frame(0));
        entered_rx.recv_timeout(WAIT).unwrap();
        for ts in 1..=10 {
            reader.push(gray_frame(ts));
        }
        assert_eq!(processor.frames_dropped(), 10);
        assert_eq!(reader.pending(), 0);

        release_tx.send(()).unwrap();
        assert!(wait_until(WAIT, || !processor.is_busy()));
        assert_eq!(conversions.load(Ordering::SeqCst), 1);

        reader.push(gray_frame(11));
        entered_rx.recv_timeout(WAIT).unwrap();
        release_tx.send(()).unwrap();
        assert!(wait_until(WAIT, || processor.frames_processed() == 2));
        assert_eq!(conversions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalidated_conversion_is_discarded() {
        let (consumer, seen) = recording_consumer();
        let executor = Arc::new(BackgroundWorker::start("blocked-executor").unwrap());
        let (release_tx, release_rx) = mpsc::channel::<()>();
        executor.post(move || {
            let _ = release_rx.recv();
        });
        let processor = FrameProcessor::with_executor(consumer, Arc::clone(&executor));
        let reader = FrameReader::new(2);
        processor.attach(&reader);

        reader.push(gray_frame(1));
        assert!(processor.is_busy());
        processor.invalidate();
        release_tx.send(()).unwrap();

        assert!(wait_until(WAIT, || !processor.is_busy()));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(processor.frames_processed(), 0);
    }

    #[test]
    fn malformed_frame_is_skipped_and_pipeline_continues() {
        let (consumer, seen) = recording_consumer();
        let processor = FrameProcessor::new(consumer).unwrap();
        let reader = FrameReader::new(2);
        processor.attach(&reader);

        reader.push(Frame::new(4, 2, 1, vec![PlaneDescriptor::new(vec![0; 8], 4, 1)]));
        assert!(wait_until(WAIT, || processor.frames_skipped() == 1));
        assert!(wait_until(WAIT, || !processor.is_busy()));

        reader.push(gray_frame(2));
        assert!(wait_until(WAIT, || processor.frames_processed() == 1));
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn panicking_consumer_does_not_wedge_busy_flag() {
        let consumer: PackedFrameConsumer = Arc::new(|_frame: PackedFrame<'_>| panic!("consumer failure"));
        let processor = FrameProcessor::new(consumer).unwrap();
        let reader = FrameReader::new(2);
        processor.attach(&reader);

        reader.push(gray_frame(1));
        assert!(wait_until(WAIT, || processor.frames_processed() == 1));
        assert!(wait_until(WAIT, || !processor.is_busy()));
    }

    #[test]
    fn completed_conversion_requests_render() {
        let (consumer, _) = recording_consumer();
        let processor = FrameProcessor::new(consumer).unwrap();
        let renders = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&renders);
        processor.set_render_requester(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let reader = FrameReader::new(2);
        processor.attach(&reader);

        reader.push(gray_frame(1));
        assert!(wait_until(WAIT, || renders.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn malformed_frame_still_requests_render() {
        let (consumer, seen) = recording_consumer();
        let processor = FrameProcessor::new(consumer).unwrap();
        let renders = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&renders);
        processor.set_render_requester(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let reader = FrameReader::new(2);
        processor.attach(&reader);

        reader.push(Frame::new(4, 2, 1, vec![PlaneDescriptor::new(vec![0; 8], 4, 1)]));
        assert!(wait_until(WAIT, || renders.load(Ordering::SeqCst) == 1));
        assert_eq!(processor.frames_skipped(), 1);
        assert_eq!(processor.frames_processed(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn invalidation_during_consumer_is_not_counted() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let consumer: PackedFrameConsumer = Arc::new(move |_frame: PackedFrame<'_>| {
            let _ = entered_tx.send(());
            let _ = release_rx.lock().unwrap().recv();
        });
        let processor = FrameProcessor::new(consumer).unwrap();
        let renders = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&renders);
        processor.set_render_requester(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let reader = FrameReader::new(2);
        processor.attach(&reader);

        reader.push(gray_frame(1));
        entered_rx.recv_timeout(WAIT).unwrap();
        processor.invalidate();
        release_tx.send(()).unwrap();

        assert!(wait_until(WAIT, || !processor.is_busy()));
        assert_eq!(processor.frames_processed(), 0);
        assert_eq!(renders.load(Ordering::SeqCst), 0);
    }
}
