use std::time::{Duration, Instant};

/// Counts events and reports their rate once per interval.
///
/// The presenter uses it for draw rate, headless mode for converted frames.
#[derive(Debug)]
pub struct FpsCounter {
    window_count: u32,
    total: u64,
    window_start: Instant,
    interval: Duration,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            window_count: 0,
            total: 0,
            window_start: Instant::now(),
            interval,
        }
    }

    /// Records one event. Returns the rate when the interval has elapsed.
    pub fn update(&mut self) -> Option<f32> {
        self.record(1, Instant::now())
    }

    /// Records `count` events observed at `now`.
    pub fn record(&mut self, count: u32, now: Instant) -> Option<f32> {
        self.window_count += count;
        self.total += u64::from(count);
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }
        let rate = self.window_count as f32 / elapsed.as_secs_f32();
        self.window_count = 0;
        self.window_start = now;
        Some(rate)
    }

    /// Events recorded since creation.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}
