use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Length of one measurement window.
pub const FPS_WINDOW: Duration = Duration::from_millis(1000);

/// Receives each completed window's rate.
///
/// Called on the capture thread, so a sink owned by another thread must only
/// hand the value off (e.g. push it onto a channel).
pub type FpsSink = Arc<dyn Fn(u32) + Send + Sync>;

/// Frame counter over a one-second window.
#[derive(Debug, Default, Clone)]
pub struct FpsWindow {
    count: u32,
    window_start: Option<Instant>,
}

impl FpsWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one frame arriving at `now`. Returns the rate when the window
    /// has spanned a full second, then starts a new window at `now`.
    pub fn record(&mut self, now: Instant) -> Option<u32> {
        let start = *self.window_start.get_or_insert(now);
        self.count += 1;
        if now.saturating_duration_since(start) >= FPS_WINDOW {
            let rate = self.count;
            self.count = 0;
            self.window_start = Some(now);
            Some(rate)
        } else {
            None
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Thread-safe FPS counter feeding a display sink.
pub struct FpsCounter {
    window: Mutex<FpsWindow>,
    sink: FpsSink,
    last: Mutex<Option<u32>>,
}

impl FpsCounter {
    pub fn new(sink: FpsSink) -> Self {
        Self {
            window: Mutex::new(FpsWindow::new()),
            sink,
            last: Mutex::new(None),
        }
    }

    /// Count a delivered frame; forwards the rate when a window closes.
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&self, now: Instant) {
        let rate = self.window.lock().record(now);
        if let Some(rate) = rate {
            *self.last.lock() = Some(rate);
            (self.sink)(rate);
        }
    }

    /// Most recently emitted rate.
    pub fn last(&self) -> Option<u32> {
        *self.last.lock()
    }
}
