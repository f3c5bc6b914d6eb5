use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::processing::frame::ProcessedFrame;

/// Single-slot hand-off of the latest processed frame.
///
/// Publishing swaps in a fully built frame; readers get whichever frame was
/// current at load time and keep it alive for as long as they hold the `Arc`.
#[derive(Default)]
pub struct FrameSlot {
    latest: ArcSwapOption<ProcessedFrame>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame.
    pub fn publish(&self, frame: Arc<ProcessedFrame>) {
        self.latest.store(Some(frame));
    }

    pub fn latest(&self) -> Option<Arc<ProcessedFrame>> {
        self.latest.load_full()
    }

    pub fn clear(&self) {
        self.latest.store(None);
    }
}
