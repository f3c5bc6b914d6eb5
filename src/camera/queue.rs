//! Bounded frame-delivery queue between the device and the dispatch thread.
//!
//! The queue owns a fixed pool of `depth` plane buffers. The producer fills
//! a free buffer; when none is free it recycles the oldest queued image
//! (drop-oldest / keep-latest). When every buffer is held by the consumer the
//! device stalls and the frame is lost at the source. Consumers receive an
//! [`AcquiredImage`] guard that hands its buffer back to the pool on drop, so
//! release happens on every path including unwinding.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::camera::types::FrameSize;

/// Callback fired on the producer thread after an image was queued.
pub type ImageAvailableListener = Arc<dyn Fn() + Send + Sync>;

/// Planar YUV 4:2:0 sensor planes.
#[derive(Debug, Default, Clone)]
pub struct PlaneSet {
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl PlaneSet {
    /// Resize every plane to the lengths required by `size`.
    pub fn reshape(&mut self, size: FrameSize) {
        let chroma = size.chroma_size().pixel_count();
        self.y.resize(size.pixel_count(), 0);
        self.u.resize(chroma, 0);
        self.v.resize(chroma, 0);
    }
}

/// One filled buffer waiting in (or taken from) the queue.
#[derive(Debug)]
pub struct HardwareImage {
    pub planes: PlaneSet,
    pub size: FrameSize,
    pub sequence: u64,
    pub timestamp_us: u64,
}

/// Result of handing a frame to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stored in a free buffer.
    Queued,
    /// Stored by recycling the oldest unconsumed image.
    DroppedOldest,
    /// Every buffer is held by the consumer; the frame was lost.
    Stalled,
    /// The queue was closed.
    Closed,
}

/// Counters describing queue behaviour since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub submitted: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub stalled: u64,
}

struct QueueState {
    free: Vec<PlaneSet>,
    ready: VecDeque<HardwareImage>,
    acquired: usize,
    closed: bool,
    next_sequence: u64,
    stats: QueueStats,
}

/// Fixed-depth image queue with drop-oldest backpressure.
pub struct FrameQueue {
    depth: usize,
    state: Mutex<QueueState>,
    listener: Mutex<Option<ImageAvailableListener>>,
}

impl FrameQueue {
    /// Create a queue backed by `depth` buffers. A depth of zero is clamped to 1.
    pub fn new(depth: usize) -> Arc<Self> {
        let depth = depth.max(1);
        Arc::new(Self {
            depth,
            state: Mutex::new(QueueState {
                free: (0..depth).map(|_| PlaneSet::default()).collect(),
                ready: VecDeque::with_capacity(depth),
                acquired: 0,
                closed: false,
                next_sequence: 1,
                stats: QueueStats::default(),
            }),
            listener: Mutex::new(None),
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Register the image-available callback, replacing any previous one.
    pub fn set_listener(&self, listener: ImageAvailableListener) {
        *self.listener.lock() = Some(listener);
    }

    /// Fill a buffer with `fill` and queue it.
    ///
    /// The fill closure runs without the queue lock held.
    pub fn submit<F>(&self, size: FrameSize, timestamp_us: u64, fill: F) -> SubmitOutcome
    where
        F: FnOnce(&mut PlaneSet),
    {
        let (mut planes, mut outcome) = {
            let mut state = self.state.lock();
            if state.closed {
                return SubmitOutcome::Closed;
            }
            state.stats.submitted += 1;
            if let Some(planes) = state.free.pop() {
                (planes, SubmitOutcome::Queued)
            } else if let Some(oldest) = state.ready.pop_front() {
                state.stats.dropped += 1;
                tracing::trace!(sequence = oldest.sequence, "dropping oldest queued frame");
                (oldest.planes, SubmitOutcome::DroppedOldest)
            } else {
                state.stats.stalled += 1;
                return SubmitOutcome::Stalled;
            }
        };

        planes.reshape(size);
        fill(&mut planes);

        {
            let mut state = self.state.lock();
            if state.closed {
                outcome = SubmitOutcome::Closed;
            } else {
                let sequence = state.next_sequence;
                state.next_sequence += 1;
                state.ready.push_back(HardwareImage {
                    planes,
                    size,
                    sequence,
                    timestamp_us,
                });
            }
        }

        if outcome != SubmitOutcome::Closed {
            let listener = self.listener.lock().clone();
            if let Some(listener) = listener {
                listener();
            }
        }
        outcome
    }

    /// Take the newest queued image, releasing any older ones unread.
    pub fn acquire_latest(self: &Arc<Self>) -> Option<AcquiredImage> {
        let mut state = self.state.lock();
        let image = state.ready.pop_back()?;
        while let Some(stale) = state.ready.pop_front() {
            state.stats.skipped += 1;
            state.free.push(stale.planes);
        }
        state.acquired += 1;
        state.stats.delivered += 1;
        Some(AcquiredImage {
            image: Some(image),
            queue: Arc::clone(self),
        })
    }

    /// Number of images waiting to be consumed.
    pub fn pending(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Number of images currently held by consumers.
    pub fn outstanding(&self) -> usize {
        self.state.lock().acquired
    }

    /// Sequence numbers of the queued images, oldest first.
    pub fn pending_sequences(&self) -> Vec<u64> {
        self.state.lock().ready.iter().map(|i| i.sequence).collect()
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the queue and free every pooled buffer. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.ready.clear();
        state.free.clear();
        drop(state);
        self.listener.lock().take();
    }

    fn release(&self, planes: PlaneSet) {
        let mut state = self.state.lock();
        state.acquired = state.acquired.saturating_sub(1);
        if !state.closed {
            state.free.push(planes);
        }
    }
}

/// An image taken from the queue. Its buffer goes back to the pool on drop.
pub struct AcquiredImage {
    image: Option<HardwareImage>,
    queue: Arc<FrameQueue>,
}

impl AcquiredImage {
    pub fn size(&self) -> FrameSize {
        self.image().size
    }

    pub fn sequence(&self) -> u64 {
        self.image().sequence
    }

    pub fn timestamp_us(&self) -> u64 {
        self.image().timestamp_us
    }

    pub fn planes(&self) -> &PlaneSet {
        &self.image().planes
    }

    fn image(&self) -> &HardwareImage {
        // Only `Drop` takes the image out.
        match &self.image {
            Some(image) => image,
            None => unreachable!("acquired image accessed after release"),
        }
    }
}

impl Deref for AcquiredImage {
    type Target = PlaneSet;

    fn deref(&self) -> &PlaneSet {
        self.planes()
    }
}

impl Drop for AcquiredImage {
    fn drop(&mut self) {
        if let Some(image) = self.image.take() {
            self.queue.release(image.planes);
        }
    }
}
