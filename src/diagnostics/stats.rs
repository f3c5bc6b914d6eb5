use serde::Serialize;
use std::time::{Duration, Instant};

use crate::camera::queue::QueueStats;

/// Collects diagnostic statistics for a running pipeline.
pub struct DiagnosticStats {
    frame_count: u64,
    failed_count: u64,
    queue: QueueStats,
    processing_total: Duration,
    last_processing: Duration,
    bytes_streamed: u64,
    viewers: usize,
    fps: Option<u32>,
    start_time: Instant,
}

/// Serialisable view of [`DiagnosticStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticSnapshot {
    pub fps: Option<u32>,
    pub average_fps: f64,
    pub frame_count: u64,
    pub drop_count: u64,
    pub drop_rate: f64,
    pub stall_count: u64,
    pub processing_failures: u64,
    pub last_processing_ms: f64,
    pub mean_processing_ms: f64,
    pub bytes_streamed: u64,
    pub bandwidth_bps: u64,
    pub viewers: usize,
}

impl DiagnosticStats {
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            failed_count: 0,
            queue: QueueStats::default(),
            processing_total: Duration::ZERO,
            last_processing: Duration::ZERO,
            bytes_streamed: 0,
            viewers: 0,
            fps: None,
            start_time: Instant::now(),
        }
    }

    /// Record a frame that made it through the bridge.
    pub fn record_frame(&mut self, processing: Duration) {
        self.frame_count += 1;
        self.processing_total += processing;
        self.last_processing = processing;
    }

    /// Record a frame the bridge rejected.
    pub fn record_failure(&mut self) {
        self.failed_count += 1;
    }

    /// Latest counters from the frame-delivery queue.
    pub fn set_queue_stats(&mut self, stats: QueueStats) {
        self.queue = stats;
    }

    pub fn record_streamed(&mut self, bytes: usize, viewers: usize) {
        self.bytes_streamed += bytes as u64;
        self.viewers = viewers;
    }

    pub fn set_viewers(&mut self, viewers: usize) {
        self.viewers = viewers;
    }

    pub fn set_fps(&mut self, fps: u32) {
        self.fps = Some(fps);
    }

    /// Frames per second since the stats were (re)started.
    pub fn average_fps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        self.frame_count as f64 / elapsed
    }

    /// Share of produced frames the queue discarded (0.0 - 100.0).
    pub fn drop_rate(&self) -> f64 {
        let total = self.queue.submitted;
        if total == 0 {
            return 0.0;
        }
        ((self.queue.dropped + self.queue.skipped) as f64 / total as f64) * 100.0
    }

    pub fn mean_processing_ms(&self) -> f64 {
        if self.frame_count == 0 {
            return 0.0;
        }
        self.processing_total.as_secs_f64() * 1000.0 / self.frame_count as f64
    }

    pub fn bandwidth_bps(&self) -> u64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0;
        }
        (self.bytes_streamed as f64 / elapsed) as u64
    }

    /// Reset all counters, e.g. when a new session starts.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn snapshot(&self) -> DiagnosticSnapshot {
        DiagnosticSnapshot {
            fps: self.fps,
            average_fps: self.average_fps(),
            frame_count: self.frame_count,
            drop_count: self.queue.dropped + self.queue.skipped,
            drop_rate: self.drop_rate(),
            stall_count: self.queue.stalled,
            processing_failures: self.failed_count,
            last_processing_ms: self.last_processing.as_secs_f64() * 1000.0,
            mean_processing_ms: self.mean_processing_ms(),
            bytes_streamed: self.bytes_streamed,
            bandwidth_bps: self.bandwidth_bps(),
            viewers: self.viewers,
        }
    }
}

impl Default for DiagnosticStats {
    fn default() -> Self {
        Self::new()
    }
}
