use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::camera::backend::{CameraBackend, DeviceEventCallback, DeviceHandle};
use crate::camera::error::{CaptureError, Result};
use crate::camera::queue::{FrameQueue, PlaneSet, SubmitOutcome};
use crate::camera::types::{CameraDevice, DeviceEvent, DeviceId, FrameSize, StreamConfig};

const DUMMY_DEVICE_ID: &str = "dummy:test:camera-001";
const DUMMY_DEVICE_NAME: &str = "Dummy Test Camera";

/// Largest frame the synthetic sensor will produce.
const MAX_DIMENSION: u32 = 8192;

#[derive(Default)]
struct DummyState {
    open: HashSet<DeviceId>,
    callbacks: HashMap<DeviceId, DeviceEventCallback>,
    fail_next_open: Option<CaptureError>,
    fail_configure: bool,
}

/// A fake camera backend producing a moving YUV 4:2:0 test pattern.
///
/// Enable via `DUMMY_CAMERA=1`; it is also the fallback when no native
/// backend exists for the platform. Supports fault injection so the session
/// controller can be exercised without hardware.
pub struct DummyBackend {
    state: Arc<Mutex<DummyState>>,
    closes: Arc<AtomicUsize>,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DummyState::default())),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether the dummy camera is enabled via environment variable.
    pub fn is_enabled() -> bool {
        std::env::var("DUMMY_CAMERA").is_ok_and(|v| v == "1" || v == "true")
    }

    /// The stable device ID for the dummy camera.
    pub fn device_id() -> DeviceId {
        DeviceId::new(DUMMY_DEVICE_ID)
    }

    /// Make the next `open` fail with `err`.
    pub fn fail_next_open(&self, err: CaptureError) {
        self.state.lock().fail_next_open = Some(err);
    }

    /// Make `start_repeating` fail for every handle opened afterwards.
    pub fn fail_configure(&self, fail: bool) {
        self.state.lock().fail_configure = fail;
    }

    /// Raise a device event as the hardware would.
    pub fn emit_event(&self, id: &DeviceId, event: DeviceEvent) {
        let callback = self.state.lock().callbacks.get(id).cloned();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    /// Whether some handle currently holds `id`.
    pub fn is_open(&self, id: &DeviceId) -> bool {
        self.state.lock().open.contains(id)
    }

    /// Number of device handles actually released.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for DummyBackend {
    fn enumerate_devices(&self) -> Result<Vec<CameraDevice>> {
        Ok(vec![CameraDevice {
            id: Self::device_id(),
            name: DUMMY_DEVICE_NAME.to_string(),
            is_connected: true,
        }])
    }

    fn open(&self, id: &DeviceId, events: DeviceEventCallback) -> Result<Box<dyn DeviceHandle>> {
        if id != &Self::device_id() {
            return Err(CaptureError::DeviceNotFound(id.to_string()));
        }

        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_open.take() {
            return Err(err);
        }
        if !state.open.insert(id.clone()) {
            return Err(CaptureError::DeviceAccess(format!("{id} is already in use")));
        }
        state.callbacks.insert(id.clone(), events);
        let fail_configure = state.fail_configure;
        drop(state);

        tracing::debug!(device = %id, "dummy camera opened");
        Ok(Box::new(DummyHandle {
            id: id.clone(),
            backend: Arc::clone(&self.state),
            closes: Arc::clone(&self.closes),
            fail_configure,
            producer: None,
            closed: false,
        }))
    }
}

struct Producer {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Open handle on the dummy camera.
pub struct DummyHandle {
    id: DeviceId,
    backend: Arc<Mutex<DummyState>>,
    closes: Arc<AtomicUsize>,
    fail_configure: bool,
    producer: Option<Producer>,
    closed: bool,
}

impl DeviceHandle for DummyHandle {
    fn start_repeating(&mut self, config: StreamConfig, queue: Arc<FrameQueue>) -> Result<()> {
        if self.closed {
            return Err(CaptureError::DeviceAccess(format!("{} is closed", self.id)));
        }
        if self.fail_configure {
            return Err(CaptureError::ConfigurationFailed(
                "dummy camera rejected the stream configuration".to_string(),
            ));
        }
        let FrameSize { width, height } = config.size;
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(CaptureError::ConfigurationFailed(format!(
                "unsupported size {}",
                config.size
            )));
        }

        self.stop_repeating();

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name(format!("capture-{}", self.id))
            .spawn(move || run_producer(&queue, config, &running_clone))
            .map_err(|e| CaptureError::Worker(format!("failed to spawn capture thread: {e}")))?;

        self.producer = Some(Producer { running, thread });
        Ok(())
    }

    fn stop_repeating(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.running.store(false, Ordering::Relaxed);
            if producer.thread.thread().id() != std::thread::current().id() {
                let _ = producer.thread.join();
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop_repeating();
        self.closed = true;
        let mut state = self.backend.lock();
        state.open.remove(&self.id);
        state.callbacks.remove(&self.id);
        drop(state);
        self.closes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(device = %self.id, "dummy camera closed");
    }
}

impl Drop for DummyHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Producer loop: submits one frame per frame interval until stopped.
fn run_producer(queue: &FrameQueue, config: StreamConfig, running: &AtomicBool) {
    let fps = if config.fps.is_finite() && config.fps > 0.0 {
        config.fps
    } else {
        30.0
    };
    let interval = Duration::from_secs_f32(1.0 / fps);
    let start = Instant::now();
    let mut next_deadline = start;
    let mut tick: u32 = 0;

    while running.load(Ordering::Relaxed) {
        let timestamp_us = start.elapsed().as_micros() as u64;
        match queue.submit(config.size, timestamp_us, |planes| {
            paint_test_pattern(planes, config.size, tick)
        }) {
            SubmitOutcome::Closed => break,
            SubmitOutcome::Stalled => {
                tracing::debug!("consumer holds every buffer; frame lost at source");
            }
            SubmitOutcome::Queued | SubmitOutcome::DroppedOldest => {}
        }
        tick = tick.wrapping_add(1);
        next_deadline += interval;
        let now = Instant::now();
        if next_deadline > now {
            std::thread::sleep(next_deadline - now);
        } else {
            next_deadline = now;
        }
    }
}

/// Horizontal luma ramp with a bright vertical bar sweeping across, and
/// chroma split into four coloured quadrants.
pub fn paint_test_pattern(planes: &mut PlaneSet, size: FrameSize, tick: u32) {
    let width = size.width as usize;
    let height = size.height as usize;
    let bar_width = (width / 16).max(1);
    let bar_x = (tick as usize * 4) % width.max(1);

    for row in 0..height {
        let line = &mut planes.y[row * width..(row + 1) * width];
        for (x, px) in line.iter_mut().enumerate() {
            let in_bar = x >= bar_x && x < bar_x + bar_width;
            *px = if in_bar {
                235
            } else {
                16 + ((x * 200) / width.max(1)) as u8
            };
        }
    }

    let chroma = size.chroma_size();
    let cw = chroma.width as usize;
    let ch = chroma.height as usize;
    for row in 0..ch {
        for col in 0..cw {
            let idx = row * cw + col;
            let right = col >= cw / 2;
            let bottom = row >= ch / 2;
            planes.u[idx] = if right { 180 } else { 90 };
            planes.v[idx] = if bottom { 180 } else { 90 };
        }
    }
}
