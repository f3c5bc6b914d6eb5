//! Capture session controller.
//!
//! Owns the device handle, the frame-delivery queue and the capture-dispatch
//! worker thread. Device callbacks and image-available notifications are
//! funnelled through a channel into the dispatch thread, so lifecycle
//! transitions never run on the hardware thread and never re-enter the
//! controller lock from a callback.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::camera::backend::{CameraBackend, DeviceEventCallback, DeviceHandle, PermissionGate};
use crate::camera::error::{CaptureError, Result};
use crate::camera::queue::{AcquiredImage, FrameQueue};
use crate::camera::types::{CaptureSessionState, DeviceEvent, DeviceId, FrameSize, StreamConfig};

/// Upper bound on waiting for the dispatch thread during teardown.
const DISPATCH_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Consumer of delivered images. Runs on the capture-dispatch thread.
///
/// The image buffer is reclaimed as soon as `on_frame` returns; anything
/// needed afterwards must be copied out.
pub trait FrameHandler: Send {
    fn on_frame(&mut self, image: &AcquiredImage);
}

pub type SharedFrameHandler = Arc<Mutex<dyn FrameHandler>>;

/// User-visible session status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub device_id: Option<String>,
    pub state: CaptureSessionState,
    pub message: String,
    pub recoverable: bool,
}

/// Callback type for surfacing session status to the UI thread.
pub type StatusCallback = Arc<dyn Fn(&SessionStatus) + Send + Sync>;

enum DispatchMsg {
    FrameAvailable { generation: u64 },
    Device { generation: u64, event: DeviceEvent },
    Shutdown,
}

/// Background worker started specifically for capture dispatch.
struct Dispatcher {
    tx: mpsc::Sender<DispatchMsg>,
    frame_pending: Arc<AtomicBool>,
    exited: mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    fn start(shared: Weak<Shared>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let (exited_tx, exited) = mpsc::channel();
        let frame_pending = Arc::new(AtomicBool::new(false));
        let pending = Arc::clone(&frame_pending);

        let thread = std::thread::Builder::new()
            .name("capture-dispatch".to_string())
            .spawn(move || {
                run_dispatch(&shared, &rx, &pending);
                let _ = exited_tx.send(());
            })
            .map_err(|e| CaptureError::Worker(format!("failed to spawn dispatch thread: {e}")))?;

        Ok(Self {
            tx,
            frame_pending,
            exited,
            thread: Some(thread),
        })
    }

    /// Signal shutdown and wait a bounded time for the thread to exit.
    fn stop(mut self) {
        let _ = self.tx.send(DispatchMsg::Shutdown);
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        match self.exited.recv_timeout(DISPATCH_JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("capture-dispatch thread did not exit in time; detaching");
            }
        }
    }
}

struct ResumeTarget {
    device_id: DeviceId,
    config: Option<StreamConfig>,
}

struct Inner {
    state: CaptureSessionState,
    generation: u64,
    device_id: Option<DeviceId>,
    handle: Option<Box<dyn DeviceHandle>>,
    queue: Option<Arc<FrameQueue>>,
    dispatcher: Option<Dispatcher>,
    config: Option<StreamConfig>,
    resume: Option<ResumeTarget>,
}

impl Inner {
    /// Move to `next`, which must be a legal transition from the current
    /// state.
    fn transition(&mut self, next: CaptureSessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal capture transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }
}

/// Resources taken out of the controller, released without the lock held.
#[derive(Default)]
struct Released {
    handle: Option<Box<dyn DeviceHandle>>,
    queue: Option<Arc<FrameQueue>>,
    dispatcher: Option<Dispatcher>,
}

impl Released {
    fn is_empty(&self) -> bool {
        self.handle.is_none() && self.queue.is_none() && self.dispatcher.is_none()
    }

    /// Tear down in reverse acquisition order: repeating request, queue,
    /// device, dispatch thread.
    fn finish(self) {
        let Released {
            handle,
            queue,
            dispatcher,
        } = self;
        let mut handle = handle;
        if let Some(handle) = handle.as_mut() {
            handle.stop_repeating();
        }
        if let Some(queue) = queue {
            queue.close();
        }
        if let Some(mut handle) = handle {
            handle.close();
        }
        if let Some(dispatcher) = dispatcher {
            dispatcher.stop();
        }
    }
}

struct Shared {
    backend: Arc<dyn CameraBackend>,
    permission: Arc<dyn PermissionGate>,
    handler: SharedFrameHandler,
    on_status: Option<StatusCallback>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn report(&self, status: SessionStatus) {
        match status.state {
            CaptureSessionState::Error => warn!(state = %status.state, "{}", status.message),
            _ => info!(state = %status.state, "{}", status.message),
        }
        if let Some(cb) = &self.on_status {
            cb(&status);
        }
    }
}

fn status(
    device_id: Option<&DeviceId>,
    state: CaptureSessionState,
    message: impl Into<String>,
    recoverable: bool,
) -> SessionStatus {
    SessionStatus {
        device_id: device_id.map(|id| id.to_string()),
        state,
        message: message.into(),
        recoverable,
    }
}

fn error_status(device_id: Option<&DeviceId>, e: &CaptureError) -> SessionStatus {
    status(device_id, CaptureSessionState::Error, e.to_string(), e.is_recoverable())
}

/// Capture session state machine for a single device.
pub struct CaptureController {
    shared: Arc<Shared>,
}

impl CaptureController {
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        permission: Arc<dyn PermissionGate>,
        handler: SharedFrameHandler,
        on_status: Option<StatusCallback>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                permission,
                handler,
                on_status,
                inner: Mutex::new(Inner {
                    state: CaptureSessionState::Closed,
                    generation: 0,
                    device_id: None,
                    handle: None,
                    queue: None,
                    dispatcher: None,
                    config: None,
                    resume: None,
                }),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CaptureSessionState {
        self.shared.inner.lock().state
    }

    /// Device of the current (or last) session.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.shared.inner.lock().device_id.clone()
    }

    /// The active frame-delivery queue, if streaming.
    pub fn queue(&self) -> Option<Arc<FrameQueue>> {
        self.shared.inner.lock().queue.clone()
    }

    /// Open `device_id`. Starts the dispatch worker first, then the device.
    pub fn open(&self, device_id: &DeviceId) -> Result<CaptureSessionState> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if !matches!(
            inner.state,
            CaptureSessionState::Closed | CaptureSessionState::Error
        ) {
            return Err(CaptureError::InvalidState(inner.state.to_string()));
        }

        if !shared.permission.is_granted() {
            let e = CaptureError::PermissionDenied;
            inner.transition(CaptureSessionState::Closed);
            drop(inner);
            shared.permission.request();
            shared.report(status(
                Some(device_id),
                CaptureSessionState::Closed,
                "camera permission denied",
                e.is_recoverable(),
            ));
            return Err(e);
        }

        inner.transition(CaptureSessionState::Opening);
        inner.generation += 1;
        inner.device_id = Some(device_id.clone());
        inner.resume = None;
        let generation = inner.generation;

        if inner.dispatcher.is_none() {
            match Dispatcher::start(Arc::downgrade(shared)) {
                Ok(dispatcher) => inner.dispatcher = Some(dispatcher),
                Err(e) => {
                    inner.transition(CaptureSessionState::Error);
                    drop(inner);
                    shared.report(error_status(Some(device_id), &e));
                    return Err(e);
                }
            }
        }

        let opened = match inner.dispatcher.as_ref() {
            Some(dispatcher) => {
                let events = device_event_sink(dispatcher.tx.clone(), generation);
                shared.backend.open(device_id, events)
            }
            None => Err(CaptureError::Worker("dispatch thread missing".to_string())),
        };

        match opened {
            Ok(handle) => {
                inner.handle = Some(handle);
                inner.transition(CaptureSessionState::Open);
                drop(inner);
                shared.report(status(
                    Some(device_id),
                    CaptureSessionState::Open,
                    "camera opened",
                    false,
                ));
                Ok(CaptureSessionState::Open)
            }
            Err(e) => {
                inner.transition(CaptureSessionState::Error);
                drop(inner);
                error!(device = %device_id, "cannot access camera: {e}");
                shared.report(error_status(Some(device_id), &e));
                Err(e)
            }
        }
    }

    /// Create the frame-delivery queue and start the repeating request.
    ///
    /// Frames are then delivered to the injected [`FrameHandler`]. Calling
    /// this on an active session reconfigures it.
    pub fn configure(
        &self,
        size: FrameSize,
        queue_depth: usize,
        fps: f32,
    ) -> Result<CaptureSessionState> {
        let config = StreamConfig {
            size,
            queue_depth,
            fps,
        };
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if !matches!(
            inner.state,
            CaptureSessionState::Open | CaptureSessionState::Active
        ) {
            return Err(CaptureError::InvalidState(inner.state.to_string()));
        }

        inner.transition(CaptureSessionState::Configuring);
        if let Some(old) = inner.queue.take() {
            if let Some(handle) = inner.handle.as_mut() {
                handle.stop_repeating();
            }
            old.close();
        }

        let result = if queue_depth == 0 {
            Err(CaptureError::ConfigurationFailed(
                "queue depth must be at least 1".to_string(),
            ))
        } else {
            Self::start_stream(&mut inner, config)
        };

        let device_id = inner.device_id.clone();
        match result {
            Ok(()) => {
                inner.transition(CaptureSessionState::Active);
                inner.config = Some(config);
                drop(inner);
                shared.report(status(
                    device_id.as_ref(),
                    CaptureSessionState::Active,
                    format!("streaming {size} (queue depth {queue_depth})"),
                    false,
                ));
                Ok(CaptureSessionState::Active)
            }
            Err(e) => {
                inner.transition(CaptureSessionState::Error);
                let released = Released {
                    handle: inner.handle.take(),
                    queue: inner.queue.take(),
                    dispatcher: None,
                };
                drop(inner);
                released.finish();
                error!("failed to configure capture session: {e}");
                shared.report(error_status(device_id.as_ref(), &e));
                Err(e)
            }
        }
    }

    fn start_stream(inner: &mut Inner, config: StreamConfig) -> Result<()> {
        let generation = inner.generation;
        let (tx, pending) = match inner.dispatcher.as_ref() {
            Some(d) => (d.tx.clone(), Arc::clone(&d.frame_pending)),
            None => return Err(CaptureError::Worker("dispatch thread missing".to_string())),
        };
        let handle = inner
            .handle
            .as_mut()
            .ok_or_else(|| CaptureError::InvalidState("no device handle".to_string()))?;

        let queue = FrameQueue::new(config.queue_depth);
        let tx = Mutex::new(tx);
        queue.set_listener(Arc::new(move || {
            if !pending.swap(true, Ordering::AcqRel) {
                let _ = tx.lock().send(DispatchMsg::FrameAvailable { generation });
            }
        }));
        inner.queue = Some(Arc::clone(&queue));

        if let Err(e) = handle.start_repeating(config, Arc::clone(&queue)) {
            queue.close();
            inner.queue = None;
            return Err(e);
        }
        Ok(())
    }

    /// Close the session from any state. Idempotent; never blocks
    /// indefinitely on the dispatch thread.
    pub fn close(&self) {
        let (released, device_id) = {
            let mut inner = self.shared.inner.lock();
            inner.resume = None;
            inner.transition(CaptureSessionState::Closed);
            inner.config = None;
            (Self::take_all(&mut inner), inner.device_id.clone())
        };
        if released.is_empty() {
            return;
        }
        released.finish();
        self.shared.report(status(
            device_id.as_ref(),
            CaptureSessionState::Closed,
            "camera closed",
            false,
        ));
    }

    /// Host went to the background: release device, queue and dispatch
    /// thread, remembering what to restore.
    pub fn pause(&self) {
        let (released, device_id) = {
            let mut inner = self.shared.inner.lock();
            if let Some(device_id) = inner.device_id.clone() {
                if inner.state.holds_device() {
                    let config = match inner.state {
                        CaptureSessionState::Active => inner.config,
                        _ => None,
                    };
                    inner.resume = Some(ResumeTarget { device_id, config });
                }
            }
            inner.transition(CaptureSessionState::Closed);
            (Self::take_all(&mut inner), inner.device_id.clone())
        };
        if released.is_empty() {
            return;
        }
        released.finish();
        self.shared.report(status(
            device_id.as_ref(),
            CaptureSessionState::Closed,
            "capture paused",
            false,
        ));
    }

    /// Re-acquire what `pause` released: dispatch thread, device, queue,
    /// repeating request.
    pub fn resume(&self) -> Result<CaptureSessionState> {
        let target = self.shared.inner.lock().resume.take();
        let Some(target) = target else {
            return Ok(self.state());
        };
        let state = self.open(&target.device_id)?;
        match target.config {
            Some(config) => self.configure(config.size, config.queue_depth, config.fps),
            None => Ok(state),
        }
    }

    fn take_all(inner: &mut Inner) -> Released {
        Released {
            handle: inner.handle.take(),
            queue: inner.queue.take(),
            dispatcher: inner.dispatcher.take(),
        }
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.close();
    }
}

fn device_event_sink(tx: mpsc::Sender<DispatchMsg>, generation: u64) -> DeviceEventCallback {
    let tx = Mutex::new(tx);
    Arc::new(move |event| {
        let _ = tx.lock().send(DispatchMsg::Device { generation, event });
    })
}

fn run_dispatch(shared: &Weak<Shared>, rx: &mpsc::Receiver<DispatchMsg>, pending: &AtomicBool) {
    debug!("capture-dispatch thread started");
    while let Ok(msg) = rx.recv() {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match msg {
            DispatchMsg::Shutdown => break,
            DispatchMsg::FrameAvailable { generation } => {
                pending.store(false, Ordering::Release);
                dispatch_frame(&shared, generation);
            }
            DispatchMsg::Device { generation, event } => {
                handle_device_event(&shared, generation, event);
            }
        }
    }
    debug!("capture-dispatch thread exiting");
}

fn dispatch_frame(shared: &Shared, generation: u64) {
    let queue = {
        let inner = shared.inner.lock();
        if inner.generation != generation || inner.state != CaptureSessionState::Active {
            return;
        }
        inner.queue.clone()
    };
    let Some(queue) = queue else {
        return;
    };
    let Some(image) = queue.acquire_latest() else {
        return;
    };

    let sequence = image.sequence();
    let result = catch_unwind(AssertUnwindSafe(|| {
        shared.handler.lock().on_frame(&image);
    }));
    drop(image);
    if result.is_err() {
        error!(sequence, "frame handler panicked; frame skipped");
    }
}

fn handle_device_event(shared: &Shared, generation: u64, event: DeviceEvent) {
    let (released, device_id, next) = {
        let mut inner = shared.inner.lock();
        if inner.generation != generation || !inner.state.holds_device() {
            debug!(?event, "ignoring device event for stale session");
            return;
        }
        let next = match event {
            DeviceEvent::Disconnected => CaptureSessionState::Closed,
            DeviceEvent::Error(_) => CaptureSessionState::Error,
        };
        inner.transition(next);
        inner.config = None;
        let released = Released {
            handle: inner.handle.take(),
            queue: inner.queue.take(),
            dispatcher: None,
        };
        (released, inner.device_id.clone(), next)
    };
    released.finish();

    let report = match event {
        DeviceEvent::Disconnected => status(device_id.as_ref(), next, "camera disconnected", false),
        DeviceEvent::Error(code) => {
            error_status(device_id.as_ref(), &CaptureError::DeviceAccess(code))
        }
    };
    shared.report(report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::backend::StaticPermission;
    use crate::camera::dummy::DummyBackend;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct CountingHandler {
        frames: Vec<u64>,
        panic_on_first: bool,
    }

    impl FrameHandler for CountingHandler {
        fn on_frame(&mut self, image: &AcquiredImage) {
            self.frames.push(image.sequence());
            if self.panic_on_first && self.frames.len() == 1 {
                panic!("bridge exploded");
            }
        }
    }

    struct Fixture {
        backend: Arc<DummyBackend>,
        handler: Arc<Mutex<CountingHandler>>,
        statuses: Arc<Mutex<Vec<SessionStatus>>>,
        controller: CaptureController,
    }

    fn fixture_with(granted: bool, handler: CountingHandler) -> Fixture {
        let backend = Arc::new(DummyBackend::new());
        let handler = Arc::new(Mutex::new(handler));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_clone = Arc::clone(&statuses);
        let on_status: StatusCallback = Arc::new(move |s| statuses_clone.lock().push(s.clone()));
        let controller = CaptureController::new(
            Arc::clone(&backend) as Arc<dyn CameraBackend>,
            Arc::new(StaticPermission(granted)),
            Arc::clone(&handler) as SharedFrameHandler,
            Some(on_status),
        );
        Fixture {
            backend,
            handler,
            statuses,
            controller,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(true, CountingHandler::default())
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn small() -> FrameSize {
        FrameSize::new(32, 24)
    }

    #[test]
    fn open_without_permission_stays_closed() {
        let f = fixture_with(false, CountingHandler::default());
        let result = f.controller.open(&DummyBackend::device_id());
        assert_eq!(result, Err(CaptureError::PermissionDenied));
        assert_eq!(f.controller.state(), CaptureSessionState::Closed);
        assert!(!f.backend.is_open(&DummyBackend::device_id()));
        assert!(f.statuses.lock()[0].recoverable);
    }

    #[test]
    fn open_then_configure_reaches_active_and_delivers_frames() {
        let f = fixture();
        assert_eq!(
            f.controller.open(&DummyBackend::device_id()),
            Ok(CaptureSessionState::Open)
        );
        assert_eq!(
            f.controller.configure(small(), 2, 120.0),
            Ok(CaptureSessionState::Active)
        );
        assert!(wait_until(|| f.handler.lock().frames.len() >= 3));

        let frames = f.handler.lock().frames.clone();
        assert!(frames.windows(2).all(|w| w[0] < w[1]), "{frames:?}");
        f.controller.close();
    }

    #[test]
    fn configure_before_open_is_rejected() {
        let f = fixture();
        let result = f.controller.configure(small(), 2, 30.0);
        assert!(matches!(result, Err(CaptureError::InvalidState(_))));
    }

    #[test]
    fn second_controller_cannot_open_same_device() {
        let f = fixture();
        f.controller.open(&DummyBackend::device_id()).unwrap();

        let other = CaptureController::new(
            Arc::clone(&f.backend) as Arc<dyn CameraBackend>,
            Arc::new(StaticPermission(true)),
            Arc::new(Mutex::new(CountingHandler::default())),
            None,
        );
        let result = other.open(&DummyBackend::device_id());
        assert!(matches!(result, Err(CaptureError::DeviceAccess(_))));
        assert_eq!(other.state(), CaptureSessionState::Error);
    }

    #[test]
    fn configure_failure_moves_to_error_and_releases_everything() {
        let f = fixture();
        f.backend.fail_configure(true);
        f.controller.open(&DummyBackend::device_id()).unwrap();
        let result = f.controller.configure(small(), 2, 30.0);
        assert!(matches!(result, Err(CaptureError::ConfigurationFailed(_))));
        assert_eq!(f.controller.state(), CaptureSessionState::Error);
        assert!(f.controller.queue().is_none());
        assert!(!f.backend.is_open(&DummyBackend::device_id()));

        // Manual retry by reopening.
        f.backend.fail_configure(false);
        f.controller.open(&DummyBackend::device_id()).unwrap();
        assert_eq!(
            f.controller.configure(small(), 2, 30.0),
            Ok(CaptureSessionState::Active)
        );
    }

    #[test]
    fn zero_queue_depth_fails_configuration() {
        let f = fixture();
        f.controller.open(&DummyBackend::device_id()).unwrap();
        let result = f.controller.configure(small(), 0, 30.0);
        assert!(matches!(result, Err(CaptureError::ConfigurationFailed(_))));
        assert_eq!(f.controller.state(), CaptureSessionState::Error);
    }

    #[test]
    fn close_twice_releases_device_once() {
        let f = fixture();
        f.controller.open(&DummyBackend::device_id()).unwrap();
        f.controller.configure(small(), 2, 60.0).unwrap();

        f.controller.close();
        f.controller.close();

        assert_eq!(f.controller.state(), CaptureSessionState::Closed);
        assert_eq!(f.backend.close_count(), 1);
        let closed_reports = f
            .statuses
            .lock()
            .iter()
            .filter(|s| s.message == "camera closed")
            .count();
        assert_eq!(closed_reports, 1);
    }

    #[test]
    fn close_on_never_opened_controller_is_noop() {
        let f = fixture();
        f.controller.close();
        assert_eq!(f.controller.state(), CaptureSessionState::Closed);
        assert!(f.statuses.lock().is_empty());
    }

    #[test]
    fn device_disconnect_releases_handle_and_closes_session() {
        let f = fixture();
        f.controller.open(&DummyBackend::device_id()).unwrap();
        f.controller.configure(small(), 2, 60.0).unwrap();

        f.backend
            .emit_event(&DummyBackend::device_id(), DeviceEvent::Disconnected);

        assert!(wait_until(|| f.controller.state() == CaptureSessionState::Closed));
        assert!(wait_until(|| !f.backend.is_open(&DummyBackend::device_id())));
        assert!(f.controller.queue().is_none());
    }

    #[test]
    fn device_error_moves_session_to_error() {
        let f = fixture();
        f.controller.open(&DummyBackend::device_id()).unwrap();
        f.backend.emit_event(
            &DummyBackend::device_id(),
            DeviceEvent::Error("camera service died".into()),
        );
        assert!(wait_until(|| f.controller.state() == CaptureSessionState::Error));
        assert!(wait_until(|| f
            .statuses
            .lock()
            .iter()
            .any(|s| s.message.contains("camera service died"))));
    }

    #[test]
    fn handler_panic_skips_frame_and_keeps_session_alive() {
        let f = fixture_with(
            true,
            CountingHandler {
                panic_on_first: true,
                ..Default::default()
            },
        );
        f.controller.open(&DummyBackend::device_id()).unwrap();
        f.controller.configure(small(), 1, 120.0).unwrap();

        assert!(wait_until(|| f.handler.lock().frames.len() >= 3));
        assert_eq!(f.controller.state(), CaptureSessionState::Active);
        f.controller.close();
    }

    #[test]
    fn pause_and_resume_restore_streaming() {
        let f = fixture();
        f.controller.open(&DummyBackend::device_id()).unwrap();
        f.controller.configure(small(), 2, 120.0).unwrap();

        f.controller.pause();
        assert_eq!(f.controller.state(), CaptureSessionState::Closed);
        assert!(!f.backend.is_open(&DummyBackend::device_id()));

        let before = f.handler.lock().frames.len();
        assert_eq!(f.controller.resume(), Ok(CaptureSessionState::Active));
        assert!(wait_until(|| f.handler.lock().frames.len() > before));
        f.controller.close();
    }

    #[test]
    fn resume_without_pause_is_noop() {
        let f = fixture();
        assert_eq!(f.controller.resume(), Ok(CaptureSessionState::Closed));
    }

    #[test]
    fn close_races_with_in_flight_frames() {
        let f = fixture();
        let id = DummyBackend::device_id();
        let cycles = AtomicUsize::new(0);
        for _ in 0..5 {
            f.controller.open(&id).unwrap();
            f.controller.configure(small(), 2, 500.0).unwrap();
            std::thread::sleep(Duration::from_millis(10));
            f.controller.close();
            cycles.fetch_add(1, Ordering::Relaxed);
        }
        assert_eq!(cycles.load(Ordering::Relaxed), 5);
        assert!(!f.backend.is_open(&id));
    }

    #[test]
    fn injected_open_failure_is_reported_and_retryable() {
        let f = fixture();
        let id = DummyBackend::device_id();
        f.backend.fail_next_open(CaptureError::DeviceAccess("camera in use".into()));

        let result = f.controller.open(&id);
        assert_eq!(result, Err(CaptureError::DeviceAccess("camera in use".into())));
        assert_eq!(f.controller.state(), CaptureSessionState::Error);
        let last = f.statuses.lock().last().cloned().unwrap();
        assert_eq!(last.state, CaptureSessionState::Error);
        assert_eq!(last.message, "device access failed: camera in use");
        assert!(!last.recoverable);

        assert_eq!(f.controller.open(&id), Ok(CaptureSessionState::Open));
        f.controller.close();
    }

    /// Permission gate the test can flip.
    struct SwitchPermission(AtomicBool);

    impl PermissionGate for SwitchPermission {
        fn is_granted(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
        fn request(&self) {}
    }

    #[test]
    fn permission_denied_from_error_reports_the_state_it_leaves() {
        let backend = Arc::new(DummyBackend::new());
        let permission = Arc::new(SwitchPermission(AtomicBool::new(true)));
        let statuses: Arc<Mutex<Vec<SessionStatus>>> = Arc::default();
        let seen = Arc::clone(&statuses);
        let controller = CaptureController::new(
            Arc::clone(&backend) as Arc<dyn CameraBackend>,
            Arc::clone(&permission) as Arc<dyn PermissionGate>,
            Arc::new(Mutex::new(CountingHandler::default())),
            Some(Arc::new(move |s: &SessionStatus| seen.lock().push(s.clone()))),
        );
        let id = DummyBackend::device_id();
        backend.fail_next_open(CaptureError::DeviceAccess("busy".into()));
        assert!(controller.open(&id).is_err());
        assert_eq!(controller.state(), CaptureSessionState::Error);

        permission.0.store(false, Ordering::Release);
        assert_eq!(controller.open(&id), Err(CaptureError::PermissionDenied));
        let last = statuses.lock().last().cloned().unwrap();
        assert_eq!(last.state, CaptureSessionState::Closed);
        assert_eq!(controller.state(), last.state);
        assert!(last.recoverable);

        permission.0.store(true, Ordering::Release);
        assert_eq!(controller.open(&id), Ok(CaptureSessionState::Open));
        controller.close();
    }

    /// Every transition below goes through the checked path, so an illegal
    /// one panics the calling thread in debug builds.
    #[test]
    fn full_lifecycle_follows_legal_transitions() {
        use CaptureSessionState::*;
        let f = fixture();
        let id = DummyBackend::device_id();

        assert_eq!(f.controller.open(&id), Ok(Open));
        assert_eq!(f.controller.configure(small(), 2, 60.0), Ok(Active));
        assert_eq!(f.controller.configure(small(), 3, 60.0), Ok(Active));
        f.controller.pause();
        assert_eq!(f.controller.state(), Closed);
        assert_eq!(f.controller.resume(), Ok(Active));

        f.backend.emit_event(&id, DeviceEvent::Disconnected);
        assert!(wait_until(|| f.controller.state() == Closed));

        assert_eq!(f.controller.open(&id), Ok(Open));
        f.backend.emit_event(&id, DeviceEvent::Error("camera service died".into()));
        assert!(wait_until(|| f.controller.state() == Error));

        assert_eq!(f.controller.open(&id), Ok(Open));
        f.controller.close();
        assert_eq!(f.controller.state(), Closed);

        let reported: Vec<_> = f.statuses.lock().iter().map(|s| s.state).collect();
        assert!(reported.windows(2).all(|w| w[0] != Closed || w[1] != Error));
        assert_eq!(reported.last(), Some(&Closed));
    }

    #[test]
    fn reconfigure_replaces_queue() {
        let f = fixture();
        f.controller.open(&DummyBackend::device_id()).unwrap();
        f.controller.configure(small(), 2, 60.0).unwrap();
        let first = f.controller.queue().unwrap();
        f.controller
            .configure(FrameSize::new(16, 16), 3, 60.0)
            .unwrap();
        let second = f.controller.queue().unwrap();
        assert!(first.is_closed());
        assert_eq!(second.depth(), 3);
        f.controller.close();
    }
}
