//! Render thread with render-on-demand.
//!
//! Redraws happen only after [`RenderHandle::request_redraw`]. Requests made
//! while a draw is in progress collapse into a single follow-up draw.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::camera::types::FrameSize;
use crate::render::slot::FrameSlot;
use crate::render::surface::{RenderError, SurfaceBackend, SurfaceRenderer};

#[derive(Debug, Default)]
struct Requests {
    created: bool,
    resize: Option<FrameSize>,
    dirty: bool,
    shutdown: bool,
}

impl Requests {
    fn any(&self) -> bool {
        self.created || self.resize.is_some() || self.dirty || self.shutdown
    }
}

#[derive(Default)]
struct Signal {
    requests: Mutex<Requests>,
    wake: Condvar,
    draws: AtomicU64,
}

impl Signal {
    fn update(&self, f: impl FnOnce(&mut Requests)) {
        f(&mut self.requests.lock());
        self.wake.notify_one();
    }
}

/// Cloneable trigger side of the render thread.
#[derive(Clone)]
pub struct RenderHandle {
    signal: Arc<Signal>,
}

impl RenderHandle {
    /// Mark the surface dirty. Never blocks on drawing.
    pub fn request_redraw(&self) {
        self.signal.update(|r| r.dirty = true);
    }

    pub fn surface_created(&self) {
        self.signal.update(|r| r.created = true);
    }

    pub fn surface_resized(&self, width: u32, height: u32) {
        self.signal
            .update(|r| r.resize = Some(FrameSize::new(width, height)));
    }

    /// Draw calls completed so far.
    pub fn draws(&self) -> u64 {
        self.signal.draws.load(Ordering::Acquire)
    }
}

pub struct RenderThread {
    handle: RenderHandle,
    thread: Option<JoinHandle<()>>,
}

impl RenderThread {
    /// Start the render thread. `make_backend` runs on the new thread so the
    /// rendering context is created where it is used.
    pub fn spawn<B, F>(
        make_backend: F,
        slot: Arc<FrameSlot>,
        surface: FrameSize,
    ) -> std::io::Result<Self>
    where
        B: SurfaceBackend + 'static,
        F: FnOnce() -> Result<B, RenderError> + Send + 'static,
    {
        let signal = Arc::new(Signal::default());
        let handle = RenderHandle {
            signal: Arc::clone(&signal),
        };
        handle.surface_resized(surface.width, surface.height);
        handle.surface_created();

        let thread = std::thread::Builder::new()
            .name("render".to_string())
            .spawn(move || match make_backend() {
                Ok(backend) => run(SurfaceRenderer::new(backend, slot), &signal),
                Err(e) => warn!("render backend unavailable: {e}"),
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> RenderHandle {
        self.handle.clone()
    }

    /// Stop the thread and wait for the current draw to finish.
    pub fn shutdown(&mut self) {
        self.handle.signal.update(|r| r.shutdown = true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<B: SurfaceBackend>(mut renderer: SurfaceRenderer<B>, signal: &Signal) {
    debug!("render thread started");
    loop {
        let req = {
            let mut guard = signal.requests.lock();
            while !guard.any() {
                signal.wake.wait(&mut guard);
            }
            std::mem::take(&mut *guard)
        };
        if req.shutdown {
            break;
        }
        if let Some(size) = req.resize {
            let resized = guarded(|| renderer.on_surface_size_changed(size.width, size.height));
            if let Err(e) = resized {
                warn!("surface resize failed: {e}");
            }
        }
        if req.created {
            if let Err(e) = guarded(|| renderer.on_surface_created()) {
                warn!("surface creation failed: {e}");
            }
        }
        if req.dirty {
            match guarded(|| renderer.on_draw_frame()) {
                Ok(_) => {
                    signal.draws.fetch_add(1, Ordering::AcqRel);
                }
                Err(e) => warn!("draw failed: {e}"),
            }
        }
    }
    debug!("render thread exiting");
}

/// Run one renderer call, turning a backend panic into an error so the
/// render thread survives it.
fn guarded<T>(f: impl FnOnce() -> Result<T, RenderError>) -> Result<T, RenderError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(RenderError::Panicked(msg))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::frame::ProcessedFrame;
    use crate::processing::mode::ProcessingMode;
    use crate::render::surface::HeadlessSurface;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn spawn_headless() -> (RenderThread, Arc<FrameSlot>, HeadlessSurface) {
        let slot = Arc::new(FrameSlot::new());
        let surface = HeadlessSurface::new();
        let backend = surface.clone();
        let thread =
            RenderThread::spawn(move || Ok(backend), Arc::clone(&slot), FrameSize::new(8, 8))
                .unwrap();
        (thread, slot, surface)
    }

    #[test]
    fn does_not_draw_without_request() {
        let (mut thread, _slot, _surface) = spawn_headless();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(thread.handle().draws(), 0);
        thread.shutdown();
    }

    #[test]
    fn request_redraw_draws_latest_frame() {
        let (mut thread, slot, surface) = spawn_headless();
        let size = FrameSize::new(2, 2);
        slot.publish(Arc::new(ProcessedFrame {
            size,
            sequence: 42,
            mode: ProcessingMode::Raw,
            rgba: vec![7; 16],
        }));
        thread.handle().request_redraw();

        let fb = surface.framebuffer();
        assert!(wait_until(|| fb.lock().last_sequence == Some(42)));
        assert_eq!(fb.lock().rgba, vec![7; 16]);
        thread.shutdown();
    }

    #[test]
    fn burst_of_requests_is_coalesced() {
        let (mut thread, _slot, _surface) = spawn_headless();
        let handle = thread.handle();
        for _ in 0..100 {
            handle.request_redraw();
        }
        assert!(wait_until(|| handle.draws() >= 1));
        std::thread::sleep(Duration::from_millis(20));
        let draws = handle.draws();
        assert!((1..=100).contains(&draws), "draws = {draws}");
        thread.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (mut thread, _slot, _surface) = spawn_headless();
        thread.shutdown();
        thread.shutdown();
    }

    /// Headless surface whose first upload panics.
    struct PanicsOnce {
        inner: HeadlessSurface,
        panicked: Arc<AtomicBool>,
    }

    impl SurfaceBackend for PanicsOnce {
        fn on_created(&mut self) -> Result<(), RenderError> {
            self.inner.on_created()
        }
        fn on_resized(&mut self, size: FrameSize) -> Result<(), RenderError> {
            self.inner.on_resized(size)
        }
        fn allocate_texture(&mut self, size: FrameSize) -> Result<(), RenderError> {
            self.inner.allocate_texture(size)
        }
        fn draw_frame(&mut self, frame: &ProcessedFrame) -> Result<(), RenderError> {
            if !self.panicked.swap(true, Ordering::AcqRel) {
                panic!("validation error in upload");
            }
            self.inner.draw_frame(frame)
        }
        fn draw_clear(&mut self) -> Result<(), RenderError> {
            self.inner.draw_clear()
        }
    }

    #[test]
    fn backend_panic_does_not_kill_render_thread() {
        let slot = Arc::new(FrameSlot::new());
        let surface = HeadlessSurface::new();
        let panicked = Arc::new(AtomicBool::new(false));
        let backend = PanicsOnce {
            inner: surface.clone(),
            panicked: Arc::clone(&panicked),
        };
        let mut thread =
            RenderThread::spawn(move || Ok(backend), Arc::clone(&slot), FrameSize::new(4, 4))
                .unwrap();
        slot.publish(Arc::new(ProcessedFrame {
            size: FrameSize::new(1, 1),
            sequence: 3,
            mode: ProcessingMode::Raw,
            rgba: vec![1; 4],
        }));
        let handle = thread.handle();
        handle.request_redraw();
        assert!(wait_until(|| panicked.load(Ordering::Acquire)));
        assert_eq!(handle.draws(), 0);

        handle.request_redraw();
        let fb = surface.framebuffer();
        assert!(wait_until(|| fb.lock().last_sequence == Some(3)));
        assert!(wait_until(|| handle.draws() == 1));
        thread.shutdown();
    }

    #[test]
    fn guarded_reports_panic_message() {
        let result: Result<(), RenderError> = guarded(|| panic!("boom"));
        assert_eq!(result, Err(RenderError::Panicked("boom".into())));
    }

    #[test]
    fn failed_backend_leaves_thread_joinable() {
        let slot = Arc::new(FrameSlot::new());
        let mut thread = RenderThread::spawn(
            || -> Result<HeadlessSurface, RenderError> {
                Err(RenderError::NoAdapter("none".into()))
            },
            slot,
            FrameSize::new(4, 4),
        )
        .unwrap();
        thread.handle().request_redraw();
        thread.shutdown();
        assert_eq!(thread.handle().draws(), 0);
    }
}
