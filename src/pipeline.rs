//! Pipeline assembly.
//!
//! Wires the capture session to the converter and processing bridge, and
//! fans processed frames out to the render thread and the stream publisher.
//! FPS telemetry ticks once per delivered frame.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::camera::backend::{CameraBackend, PermissionGate};
use crate::camera::error::CaptureError;
use crate::camera::queue::AcquiredImage;
use crate::camera::session::{CaptureController, FrameHandler, SharedFrameHandler, StatusCallback};
use crate::camera::types::{CaptureSessionState, DeviceId};
use crate::diagnostics::fps::{FpsCounter, FpsSink};
use crate::diagnostics::stats::{DiagnosticSnapshot, DiagnosticStats};
use crate::processing::bridge::NativeBridge;
use crate::processing::convert::convert;
use crate::processing::frame::ChromaOrder;
use crate::processing::mode::{ModeRegister, ProcessingMode};
use crate::render::gpu::WgpuSurface;
use crate::render::slot::FrameSlot;
use crate::render::surface::{HeadlessSurface, RenderError, SurfaceBackend};
use crate::render::thread::{RenderHandle, RenderThread};
use crate::settings::{AppSettings, SettingsError, SettingsStore};
use crate::stream::error::StreamError;
use crate::stream::server::{FramePublisher, FrameServer, PublishOutcome};
use crate::ui::Controls;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("failed to start render thread: {0}")]
    RenderThread(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Which surface backend the render thread uses.
#[derive(Clone, Default)]
pub enum SurfaceKind {
    /// `wgpu` off-screen surface, falling back to headless without an adapter.
    #[default]
    Gpu,
    Headless(HeadlessSurface),
    /// No render thread.
    Disabled,
}

/// External collaborators of the pipeline.
pub struct PipelineDeps {
    pub backend: Arc<dyn CameraBackend>,
    pub permission: Arc<dyn PermissionGate>,
    pub surface: SurfaceKind,
    pub store: Option<Arc<SettingsStore>>,
    pub on_status: Option<StatusCallback>,
    pub on_fps: Option<FpsSink>,
}

/// Frame handler running on the capture-dispatch thread.
pub struct FrameRouter {
    chroma: ChromaOrder,
    bridge: NativeBridge,
    slot: Arc<FrameSlot>,
    redraw: Option<RenderHandle>,
    publisher: Option<FramePublisher>,
    fps: Arc<FpsCounter>,
    stats: Arc<Mutex<DiagnosticStats>>,
}

impl FrameRouter {
    pub fn new(
        chroma: ChromaOrder,
        bridge: NativeBridge,
        slot: Arc<FrameSlot>,
        redraw: Option<RenderHandle>,
        publisher: Option<FramePublisher>,
        fps: Arc<FpsCounter>,
        stats: Arc<Mutex<DiagnosticStats>>,
    ) -> Self {
        Self {
            chroma,
            bridge,
            slot,
            redraw,
            publisher,
            fps,
            stats,
        }
    }

    /// Release engine resources and forget the last frame.
    pub fn teardown(&mut self) {
        self.bridge.teardown();
        self.slot.clear();
    }
}

impl FrameHandler for FrameRouter {
    fn on_frame(&mut self, image: &AcquiredImage) {
        self.fps.tick();
        let raw = convert(image, self.chroma);

        let started = Instant::now();
        let frame = match self.bridge.process(&raw) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                warn!(sequence = raw.sequence, "skipping frame: {e}");
                self.stats.lock().record_failure();
                return;
            }
        };
        self.stats.lock().record_frame(started.elapsed());

        self.slot.publish(Arc::clone(&frame));
        if let Some(redraw) = &self.redraw {
            redraw.request_redraw();
        }

        if let Some(publisher) = &self.publisher {
            match publisher.publish(&frame) {
                Ok(PublishOutcome::Sent { bytes, viewers }) => {
                    self.stats.lock().record_streamed(bytes, viewers);
                }
                Ok(PublishOutcome::NoViewers) => self.stats.lock().set_viewers(0),
                Err(e) if e.is_recoverable() => {
                    warn!(sequence = frame.sequence, "stream publish failed: {e}")
                }
                Err(e) => error!(sequence = frame.sequence, "stream publish failed: {e}"),
            }
        }
    }
}

/// The running pipeline.
pub struct Pipeline {
    settings: AppSettings,
    backend: Arc<dyn CameraBackend>,
    controller: CaptureController,
    mode: Arc<ModeRegister>,
    slot: Arc<FrameSlot>,
    router: Arc<Mutex<FrameRouter>>,
    render: Option<RenderThread>,
    server: Option<FrameServer>,
    stats: Arc<Mutex<DiagnosticStats>>,
    store: Option<Arc<SettingsStore>>,
}

impl Pipeline {
    /// Start the render thread and stream server. Capture is started
    /// separately with [`start_capture`](Self::start_capture).
    pub fn start(settings: AppSettings, deps: PipelineDeps) -> Result<Self> {
        settings.validate()?;

        let mode = Arc::new(ModeRegister::new(settings.mode));
        let slot = Arc::new(FrameSlot::new());
        let stats = Arc::new(Mutex::new(DiagnosticStats::new()));

        let render = match deps.surface {
            SurfaceKind::Disabled => None,
            SurfaceKind::Headless(surface) => Some(spawn_render(
                move || Ok(Box::new(surface) as Box<dyn SurfaceBackend>),
                &slot,
                &settings,
            )?),
            SurfaceKind::Gpu => {
                let size = settings.surface_size();
                Some(spawn_render(
                    move || {
                        let surface: Box<dyn SurfaceBackend> = match WgpuSurface::new(size) {
                            Ok(gpu) => Box::new(gpu),
                            Err(e) => {
                                warn!("{e}; rendering to headless surface");
                                Box::new(HeadlessSurface::new())
                            }
                        };
                        Ok(surface)
                    },
                    &slot,
                    &settings,
                )?)
            }
        };

        let server = if settings.stream {
            Some(FrameServer::start(settings.server_config())?)
        } else {
            None
        };

        let fps_sink: FpsSink = {
            let stats = Arc::clone(&stats);
            let forward = deps.on_fps;
            Arc::new(move |rate| {
                stats.lock().set_fps(rate);
                if let Some(forward) = &forward {
                    forward(rate);
                }
            })
        };

        let router = Arc::new(Mutex::new(FrameRouter::new(
            settings.chroma_order,
            NativeBridge::cpu(Arc::clone(&mode)),
            Arc::clone(&slot),
            render.as_ref().map(RenderThread::handle),
            server.as_ref().map(FrameServer::publisher),
            Arc::new(FpsCounter::new(fps_sink)),
            Arc::clone(&stats),
        )));

        let controller = CaptureController::new(
            Arc::clone(&deps.backend),
            deps.permission,
            Arc::clone(&router) as SharedFrameHandler,
            deps.on_status,
        );

        info!(
            mode = %settings.mode,
            size = %settings.frame_size(),
            stream = settings.stream,
            "pipeline started"
        );

        Ok(Self {
            settings,
            backend: deps.backend,
            controller,
            mode,
            slot,
            router,
            render,
            server,
            stats,
            store: deps.store,
        })
    }

    /// Device from the settings, or the first enumerated one.
    pub fn resolve_device(&self) -> std::result::Result<DeviceId, CaptureError> {
        if let Some(id) = &self.settings.device_id {
            return Ok(DeviceId::new(id.clone()));
        }
        self.backend
            .enumerate_devices()?
            .into_iter()
            .find(|d| d.is_connected)
            .map(|d| d.id)
            .ok_or_else(|| CaptureError::DeviceNotFound("no camera connected".into()))
    }

    /// Open the camera and start streaming frames.
    pub fn start_capture(&self) -> std::result::Result<CaptureSessionState, CaptureError> {
        let id = self.resolve_device()?;
        self.controller.open(&id)?;
        self.controller.configure(
            self.settings.frame_size(),
            self.settings.queue_depth,
            self.settings.fps,
        )
    }

    pub fn controller(&self) -> &CaptureController {
        &self.controller
    }

    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    pub fn stream_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.as_ref().map(FrameServer::local_addr)
    }

    fn remember_mode(&self, mode: ProcessingMode) {
        if let Some(store) = &self.store {
            store.set_mode(mode);
        }
    }

    /// Tear down in reverse start order. Idempotent.
    pub fn shutdown(&mut self) {
        self.controller.close();
        self.router.lock().teardown();
        if let Some(mut render) = self.render.take() {
            render.shutdown();
        }
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.flush() {
                warn!("Failed to save settings: {e}");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Controls for Pipeline {
    fn mode(&self) -> ProcessingMode {
        self.mode.load()
    }

    fn toggle_mode(&self) -> ProcessingMode {
        let mode = self.mode.toggle();
        self.remember_mode(mode);
        mode
    }

    fn set_mode(&self, mode: ProcessingMode) {
        self.mode.store(mode);
        self.remember_mode(mode);
    }

    fn pause(&self) {
        self.controller.pause();
    }

    fn resume(&self) -> std::result::Result<CaptureSessionState, CaptureError> {
        self.controller.resume()
    }

    fn reopen(&self) -> std::result::Result<CaptureSessionState, CaptureError> {
        self.controller.close();
        self.start_capture()
    }

    fn state(&self) -> CaptureSessionState {
        self.controller.state()
    }

    fn snapshot(&self) -> DiagnosticSnapshot {
        let mut stats = self.stats.lock();
        if let Some(queue) = self.controller.queue() {
            stats.set_queue_stats(queue.stats());
        }
        if let Some(server) = &self.server {
            stats.set_viewers(server.publisher().viewers());
        }
        stats.snapshot()
    }
}

fn spawn_render<F>(make: F, slot: &Arc<FrameSlot>, settings: &AppSettings) -> Result<RenderThread>
where
    F: FnOnce() -> std::result::Result<Box<dyn SurfaceBackend>, RenderError> + Send + 'static,
{
    RenderThread::spawn(make, Arc::clone(slot), settings.surface_size())
        .map_err(|e| PipelineError::RenderThread(e.to_string()))
}
