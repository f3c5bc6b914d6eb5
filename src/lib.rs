pub mod camera;
pub mod diagnostics;
pub mod pipeline;
pub mod processing;
pub mod render;
pub mod settings;
pub mod stream;
pub mod ui;

use std::sync::Arc;

use camera::backend::CameraBackend;
use camera::dummy::DummyBackend;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default of `edgecam=info`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("edgecam=info")),
        )
        .with_target(true)
        .try_init();
}

/// Create the camera backend for the current platform.
///
/// Only the simulated camera ships; `DUMMY_CAMERA=1` is accepted for
/// parity with platform backends that would otherwise take precedence.
pub fn create_camera_backend() -> Arc<dyn CameraBackend> {
    if !DummyBackend::is_enabled() {
        tracing::info!("no native camera backend on this platform; using the simulated camera");
    }
    Arc::new(DummyBackend::new())
}
