use std::sync::Arc;

use crate::camera::error::Result;
use crate::camera::queue::FrameQueue;
use crate::camera::types::{CameraDevice, DeviceEvent, DeviceId, StreamConfig};

/// Callback through which an open device reports asynchronous events.
///
/// Fires on the backend's internal thread.
pub type DeviceEventCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// Platform-agnostic camera backend trait.
///
/// Provides device enumeration and hands out exclusive device handles.
pub trait CameraBackend: Send + Sync {
    /// Enumerate all currently connected camera devices.
    fn enumerate_devices(&self) -> Result<Vec<CameraDevice>>;

    /// Open a device for exclusive use.
    ///
    /// Fails with `DeviceAccess` when the device is already held by another
    /// handle.
    fn open(&self, id: &DeviceId, events: DeviceEventCallback) -> Result<Box<dyn DeviceHandle>>;
}

/// An open camera device.
///
/// Handles are thread-affine to whoever owns them but must be `Send` so the
/// session controller can move them between its lock and teardown paths.
pub trait DeviceHandle: Send {
    /// Configure the output stream and start the repeating request that
    /// fills `queue` at the configured cadence.
    fn start_repeating(&mut self, config: StreamConfig, queue: Arc<FrameQueue>) -> Result<()>;

    /// Stop delivering frames. Safe to call when not streaming.
    fn stop_repeating(&mut self);

    /// Release the device. Safe to call more than once.
    fn close(&mut self);
}

/// Externally granted camera permission.
pub trait PermissionGate: Send + Sync {
    fn is_granted(&self) -> bool;

    /// Kick off the external permission-request flow.
    fn request(&self);
}

/// Permission gate with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermission(pub bool);

impl StaticPermission {
    /// Granted unless `EDGECAM_DENY_CAMERA` is set to `1`/`true`.
    pub fn from_env() -> Self {
        let denied = std::env::var("EDGECAM_DENY_CAMERA").is_ok_and(|v| v == "1" || v == "true");
        Self(!denied)
    }
}

impl PermissionGate for StaticPermission {
    fn is_granted(&self) -> bool {
        self.0
    }

    fn request(&self) {
        tracing::warn!("camera permission required; grant access and reopen the session");
    }
}
