use thiserror::Error;

/// Capture subsystem errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("camera permission has not been granted")]
    PermissionDenied,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device access failed: {0}")]
    DeviceAccess(String),

    #[error("capture configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("operation not allowed while session is {0}")]
    InvalidState(String),

    #[error("capture worker failed: {0}")]
    Worker(String),
}

impl CaptureError {
    /// `PermissionDenied` can be retried once the user grants access; the
    /// rest need a manual reopen.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PermissionDenied)
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, CaptureError>;
