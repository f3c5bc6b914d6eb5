use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable camera identifier as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new `DeviceId` from a raw string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discovered camera device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraDevice {
    pub id: DeviceId,
    pub name: String,
    pub is_connected: bool,
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse `"1280x720"` style strings.
    pub fn parse(s: &str) -> Option<Self> {
        let (w, h) = s.trim().split_once(['x', 'X'])?;
        let width = w.trim().parse().ok()?;
        let height = h.trim().parse().ok()?;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }

    /// Number of luma samples.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Dimensions of each 4:2:0 chroma plane (rounded up for odd sizes).
    pub fn chroma_size(&self) -> FrameSize {
        FrameSize::new(self.width.div_ceil(2), self.height.div_ceil(2))
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Parameters for a repeating capture request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamConfig {
    pub size: FrameSize,
    pub queue_depth: usize,
    pub fps: f32,
}

/// Lifecycle of a capture session.
///
/// `Closed → Opening → Open → Configuring → Active`, with `Error` reachable
/// from every non-closed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSessionState {
    Closed,
    Opening,
    Open,
    Configuring,
    Active,
    Error,
}

impl CaptureSessionState {
    /// Whether the controller currently holds a device handle.
    pub fn holds_device(self) -> bool {
        matches!(self, Self::Open | Self::Configuring | Self::Active)
    }

    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use CaptureSessionState::*;
        match (self, next) {
            (_, Closed) => true,
            (Closed, Error) => false,
            (_, Error) => true,
            (Closed | Error, Opening) => true,
            (Opening, Open) => true,
            (Open | Active, Configuring) => true,
            (Configuring, Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CaptureSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Configuring => "configuring",
            Self::Active => "active",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Asynchronous notification raised by an open device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device went away (unplugged, claimed by a higher-priority client).
    Disconnected,
    /// The device reported a fatal error code.
    Error(String),
}
