use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::camera::types::FrameSize;
use crate::processing::frame::ChromaOrder;
use crate::processing::mode::ProcessingMode;
use crate::stream::server::ServerConfig;
use crate::stream::viewer::ViewerConfig;
use crate::stream::wire::WireFormat;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("settings I/O failed: {0}")]
    Io(String),

    #[error("settings file is malformed: {0}")]
    Parse(String),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Application settings as stored in the JSON settings file. Every field
/// has a default, so partial files are fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Camera to open; the first enumerated device when unset.
    pub device_id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub queue_depth: usize,
    pub chroma_order: ChromaOrder,
    /// Mode the pipeline starts in; updated whenever the user switches.
    pub mode: ProcessingMode,
    pub render: bool,
    pub surface_width: Option<u32>,
    pub surface_height: Option<u32>,
    pub stream: bool,
    pub stream_bind: String,
    pub stream_port: u16,
    pub wire_format: WireFormat,
    pub jpeg_quality: u8,
    pub stream_max_width: Option<u32>,
    pub viewer_url: String,
    pub reconnect_delay_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_id: None,
            width: 1280,
            height: 720,
            fps: 30.0,
            queue_depth: 2,
            chroma_order: ChromaOrder::Uv,
            mode: ProcessingMode::EdgeDetect,
            render: true,
            surface_width: None,
            surface_height: None,
            stream: true,
            stream_bind: "0.0.0.0".to_string(),
            stream_port: 9001,
            wire_format: WireFormat::Binary,
            jpeg_quality: 50,
            stream_max_width: None,
            viewer_url: "ws://127.0.0.1:9001".to_string(),
            reconnect_delay_ms: 3000,
        }
    }
}

impl AppSettings {
    pub fn frame_size(&self) -> FrameSize {
        FrameSize::new(self.width, self.height)
    }

    /// Render surface size; the frame size unless overridden.
    pub fn surface_size(&self) -> FrameSize {
        FrameSize::new(
            self.surface_width.unwrap_or(self.width),
            self.surface_height.unwrap_or(self.height),
        )
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.stream_bind.clone(),
            port: self.stream_port,
            format: self.wire_format,
            jpeg_quality: self.jpeg_quality,
            max_width: self.stream_max_width,
        }
    }

    pub fn viewer_config(&self) -> ViewerConfig {
        ViewerConfig {
            url: self.viewer_url.clone(),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.width == 0 || self.height == 0 {
            return Err(SettingsError::Invalid(format!(
                "frame size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.surface_width == Some(0) || self.surface_height == Some(0) {
            return Err(SettingsError::Invalid(format!(
                "surface size {} must be non-zero",
                self.surface_size()
            )));
        }
        if !(self.fps > 0.0 && self.fps.is_finite()) {
            return Err(SettingsError::Invalid(format!("fps {} must be positive", self.fps)));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(SettingsError::Invalid(format!(
                "jpeg_quality {} must be within 1-100",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}
