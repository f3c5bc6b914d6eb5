use serde::{Deserialize, Serialize};

use crate::camera::types::FrameSize;
use crate::processing::mode::ProcessingMode;

/// Order of the two chroma planes after the luma plane.
///
/// `Uv` matches I420, `Vu` matches YV12. Both decode to the same colours as
/// long as the reader uses the order the buffer was built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChromaOrder {
    #[default]
    Uv,
    Vu,
}

/// One captured frame in contiguous planar 4:2:0 layout.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub size: FrameSize,
    pub sequence: u64,
    pub timestamp_us: u64,
    pub chroma: ChromaOrder,
}

impl RawFrame {
    /// Bytes a well-formed frame of `size` occupies.
    pub fn expected_len(size: FrameSize) -> usize {
        size.pixel_count() + 2 * size.chroma_size().pixel_count()
    }

    pub fn luma(&self) -> &[u8] {
        let end = self.size.pixel_count().min(self.data.len());
        &self.data[..end]
    }

    /// `(u, v)` planes regardless of the stored order.
    ///
    /// Callers must check the buffer length first.
    pub fn chroma_planes(&self) -> (&[u8], &[u8]) {
        let y_len = self.size.pixel_count();
        let c_len = self.size.chroma_size().pixel_count();
        let first = &self.data[y_len..y_len + c_len];
        let second = &self.data[y_len + c_len..y_len + 2 * c_len];
        match self.chroma {
            ChromaOrder::Uv => (first, second),
            ChromaOrder::Vu => (second, first),
        }
    }
}

/// Bridge output: an RGBA8 image at the source dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFrame {
    pub size: FrameSize,
    pub sequence: u64,
    pub mode: ProcessingMode,
    pub rgba: Vec<u8>,
}

impl ProcessedFrame {
    /// Uniform clear-coloured frame, used where no processed frame exists yet.
    pub fn blank(size: FrameSize) -> Self {
        let mut rgba = vec![0u8; size.pixel_count() * 4];
        for px in rgba.chunks_exact_mut(4) {
            px[3] = 255;
        }
        Self {
            size,
            sequence: 0,
            mode: ProcessingMode::Raw,
            rgba,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.size.width as usize + x as usize) * 4;
        [self.rgba[i], self.rgba[i + 1], self.rgba[i + 2], self.rgba[i + 3]]
    }
}
