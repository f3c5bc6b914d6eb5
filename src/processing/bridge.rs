//! Processing bridge: the only crossing point into the image-processing
//! engine.
//!
//! [`NativeBridge`] snapshots the shared [`ModeRegister`] once per call and
//! hands the frame to a [`FrameProcessor`]. The bundled [`CpuEngine`] turns
//! planar 4:2:0 frames into RGBA8, either as a colour conversion (`Raw`) or
//! as a white-on-black edge map (`EdgeDetect`).

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::camera::types::FrameSize;
use crate::processing::frame::{ProcessedFrame, RawFrame};
use crate::processing::mode::{ModeRegister, ProcessingMode};

/// Gradient magnitude at or above which a pixel is a strong edge.
pub const EDGE_HIGH_THRESHOLD: u16 = 150;
/// Gradient magnitude at or above which a pixel is a weak edge candidate.
pub const EDGE_LOW_THRESHOLD: u16 = 50;

const WEAK: u8 = 1;
const STRONG: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("unknown processing mode id {0}")]
    UnknownMode(i32),

    #[error("frame buffer too small: expected {expected} bytes, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("frame has zero width or height")]
    EmptyFrame,
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Image-processing engine behind the bridge.
pub trait FrameProcessor: Send {
    /// Process one frame in exactly `mode`.
    fn process(&mut self, frame: &RawFrame, mode: ProcessingMode) -> Result<ProcessedFrame>;

    /// Drop any cached resources.
    fn teardown(&mut self) {}
}

/// Reject frames that cannot be decoded at their stated size.
pub fn validate(frame: &RawFrame) -> Result<()> {
    if frame.size.width == 0 || frame.size.height == 0 {
        return Err(ProcessError::EmptyFrame);
    }
    let expected = RawFrame::expected_len(frame.size);
    if frame.data.len() < expected {
        return Err(ProcessError::BufferTooSmall {
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(())
}

/// CPU implementation of the processing engine.
///
/// Keeps per-size scratch buffers for the edge detector; they are
/// reallocated whenever the frame size changes and never grow otherwise.
#[derive(Debug, Default)]
pub struct CpuEngine {
    scratch_size: Option<FrameSize>,
    magnitude: Vec<u16>,
    class: Vec<u8>,
}

impl CpuEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the scratch buffers are currently allocated for.
    pub fn scratch_size(&self) -> Option<FrameSize> {
        self.scratch_size
    }

    fn ensure_scratch(&mut self, size: FrameSize) {
        if self.scratch_size == Some(size) {
            return;
        }
        if let Some(prev) = self.scratch_size {
            debug!(from = %prev, to = %size, "frame size changed; reallocating scratch");
        }
        let n = size.pixel_count();
        self.magnitude = vec![0; n];
        self.class = vec![0; n];
        self.scratch_size = Some(size);
    }

    fn edge_detect(&mut self, frame: &RawFrame) -> Vec<u8> {
        self.ensure_scratch(frame.size);
        let w = frame.size.width as usize;
        let h = frame.size.height as usize;
        let luma = frame.luma();

        let at = |x: isize, y: isize| -> i32 {
            let x = x.clamp(0, w as isize - 1) as usize;
            let y = y.clamp(0, h as isize - 1) as usize;
            luma[y * w + x] as i32
        };

        for py in 0..h {
            for px in 0..w {
                let (x, y) = (px as isize, py as isize);
                let tl = at(x - 1, y - 1);
                let tm = at(x, y - 1);
                let tr = at(x + 1, y - 1);
                let ml = at(x - 1, y);
                let mr = at(x + 1, y);
                let bl = at(x - 1, y + 1);
                let bm = at(x, y + 1);
                let br = at(x + 1, y + 1);

                let gx = -tl - 2 * ml - bl + tr + 2 * mr + br;
                let gy = -tl - 2 * tm - tr + bl + 2 * bm + br;
                let mag = (gx.abs() + gy.abs()) as u16;

                let i = py * w + px;
                self.magnitude[i] = mag;
                self.class[i] = if mag >= EDGE_HIGH_THRESHOLD {
                    STRONG
                } else if mag >= EDGE_LOW_THRESHOLD {
                    WEAK
                } else {
                    0
                };
            }
        }

        let mut rgba = vec![0u8; w * h * 4];
        for py in 0..h {
            for px in 0..w {
                let i = py * w + px;
                let edge = match self.class[i] {
                    STRONG => true,
                    WEAK => self.has_strong_neighbour(px, py, w, h),
                    _ => false,
                };
                let v = if edge { 255 } else { 0 };
                rgba[i * 4..i * 4 + 4].copy_from_slice(&[v, v, v, 255]);
            }
        }
        rgba
    }

    fn has_strong_neighbour(&self, px: usize, py: usize, w: usize, h: usize) -> bool {
        for ny in py.saturating_sub(1)..=(py + 1).min(h - 1) {
            for nx in px.saturating_sub(1)..=(px + 1).min(w - 1) {
                if (nx, ny) != (px, py) && self.class[ny * w + nx] == STRONG {
                    return true;
                }
            }
        }
        false
    }
}

/// BT.601 YUV 4:2:0 to RGBA8, fixed-point (<<8).
pub fn yuv420_to_rgba(frame: &RawFrame) -> Vec<u8> {
    let w = frame.size.width as usize;
    let h = frame.size.height as usize;
    let cw = frame.size.chroma_size().width as usize;
    let luma = frame.luma();
    let (u_plane, v_plane) = frame.chroma_planes();

    let mut rgba = vec![0u8; w * h * 4];
    for row in 0..h {
        for col in 0..w {
            let y = luma[row * w + col] as i32;
            let ci = (row / 2) * cw + col / 2;
            let u = u_plane[ci] as i32 - 128;
            let v = v_plane[ci] as i32 - 128;

            let base = (row * w + col) * 4;
            rgba[base] = ((y * 256 + 359 * v) >> 8).clamp(0, 255) as u8;
            rgba[base + 1] = ((y * 256 - 88 * u - 183 * v) >> 8).clamp(0, 255) as u8;
            rgba[base + 2] = ((y * 256 + 454 * u) >> 8).clamp(0, 255) as u8;
            rgba[base + 3] = 255;
        }
    }
    rgba
}

impl FrameProcessor for CpuEngine {
    fn process(&mut self, frame: &RawFrame, mode: ProcessingMode) -> Result<ProcessedFrame> {
        validate(frame)?;
        let rgba = match mode {
            ProcessingMode::Raw => yuv420_to_rgba(frame),
            ProcessingMode::EdgeDetect => self.edge_detect(frame),
        };
        Ok(ProcessedFrame {
            size: frame.size,
            sequence: frame.sequence,
            mode,
            rgba,
        })
    }

    fn teardown(&mut self) {
        self.scratch_size = None;
        self.magnitude = Vec::new();
        self.class = Vec::new();
    }
}

/// Front door to the processing engine.
pub struct NativeBridge {
    mode: Arc<ModeRegister>,
    engine: Box<dyn FrameProcessor>,
}

impl NativeBridge {
    pub fn new(mode: Arc<ModeRegister>, engine: Box<dyn FrameProcessor>) -> Self {
        Self { mode, engine }
    }

    /// Bridge over the bundled [`CpuEngine`].
    pub fn cpu(mode: Arc<ModeRegister>) -> Self {
        Self::new(mode, Box::new(CpuEngine::new()))
    }

    /// Takes effect from the next `process` call.
    pub fn set_mode(&self, mode: ProcessingMode) {
        self.mode.store(mode);
    }

    /// Integer form of [`set_mode`](Self::set_mode): `0` raw, `1` edges.
    pub fn set_mode_id(&self, id: i32) -> Result<()> {
        let mode = ProcessingMode::from_id(id).ok_or(ProcessError::UnknownMode(id))?;
        self.set_mode(mode);
        Ok(())
    }

    /// Process one frame with the mode current at the start of the call.
    pub fn process(&mut self, frame: &RawFrame) -> Result<ProcessedFrame> {
        let mode = self.mode.load();
        let started = Instant::now();
        let out = self.engine.process(frame, mode)?;
        debug!(
            sequence = frame.sequence,
            %mode,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "frame processed"
        );
        Ok(out)
    }

    pub fn teardown(&mut self) {
        self.engine.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::frame::ChromaOrder;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn frame_with(size: FrameSize, fill_y: impl Fn(usize, usize) -> u8, u: u8, v: u8) -> RawFrame {
        let (w, h) = (size.width as usize, size.height as usize);
        let mut data = Vec::with_capacity(RawFrame::expected_len(size));
        for y in 0..h {
            for x in 0..w {
                data.push(fill_y(x, y));
            }
        }
        let c = size.chroma_size().pixel_count();
        data.extend(std::iter::repeat(u).take(c));
        data.extend(std::iter::repeat(v).take(c));
        RawFrame {
            data,
            size,
            sequence: 1,
            timestamp_us: 0,
            chroma: ChromaOrder::Uv,
        }
    }

    fn grey(size: FrameSize, level: u8) -> RawFrame {
        frame_with(size, |_, _| level, 128, 128)
    }

    #[test]
    fn raw_mode_converts_neutral_chroma_to_grey() {
        let mut engine = CpuEngine::new();
        let out = engine
            .process(&grey(FrameSize::new(4, 2), 128), ProcessingMode::Raw)
            .unwrap();
        assert_eq!(out.rgba.len(), 4 * 2 * 4);
        assert_eq!(out.pixel(3, 1), [128, 128, 128, 255]);
    }

    #[test]
    fn raw_mode_honours_chroma_order() {
        let size = FrameSize::new(2, 2);
        // Strong red: high V.
        let uv = frame_with(size, |_, _| 128, 128, 240);
        let mut vu = uv.clone();
        let y_len = size.pixel_count();
        vu.data[y_len] = 240;
        vu.data[y_len + 1] = 128;
        vu.chroma = ChromaOrder::Vu;

        let mut engine = CpuEngine::new();
        let a = engine.process(&uv, ProcessingMode::Raw).unwrap();
        let b = engine.process(&vu, ProcessingMode::Raw).unwrap();
        assert_eq!(a.rgba, b.rgba);
        assert!(a.pixel(0, 0)[0] > 200);
    }

    #[test]
    fn edge_mode_blank_image_has_no_edges() {
        let mut engine = CpuEngine::new();
        let out = engine
            .process(&grey(FrameSize::new(8, 8), 90), ProcessingMode::EdgeDetect)
            .unwrap();
        assert!(out.rgba.chunks_exact(4).all(|p| p == [0, 0, 0, 255]));
    }

    #[test]
    fn edge_mode_marks_vertical_step() {
        let size = FrameSize::new(8, 4);
        let frame = frame_with(size, |x, _| if x < 4 { 0 } else { 255 }, 128, 128);
        let mut engine = CpuEngine::new();
        let out = engine.process(&frame, ProcessingMode::EdgeDetect).unwrap();

        assert_eq!(out.pixel(3, 2), [255, 255, 255, 255]);
        assert_eq!(out.pixel(4, 2), [255, 255, 255, 255]);
        assert_eq!(out.pixel(0, 2), [0, 0, 0, 255]);
        assert_eq!(out.pixel(7, 2), [0, 0, 0, 255]);
    }

    #[test]
    fn weak_edges_survive_only_next_to_strong_ones() {
        // A gentle step (magnitude between the thresholds) on its own.
        let size = FrameSize::new(8, 4);
        let gentle = frame_with(size, |x, _| if x < 4 { 100 } else { 115 }, 128, 128);
        let mut engine = CpuEngine::new();
        let out = engine.process(&gentle, ProcessingMode::EdgeDetect).unwrap();
        assert!(out.rgba.chunks_exact(4).all(|p| p[0] == 0));
    }

    #[test]
    fn weak_edge_next_to_strong_edge_is_kept() {
        // Columns 3-4 are strong, 5 is weak beside them, 9-10 are weak with
        // no strong neighbour.
        const COLUMNS: [u8; 12] = [0, 0, 0, 0, 50, 60, 70, 70, 70, 70, 90, 90];
        let size = FrameSize::new(12, 4);
        let frame = frame_with(size, |x, _| COLUMNS[x], 128, 128);
        let mut engine = CpuEngine::new();
        let out = engine.process(&frame, ProcessingMode::EdgeDetect).unwrap();

        let weak = EDGE_LOW_THRESHOLD..EDGE_HIGH_THRESHOLD;
        assert!(engine.magnitude[4] >= EDGE_HIGH_THRESHOLD);
        assert!(weak.contains(&engine.magnitude[5]));
        assert!(weak.contains(&engine.magnitude[9]));

        let white = [255, 255, 255, 255];
        let black = [0, 0, 0, 255];
        for y in 0..4 {
            assert_eq!(out.pixel(3, y), white);
            assert_eq!(out.pixel(4, y), white);
            assert_eq!(out.pixel(5, y), white, "weak pixel beside a strong one");
            assert_eq!(out.pixel(6, y), black);
            assert_eq!(out.pixel(9, y), black);
            assert_eq!(out.pixel(10, y), black);
        }
    }

    #[test]
    fn dimension_change_reallocates_scratch() {
        let mut engine = CpuEngine::new();
        engine
            .process(&grey(FrameSize::new(8, 8), 10), ProcessingMode::EdgeDetect)
            .unwrap();
        assert_eq!(engine.scratch_size(), Some(FrameSize::new(8, 8)));

        let out = engine
            .process(&grey(FrameSize::new(3, 5), 10), ProcessingMode::EdgeDetect)
            .unwrap();
        assert_eq!(out.size, FrameSize::new(3, 5));
        assert_eq!(engine.scratch_size(), Some(FrameSize::new(3, 5)));

        engine.teardown();
        assert_eq!(engine.scratch_size(), None);
    }

    #[test]
    fn undersized_buffer_is_rejected() {
        let mut frame = grey(FrameSize::new(4, 4), 0);
        frame.data.truncate(10);
        let err = CpuEngine::new()
            .process(&frame, ProcessingMode::Raw)
            .unwrap_err();
        assert_eq!(
            err,
            ProcessError::BufferTooSmall {
                expected: 24,
                actual: 10
            }
        );
    }

    #[test]
    fn zero_sized_frame_is_rejected() {
        let frame = RawFrame {
            data: Vec::new(),
            size: FrameSize::new(0, 4),
            sequence: 1,
            timestamp_us: 0,
            chroma: ChromaOrder::Uv,
        };
        assert_eq!(validate(&frame), Err(ProcessError::EmptyFrame));
    }

    #[test]
    fn set_mode_id_rejects_unknown_ids() {
        let register = Arc::new(ModeRegister::new(ProcessingMode::Raw));
        let bridge = NativeBridge::cpu(Arc::clone(&register));
        assert_eq!(bridge.set_mode_id(7), Err(ProcessError::UnknownMode(7)));
        assert_eq!(register.load(), ProcessingMode::Raw);

        bridge.set_mode_id(1).unwrap();
        assert_eq!(register.load(), ProcessingMode::EdgeDetect);
    }

    #[test]
    fn process_uses_mode_snapshot() {
        let register = Arc::new(ModeRegister::default());
        let mut bridge = NativeBridge::cpu(Arc::clone(&register));
        let frame = grey(FrameSize::new(4, 4), 128);

        assert_eq!(bridge.process(&frame).unwrap().mode, ProcessingMode::EdgeDetect);
        bridge.set_mode(ProcessingMode::Raw);
        assert_eq!(bridge.process(&frame).unwrap().mode, ProcessingMode::Raw);
    }

    #[test]
    fn concurrent_mode_flips_while_processing() {
        let register = Arc::new(ModeRegister::default());
        let mut bridge = NativeBridge::cpu(Arc::clone(&register));
        let stop = Arc::new(AtomicBool::new(false));

        let flipper = {
            let register = Arc::clone(&register);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    register.store(ProcessingMode::EdgeDetect);
                    register.store(ProcessingMode::Raw);
                }
            })
        };

        let frame = grey(FrameSize::new(16, 16), 60);
        for _ in 0..500 {
            let out = bridge.process(&frame).unwrap();
            assert!(matches!(
                out.mode,
                ProcessingMode::Raw | ProcessingMode::EdgeDetect
            ));
            assert_eq!(out.rgba.len(), 16 * 16 * 4);
        }
        stop.store(true, Ordering::Relaxed);
        flipper.join().unwrap();
    }
}
