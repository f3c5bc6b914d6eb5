//! Surface renderer lifecycle.
//!
//! [`SurfaceRenderer`] implements the created / size-changed / draw contract
//! over a [`SurfaceBackend`]. It owns the invariant that a frame texture is
//! (re)allocated for a frame's dimensions before the first upload at those
//! dimensions.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::camera::types::FrameSize;
use crate::processing::frame::ProcessedFrame;
use crate::render::slot::FrameSlot;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("no suitable GPU adapter: {0}")]
    NoAdapter(String),

    #[error("GPU device error: {0}")]
    Device(String),

    #[error("draw requested before the surface was created")]
    NotCreated,

    #[error("frame {frame} does not match texture {texture}")]
    SizeMismatch { texture: FrameSize, frame: FrameSize },

    #[error("surface size {0} must be non-zero")]
    EmptySurface(FrameSize),

    #[error("upload of {actual} bytes does not fill {expected} byte texture")]
    UploadLength { expected: usize, actual: usize },

    #[error("render backend panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Rendering engine behind the renderer. Only ever used from the render
/// thread.
pub trait SurfaceBackend {
    /// (Re)create the rendering context. Previously allocated textures are
    /// gone afterwards.
    fn on_created(&mut self) -> Result<()>;

    /// Follow a surface size change. The frame texture must stay usable.
    fn on_resized(&mut self, size: FrameSize) -> Result<()>;

    /// Allocate the frame texture for `size`.
    fn allocate_texture(&mut self, size: FrameSize) -> Result<()>;

    /// Upload `frame` into the frame texture and draw it.
    fn draw_frame(&mut self, frame: &ProcessedFrame) -> Result<()>;

    /// Draw the empty state.
    fn draw_clear(&mut self) -> Result<()>;
}

impl<B: SurfaceBackend + ?Sized> SurfaceBackend for Box<B> {
    fn on_created(&mut self) -> Result<()> {
        (**self).on_created()
    }

    fn on_resized(&mut self, size: FrameSize) -> Result<()> {
        (**self).on_resized(size)
    }

    fn allocate_texture(&mut self, size: FrameSize) -> Result<()> {
        (**self).allocate_texture(size)
    }

    fn draw_frame(&mut self, frame: &ProcessedFrame) -> Result<()> {
        (**self).draw_frame(frame)
    }

    fn draw_clear(&mut self) -> Result<()> {
        (**self).draw_clear()
    }
}

/// What a draw call ended up drawing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    Cleared,
    Frame { sequence: u64, size: FrameSize },
}

pub struct SurfaceRenderer<B> {
    backend: B,
    slot: Arc<FrameSlot>,
    created: bool,
    surface_size: Option<FrameSize>,
    texture_size: Option<FrameSize>,
}

impl<B: SurfaceBackend> SurfaceRenderer<B> {
    pub fn new(backend: B, slot: Arc<FrameSlot>) -> Self {
        Self {
            backend,
            slot,
            created: false,
            surface_size: None,
            texture_size: None,
        }
    }

    pub fn on_surface_created(&mut self) -> Result<()> {
        self.backend.on_created()?;
        self.created = true;
        self.texture_size = None;
        if let Some(size) = self.surface_size {
            self.backend.on_resized(size)?;
        }
        info!("render surface created");
        Ok(())
    }

    pub fn on_surface_size_changed(&mut self, width: u32, height: u32) -> Result<()> {
        let size = FrameSize::new(width, height);
        if size.pixel_count() == 0 {
            return Err(RenderError::EmptySurface(size));
        }
        self.surface_size = Some(size);
        if self.created {
            self.backend.on_resized(size)?;
        }
        debug!(%size, "render surface resized");
        Ok(())
    }

    /// Draw the most recent processed frame, or the clear state before the
    /// first frame.
    pub fn on_draw_frame(&mut self) -> Result<DrawOutcome> {
        if !self.created {
            return Err(RenderError::NotCreated);
        }
        let Some(frame) = self.slot.latest() else {
            self.backend.draw_clear()?;
            return Ok(DrawOutcome::Cleared);
        };

        if self.texture_size != Some(frame.size) {
            debug!(size = %frame.size, "allocating frame texture");
            self.backend.allocate_texture(frame.size)?;
            self.texture_size = Some(frame.size);
        }
        self.backend.draw_frame(&frame)?;
        Ok(DrawOutcome::Frame {
            sequence: frame.sequence,
            size: frame.size,
        })
    }

    pub fn surface_size(&self) -> Option<FrameSize> {
        self.surface_size
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

/// Pixels of the last presented image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Framebuffer {
    pub size: Option<FrameSize>,
    pub rgba: Vec<u8>,
    pub presented: u64,
    pub last_sequence: Option<u64>,
}

/// CPU surface backend: keeps the presented image in memory.
///
/// Used when no GPU adapter is available and for headless runs.
#[derive(Clone, Default)]
pub struct HeadlessSurface {
    texture: Option<FrameSize>,
    framebuffer: Arc<Mutex<Framebuffer>>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the presented image, readable from any thread.
    pub fn framebuffer(&self) -> Arc<Mutex<Framebuffer>> {
        Arc::clone(&self.framebuffer)
    }
}

impl SurfaceBackend for HeadlessSurface {
    fn on_created(&mut self) -> Result<()> {
        self.texture = None;
        Ok(())
    }

    fn on_resized(&mut self, _size: FrameSize) -> Result<()> {
        Ok(())
    }

    fn allocate_texture(&mut self, size: FrameSize) -> Result<()> {
        self.texture = Some(size);
        Ok(())
    }

    fn draw_frame(&mut self, frame: &ProcessedFrame) -> Result<()> {
        match self.texture {
            Some(texture) if texture == frame.size => {}
            Some(texture) => {
                return Err(RenderError::SizeMismatch {
                    texture,
                    frame: frame.size,
                })
            }
            None => return Err(RenderError::NotCreated),
        }
        let mut fb = self.framebuffer.lock();
        fb.size = Some(frame.size);
        fb.rgba.clear();
        fb.rgba.extend_from_slice(&frame.rgba);
        fb.presented += 1;
        fb.last_sequence = Some(frame.sequence);
        Ok(())
    }

    fn draw_clear(&mut self) -> Result<()> {
        let mut fb = self.framebuffer.lock();
        fb.rgba.clear();
        fb.size = None;
        fb.presented += 1;
        fb.last_sequence = None;
        Ok(())
    }
}
