use tracing::info;

use crate::camera::types::FrameSize;
use crate::processing::frame::ProcessedFrame;
use crate::render::surface::{RenderError, Result, SurfaceBackend};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Off-screen `wgpu` surface.
///
/// Frames are uploaded into an RGBA texture sized to the frame and copied
/// into the surface target. Must be created and used on the render thread.
pub struct WgpuSurface {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_size: FrameSize,
    target: Option<wgpu::Texture>,
    frame_texture: Option<(wgpu::Texture, FrameSize)>,
}

impl std::fmt::Debug for WgpuSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuSurface")
            .field("surface_size", &self.surface_size)
            .finish_non_exhaustive()
    }
}

impl WgpuSurface {
    /// Acquire an adapter and device. Fails when no adapter is available.
    pub fn new(surface_size: FrameSize) -> Result<Self> {
        if surface_size.pixel_count() == 0 {
            return Err(RenderError::EmptySurface(surface_size));
        }
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| RenderError::NoAdapter(e.to_string()))?;

        info!(adapter = ?adapter.get_info().name, "using GPU adapter");

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("edgecam-render"),
            ..Default::default()
        }))
        .map_err(|e| RenderError::Device(e.to_string()))?;

        Ok(Self {
            device,
            queue,
            surface_size,
            target: None,
            frame_texture: None,
        })
    }

    fn create_texture(
        &self,
        label: &str,
        size: FrameSize,
        usage: wgpu::TextureUsages,
    ) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage,
            view_formats: &[],
        })
    }

    fn write_rgba(&self, texture: &wgpu::Texture, size: FrameSize, rgba: &[u8]) -> Result<()> {
        let expected = size.pixel_count() * 4;
        if size.pixel_count() == 0 || rgba.len() != expected {
            return Err(RenderError::UploadLength {
                expected,
                actual: rgba.len(),
            });
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.width * 4),
                rows_per_image: Some(size.height),
            },
            extent(size),
        );
        Ok(())
    }

    /// (Re)build the surface target at the current surface size.
    fn create_target(&mut self) {
        self.target = Some(self.create_texture(
            "surface-target",
            self.surface_size,
            wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::RENDER_ATTACHMENT,
        ));
    }
}

fn extent(size: FrameSize) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

impl SurfaceBackend for WgpuSurface {
    fn on_created(&mut self) -> Result<()> {
        self.frame_texture = None;
        self.create_target();
        Ok(())
    }

    /// Only the target follows the surface; the frame texture stays valid.
    fn on_resized(&mut self, size: FrameSize) -> Result<()> {
        if size.pixel_count() == 0 {
            return Err(RenderError::EmptySurface(size));
        }
        self.surface_size = size;
        if self.target.is_some() {
            self.create_target();
        }
        Ok(())
    }

    fn allocate_texture(&mut self, size: FrameSize) -> Result<()> {
        let texture = self.create_texture(
            "frame-texture",
            size,
            wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        self.frame_texture = Some((texture, size));
        Ok(())
    }

    fn draw_frame(&mut self, frame: &ProcessedFrame) -> Result<()> {
        let (Some(target), Some((texture, size))) = (&self.target, &self.frame_texture) else {
            return Err(RenderError::NotCreated);
        };
        if *size != frame.size {
            return Err(RenderError::SizeMismatch {
                texture: *size,
                frame: frame.size,
            });
        }
        self.write_rgba(texture, *size, &frame.rgba)?;

        let copy = FrameSize::new(
            size.width.min(self.surface_size.width),
            size.height.min(self.surface_size.height),
        );
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("draw-frame"),
            });
        encoder.copy_texture_to_texture(
            texture.as_image_copy(),
            target.as_image_copy(),
            extent(copy),
        );
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn draw_clear(&mut self) -> Result<()> {
        let Some(target) = &self.target else {
            return Err(RenderError::NotCreated);
        };
        let size = self.surface_size;
        let mut black = vec![0u8; size.pixel_count() * 4];
        for px in black.chunks_exact_mut(4) {
            px[3] = 255;
        }
        self.write_rgba(target, size, &black)?;
        self.queue.submit(None);
        Ok(())
    }
}
