use bytes::Bytes;
use fast_image_resize as fr;
use fr::images::Image;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb};

use crate::camera::types::FrameSize;
use crate::processing::frame::ProcessedFrame;
use crate::stream::error::{Result, StreamError};

/// Compress raw RGB pixel data to JPEG at the given quality (1-100).
pub fn compress_jpeg(data: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let img: ImageBuffer<Rgb<u8>, _> = ImageBuffer::from_raw(width, height, data)
        .ok_or_else(|| StreamError::Encode(format!("buffer does not hold {width}x{height} RGB")))?;

    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    img.write_with_encoder(encoder)
        .map_err(|e| StreamError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Drop the alpha channel.
pub fn rgba_to_rgb(rgba: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(rgba.len() / 4 * 3);
    for px in rgba.chunks_exact(4) {
        rgb.extend_from_slice(&px[..3]);
    }
    rgb
}

/// Size after limiting the width to `max_width`, keeping the aspect ratio.
pub fn scaled_size(size: FrameSize, max_width: Option<u32>) -> FrameSize {
    match max_width {
        Some(max) if max > 0 && size.width > max => {
            let height = (size.height as u64 * max as u64 / size.width as u64).max(1) as u32;
            FrameSize::new(max, height)
        }
        _ => size,
    }
}

/// Resize an RGBA image with `fast_image_resize`.
fn resize_rgba(rgba: &[u8], from: FrameSize, to: FrameSize) -> Result<Vec<u8>> {
    let src = Image::from_vec_u8(from.width, from.height, rgba.to_vec(), fr::PixelType::U8x4)
        .map_err(|e| StreamError::Encode(e.to_string()))?;
    let mut dst = Image::new(to.width, to.height, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(&src, &mut dst, None)
        .map_err(|e| StreamError::Encode(e.to_string()))?;
    Ok(dst.into_vec())
}

/// One processed frame ready for the wire.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Bytes,
    pub size: FrameSize,
    pub sequence: u64,
}

/// JPEG-encode a processed frame, downscaling first when it is wider than
/// `max_width`.
pub fn encode_frame(
    frame: &ProcessedFrame,
    quality: u8,
    max_width: Option<u32>,
) -> Result<EncodedFrame> {
    let size = scaled_size(frame.size, max_width);
    let rgb = if size == frame.size {
        rgba_to_rgb(&frame.rgba)
    } else {
        rgba_to_rgb(&resize_rgba(&frame.rgba, frame.size, size)?)
    };
    let jpeg = compress_jpeg(&rgb, size.width, size.height, quality)?;
    Ok(EncodedFrame {
        jpeg: Bytes::from(jpeg),
        size,
        sequence: frame.sequence,
    })
}
