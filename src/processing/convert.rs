use crate::camera::queue::AcquiredImage;
use crate::processing::frame::{ChromaOrder, RawFrame};

/// Concatenate the luma plane and both chroma planes into one buffer.
///
/// The output holds `y` unchanged followed by the chroma planes in `order`.
/// The only allocation is the returned buffer.
pub fn interleave_planes(y: &[u8], u: &[u8], v: &[u8], order: ChromaOrder) -> Vec<u8> {
    let mut out = Vec::with_capacity(y.len() + u.len() + v.len());
    out.extend_from_slice(y);
    match order {
        ChromaOrder::Uv => {
            out.extend_from_slice(u);
            out.extend_from_slice(v);
        }
        ChromaOrder::Vu => {
            out.extend_from_slice(v);
            out.extend_from_slice(u);
        }
    }
    out
}

/// Copy an acquired hardware image into an owned [`RawFrame`].
///
/// Must run inside the frame callback; the image buffer goes back to the
/// pool when the guard drops.
pub fn convert(image: &AcquiredImage, order: ChromaOrder) -> RawFrame {
    let planes = image.planes();
    RawFrame {
        data: interleave_planes(&planes.y, &planes.u, &planes.v, order),
        size: image.size(),
        sequence: image.sequence(),
        timestamp_us: image.timestamp_us(),
        chroma: order,
    }
}
