//! Planar YUV 4:2:0 to packed ARGB8888 conversion.
//!
//! [`PlaneBuffers`] copies plane bytes out of a capture frame into buffers that
//! are sized once and then reused, so the frame can be released immediately.
//! [`convert_yuv420_to_argb8888`] is the pure conversion over those bytes.

use crate::error::ConvertError;
use crate::frame::PlaneDescriptor;
use tracing::debug;

/// 18-bit fixed point ceiling for an intermediate channel value.
const MAX_CHANNEL_VALUE: i32 = 262_143;

/// Opaque alpha in ARGB8888.
const ALPHA_OPAQUE: u32 = 0xff00_0000;

#[inline]
fn yuv_to_argb(y: u8, u: u8, v: u8) -> u32 {
    // BT.601 limited range, 10-bit fixed point coefficients.
    let y = (i32::from(y) - 16).max(0);
    let u = i32::from(u) - 128;
    let v = i32::from(v) - 128;

    let y1192 = 1192 * y;
    let r = (y1192 + 1634 * v).clamp(0, MAX_CHANNEL_VALUE) as u32;
    let g = (y1192 - 833 * v - 400 * u).clamp(0, MAX_CHANNEL_VALUE) as u32;
    let b = (y1192 + 2066 * u).clamp(0, MAX_CHANNEL_VALUE) as u32;

    ALPHA_OPAQUE | ((r << 6) & 0x00ff_0000) | ((g >> 2) & 0x0000_ff00) | ((b >> 10) & 0x0000_00ff)
}

/// Stride metadata for a three-plane 4:2:0 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Yuv420Layout {
    pub width: usize,
    pub height: usize,
    pub y_row_stride: usize,
    pub uv_row_stride: usize,
    pub uv_pixel_stride: usize,
}

impl Yuv420Layout {
    fn required_luma(&self) -> usize {
        if self.width == 0 || self.height == 0 {
            return 0;
        }
        (self.height - 1) * self.y_row_stride + self.width
    }

    fn required_chroma(&self) -> usize {
        if self.width == 0 || self.height == 0 {
            return 0;
        }
        ((self.height - 1) / 2) * self.uv_row_stride + ((self.width - 1) / 2) * self.uv_pixel_stride + 1
    }

    fn validate(&self, y: &[u8], u: &[u8], v: &[u8], out_len: usize) -> Result<(), ConvertError> {
        if self.y_row_stride < self.width {
            return Err(ConvertError::InvalidStride(format!(
                "luma row stride {} is narrower than width {}",
                self.y_row_stride, self.width
            )));
        }
        if self.uv_pixel_stride == 0 {
            return Err(ConvertError::InvalidStride("chroma pixel stride is zero".into()));
        }

        let luma = self.required_luma();
        if y.len() < luma {
            return Err(ConvertError::PlaneTooShort { plane: "Y", required: luma, actual: y.len() });
        }
        let chroma = self.required_chroma();
        for (plane, data) in [("U", u), ("V", v)] {
            if data.len() < chroma {
                return Err(ConvertError::PlaneTooShort { plane, required: chroma, actual: data.len() });
            }
        }

        let pixels = self.width * self.height;
        if out_len < pixels {
            return Err(ConvertError::OutputTooShort { required: pixels, actual: out_len });
        }
        Ok(())
    }
}

/// Converts three 4:2:0 planes into packed ARGB8888 pixels (`0xAARRGGBB`).
///
/// Luma for pixel (x, y) is read at `y * y_row_stride + x`, both chroma samples at
/// `(y / 2) * uv_row_stride + (x / 2) * uv_pixel_stride`. Inputs are never
/// modified and `out` is written in row-major order without padding.
pub fn convert_yuv420_to_argb8888(
    y_plane: &[u8],
    u_plane: &[u8],
    v_plane: &[u8],
    layout: &Yuv420Layout,
    out: &mut [u32],
) -> Result<(), ConvertError> {
    layout.validate(y_plane, u_plane, v_plane, out.len())?;

    let mut index = 0;
    for row in 0..layout.height {
        let luma_row = row * layout.y_row_stride;
        let chroma_row = (row >> 1) * layout.uv_row_stride;
        for col in 0..layout.width {
            let chroma = chroma_row + (col >> 1) * layout.uv_pixel_stride;
            out[index] = yuv_to_argb(y_plane[luma_row + col], u_plane[chroma], v_plane[chroma]);
            index += 1;
        }
    }
    Ok(())
}

/// Reusable conversion output. Allocates only when the frame grows.
#[derive(Debug, Default)]
pub struct ColorConverter {
    argb: Vec<u32>,
}

impl ColorConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts the planes held in `buffers` and returns the packed pixels.
    pub fn convert(&mut self, buffers: &PlaneBuffers, width: u32, height: u32) -> Result<&[u32], ConvertError> {
        let [y, u, v] = buffers.yuv()?;
        let layout = Yuv420Layout {
            width: width as usize,
            height: height as usize,
            y_row_stride: y.row_stride,
            uv_row_stride: u.row_stride,
            uv_pixel_stride: u.pixel_stride,
        };

        let pixels = layout.width * layout.height;
        if self.argb.len() < pixels {
            self.argb.resize(pixels, 0);
        }
        convert_yuv420_to_argb8888(y.bytes, u.bytes, v.bytes, &layout, &mut self.argb[..pixels])?;
        Ok(&self.argb[..pixels])
    }
}

/// Borrowed view of one filled plane.
#[derive(Debug, Clone, Copy)]
pub struct PlaneView<'a> {
    pub bytes: &'a [u8],
    pub row_stride: usize,
    pub pixel_stride: usize,
}

#[derive(Debug, Default)]
struct PlaneSlot {
    bytes: Vec<u8>,
    len: usize,
    row_stride: usize,
    pixel_stride: usize,
}

/// Per-plane destination buffers, sized lazily from the first observed capacity.
///
/// Row strides vary by device, so the needed size is unknown until a frame
/// arrives. A buffer is allocated the first time its plane index is seen and
/// reused afterwards; it only ever grows.
#[derive(Debug, Default)]
pub struct PlaneBuffers {
    slots: Vec<PlaneSlot>,
    allocations: usize,
}

impl PlaneBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies every source plane into its destination buffer.
    pub fn fill(&mut self, planes: &[PlaneDescriptor]) {
        for (index, plane) in planes.iter().enumerate() {
            if self.slots.len() <= index {
                self.slots.push(PlaneSlot::default());
            }
            let slot = &mut self.slots[index];
            let capacity = plane.capacity();
            if slot.bytes.len() < capacity {
                debug!(plane = index, capacity, "Initializing plane buffer");
                slot.bytes.resize(capacity, 0);
                self.allocations += 1;
            }
            slot.bytes[..capacity].copy_from_slice(&plane.data);
            slot.len = capacity;
            slot.row_stride = plane.row_stride;
            slot.pixel_stride = plane.pixel_stride;
        }
        for slot in self.slots.iter_mut().skip(planes.len()) {
            slot.len = 0;
        }
    }

    pub fn plane(&self, index: usize) -> Option<PlaneView<'_>> {
        self.slots.get(index).map(|slot| PlaneView {
            bytes: &slot.bytes[..slot.len],
            row_stride: slot.row_stride,
            pixel_stride: slot.pixel_stride,
        })
    }

    /// Capacity of the destination buffer for a plane index.
    pub fn capacity(&self, index: usize) -> Option<usize> {
        self.slots.get(index).map(|slot| slot.bytes.len())
    }

    /// Number of buffer (re)allocations performed so far.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    fn yuv(&self) -> Result<[PlaneView<'_>; 3], ConvertError> {
        match (self.plane(0), self.plane(1), self.plane(2)) {
            (Some(y), Some(u), Some(v)) => Ok([y, u, v]),
            _ => Err(ConvertError::MissingPlanes(self.slots.len())),
        }
    }
}
