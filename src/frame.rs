//! Frame types: capture sizes, planar capture frames and packed video frames.

use anyhow::{anyhow, Result};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// A capture output size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureSize {
    pub width: u32,
    pub height: u32,
}

impl CaptureSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Squared Euclidean distance between two sizes, treated as 2D points.
    pub fn distance_squared(&self, other: &CaptureSize) -> u64 {
        let dw = i64::from(self.width) - i64::from(other.width);
        let dh = i64::from(self.height) - i64::from(other.height);
        (dw * dw + dh * dh) as u64
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl std::fmt::Display for CaptureSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One plane of a planar capture frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneDescriptor {
    /// Raw plane bytes, including any row padding.
    pub data: Vec<u8>,
    /// Bytes between the starts of consecutive rows.
    pub row_stride: usize,
    /// Bytes between consecutive samples in a row (2 for interleaved chroma).
    pub pixel_stride: usize,
}

impl PlaneDescriptor {
    pub fn new(data: Vec<u8>, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride,
        }
    }

    /// Capacity reported for this plane.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// One YUV 4:2:0 capture result (Y, U, V planes).
///
/// A frame is owned by whoever acquired it from the reader and must be closed
/// as soon as its bytes have been copied out.
#[derive(Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Acquisition timestamp in nanoseconds.
    pub timestamp_ns: u64,
    planes: Vec<PlaneDescriptor>,
}

impl Frame {
    pub fn new(width: u32, height: u32, timestamp_ns: u64, planes: Vec<PlaneDescriptor>) -> Self {
        Self {
            width,
            height,
            timestamp_ns,
            planes,
        }
    }

    pub fn planes(&self) -> &[PlaneDescriptor] {
        &self.planes
    }

    pub fn size(&self) -> CaptureSize {
        CaptureSize::new(self.width, self.height)
    }

    /// Releases the frame back to the producer.
    pub fn close(self) {}
}

/// Supported pixel formats for packed video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGB with 8 bits per channel (24 bits per pixel)
    Rgb,
    /// RGBA with 8 bits per channel (32 bits per pixel)
    Rgba,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
}

/// A video frame with a single contiguous buffer, as produced by desktop capture
/// backends and consumed by the display surface.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format of the frame data
    pub format: PixelFormat,
    /// Timestamp in nanoseconds (if available)
    pub timestamp_ns: Option<u64>,
    /// Raw pixel data
    pub data: Vec<u8>,
}

fn bt709_yuv() -> ezk_image::ColorInfo {
    ezk_image::ColorInfo::YUV(ezk_image::YuvColorInfo {
        transfer: ezk_image::ColorTransfer::Linear,
        primaries: ezk_image::ColorPrimaries::BT709,
        space: ezk_image::ColorSpace::BT709,
        full_range: false,
    })
}

fn bt709_rgb() -> ezk_image::ColorInfo {
    ezk_image::ColorInfo::RGB(ezk_image::RgbColorInfo {
        transfer: ezk_image::ColorTransfer::Linear,
        primaries: ezk_image::ColorPrimaries::BT709,
    })
}

impl VideoFrame {
    /// Creates a video frame from existing data.
    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            timestamp_ns: None,
            data,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = Some(timestamp_ns);
        self
    }

    pub fn size(&self) -> CaptureSize {
        CaptureSize::new(self.width, self.height)
    }

    /// Converts this frame to RGBA format.
    pub fn to_rgba(&self) -> Result<VideoFrame> {
        let width = self.width as usize;
        let height = self.height as usize;
        let pixel_count = width * height;

        let rgba_data = match self.format {
            PixelFormat::Rgba => return Ok(self.clone()),
            // Fast path: just add alpha=255, no color conversion needed
            PixelFormat::Rgb => {
                let mut rgba = Vec::with_capacity(pixel_count * 4);
                for px in self.data.chunks_exact(3).take(pixel_count) {
                    rgba.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
                rgba
            }
            PixelFormat::Nv12 => {
                let mut rgba = vec![0u8; pixel_count * 4];
                let src_image = ezk_image::Image::from_buffer(
                    ezk_image::PixelFormat::NV12,
                    &self.data[..],
                    None,
                    width,
                    height,
                    bt709_yuv(),
                )
                .map_err(|e| anyhow!("Failed to wrap NV12 buffer: {:?}", e))?;
                let mut dst_image = ezk_image::Image::from_buffer(
                    ezk_image::PixelFormat::RGBA,
                    &mut rgba[..],
                    None,
                    width,
                    height,
                    bt709_rgb(),
                )
                .map_err(|e| anyhow!("Failed to wrap RGBA dst buffer: {:?}", e))?;
                ezk_image::convert(&src_image, &mut dst_image)
                    .map_err(|e| anyhow!("NV12 to RGBA conversion failed: {:?}", e))?;
                rgba
            }
        };

        Ok(VideoFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgba,
            timestamp_ns: self.timestamp_ns,
            data: rgba_data,
        })
    }

    /// Converts this frame to NV12 format using ezk-image.
    pub fn to_nv12(&self) -> Result<VideoFrame> {
        if self.format == PixelFormat::Nv12 {
            return Ok(self.clone());
        }

        let width = self.width as usize;
        let height = self.height as usize;
        let (uv_stride, uv_height) = nv12_chroma_geometry(width, height);
        let mut nv12_data = vec![0u8; width * height + uv_stride * uv_height];

        {
            let mut dst_image = ezk_image::Image::from_buffer(
                ezk_image::PixelFormat::NV12,
                &mut nv12_data[..],
                None,
                width,
                height,
                bt709_yuv(),
            )
            .map_err(|e| anyhow!("Failed to wrap NV12 buffer: {:?}", e))?;

            let src_format = match self.format {
                PixelFormat::Rgba => ezk_image::PixelFormat::RGBA,
                PixelFormat::Rgb => ezk_image::PixelFormat::RGB,
                PixelFormat::Nv12 => unreachable!(),
            };
            let src_image = ezk_image::Image::from_buffer(
                src_format,
                &self.data[..],
                None,
                width,
                height,
                bt709_rgb(),
            )
            .map_err(|e| anyhow!("Failed to wrap {:?} buffer: {:?}", self.format, e))?;
            ezk_image::convert(&src_image, &mut dst_image)
                .map_err(|e| anyhow!("Conversion to NV12 failed: {:?}", e))?;
        }

        Ok(VideoFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Nv12,
            timestamp_ns: self.timestamp_ns,
            data: nv12_data,
        })
    }

    /// Splits an NV12 frame into a three-plane capture frame.
    ///
    /// The U and V planes view the interleaved chroma with a pixel stride of 2,
    /// V starting one byte after U, the layout camera stacks hand out for
    /// semi-planar 4:2:0 buffers.
    pub fn to_planar_frame(&self) -> Result<Frame> {
        if self.format != PixelFormat::Nv12 {
            return Err(anyhow!("planar split needs NV12, got {:?}", self.format));
        }
        let width = self.width as usize;
        let height = self.height as usize;
        let y_len = width * height;
        let (uv_stride, uv_height) = nv12_chroma_geometry(width, height);
        if self.data.len() < y_len + uv_stride * uv_height {
            return Err(anyhow!(
                "NV12 buffer holds {} bytes, {}x{} needs {}",
                self.data.len(),
                width,
                height,
                y_len + uv_stride * uv_height
            ));
        }

        let chroma = &self.data[y_len..y_len + uv_stride * uv_height];
        let planes = vec![
            PlaneDescriptor::new(self.data[..y_len].to_vec(), width, 1),
            PlaneDescriptor::new(chroma[..chroma.len() - 1].to_vec(), uv_stride, 2),
            PlaneDescriptor::new(chroma[1..].to_vec(), uv_stride, 2),
        ];

        Ok(Frame::new(
            self.width,
            self.height,
            self.timestamp_ns.unwrap_or_default(),
            planes,
        ))
    }
}

fn nv12_chroma_geometry(width: usize, height: usize) -> (usize, usize) {
    (width + (width % 2), height.div_ceil(2))
}

/// Vertex for drawing the full-screen quad as a triangle strip.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl QuadVertex {
    /// Bottom-left, bottom-right, top-left, top-right. Texture rows start at
    /// the top of the image, so `v` runs opposite to clip-space `y`.
    pub const STRIP: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
    ];

    /// Returns the vertex buffer layout.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_rgba_conversion() {
        let rgb_data = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let frame = VideoFrame::from_data(2, 2, PixelFormat::Rgb, rgb_data);
        let rgba_frame = frame.to_rgba().unwrap();

        assert_eq!(rgba_frame.format, PixelFormat::Rgba);
        assert_eq!(rgba_frame.data.len(), 16);
        assert_eq!(&rgba_frame.data[0..4], &[255, 0, 0, 255]);
        assert_eq!(&rgba_frame.data[4..8], &[0, 255, 0, 255]);
    }

    #[test]
    fn distance_is_zero_for_identical_sizes() {
        let a = CaptureSize::new(640, 480);
        assert_eq!(a.distance_squared(&a), 0);
        assert_eq!(a.distance_squared(&CaptureSize::new(643, 484)), 25);
    }

    #[test]
    fn nv12_split_interleaves_chroma() {
        // 2x2 luma, one UV pair
        let data = vec![10, 20, 30, 40, 100, 200];
        let frame = VideoFrame::from_data(2, 2, PixelFormat::Nv12, data).with_timestamp(7);
        let planar = frame.to_planar_frame().unwrap();

        assert_eq!(planar.timestamp_ns, 7);
        let planes = planar.planes();
        assert_eq!(planes.len(), 3);
        assert_eq!(planes[0].data, vec![10, 20, 30, 40]);
        assert_eq!(planes[1].data[0], 100);
        assert_eq!(planes[2].data[0], 200);
        assert_eq!(planes[1].pixel_stride, 2);
        assert_eq!(planes[2].row_stride, 2);
    }

    #[test]
    fn planar_split_rejects_short_buffers() {
        let frame = VideoFrame::from_data(4, 4, PixelFormat::Nv12, vec![0; 10]);
        assert!(frame.to_planar_frame().is_err());
    }
}
