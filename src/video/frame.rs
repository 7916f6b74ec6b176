//! Video Frame Types
//!
//! Pixel formats, line/buffer size arithmetic, and the values handed to
//! frame consumers (encoders, previews) once a buffer has been dequeued.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Round `value` up to the next multiple of `align`
///
/// `align` of zero leaves the value unchanged.
pub fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

/// Pixel format of captured frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// UYVY (YUV 4:2:2 packed, chroma first) - CCDC/VPFE default
    #[default]
    UYVY,
    /// YUYV (YUV 4:2:2 packed) - Common V4L2 format
    YUYV,
    /// NV12 (YUV 4:2:0 semi-planar) - Common hardware format
    NV12,
    /// I420 (YUV 4:2:0 planar)
    I420,
    /// 8-bit greyscale / raw Bayer
    GREY,
}

impl PixelFormat {
    /// Get the V4L2 fourcc code for this format
    pub fn fourcc(&self) -> u32 {
        u32::from_le_bytes(self.fourcc_bytes())
    }

    /// FourCC as bytes
    pub fn fourcc_bytes(&self) -> [u8; 4] {
        match self {
            PixelFormat::UYVY => *b"UYVY",
            PixelFormat::YUYV => *b"YUYV",
            PixelFormat::NV12 => *b"NV12",
            PixelFormat::I420 => *b"YU12",
            PixelFormat::GREY => *b"GREY",
        }
    }

    /// Format for a V4L2 fourcc, if known
    pub fn from_fourcc(fourcc: u32) -> Option<Self> {
        match &fourcc.to_le_bytes() {
            b"UYVY" => Some(PixelFormat::UYVY),
            b"YUYV" => Some(PixelFormat::YUYV),
            b"NV12" => Some(PixelFormat::NV12),
            b"YU12" | b"I420" => Some(PixelFormat::I420),
            b"GREY" => Some(PixelFormat::GREY),
            _ => None,
        }
    }

    /// Minimum bytes per line of the first plane
    pub fn bytes_per_line(&self, width: u32) -> u32 {
        match self {
            PixelFormat::UYVY | PixelFormat::YUYV => width * 2,
            PixelFormat::NV12 | PixelFormat::I420 | PixelFormat::GREY => width,
        }
    }

    /// Buffer size for a frame whose first plane has `pitch` bytes per line
    pub fn frame_size(&self, pitch: u32, height: u32) -> usize {
        let plane = pitch as usize * height as usize;
        match self {
            PixelFormat::UYVY | PixelFormat::YUYV | PixelFormat::GREY => plane,
            PixelFormat::NV12 | PixelFormat::I420 => plane * 3 / 2,
        }
    }

    /// Calculate the buffer size needed for a tightly packed frame
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        self.frame_size(self.bytes_per_line(width), height)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::UYVY => write!(f, "UYVY (YUV 4:2:2 packed)"),
            PixelFormat::YUYV => write!(f, "YUYV (YUV 4:2:2 packed)"),
            PixelFormat::NV12 => write!(f, "NV12 (YUV 4:2:0 semi-planar)"),
            PixelFormat::I420 => write!(f, "I420 (YUV 4:2:0 planar)"),
            PixelFormat::GREY => write!(f, "GREY (8-bit)"),
        }
    }
}

/// Borrowed view of a dequeued buffer
///
/// Valid until the buffer is handed back with `enqueue`; the borrow checker
/// ties it to the session so it cannot outlive that call.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    /// Driver buffer index
    pub index: usize,
    /// Valid payload (`bytes_used` bytes)
    pub data: &'a [u8],
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Capture timestamp
    pub timestamp: Duration,
    /// Driver sequence number
    pub sequence: u32,
}

impl FrameView<'_> {
    /// Payload length in bytes
    pub fn bytes_used(&self) -> usize {
        self.data.len()
    }

    /// Copy the payload into an owned frame
    pub fn to_owned_frame(&self, format: PixelFormat) -> CapturedFrame {
        CapturedFrame {
            index: self.index,
            width: self.width,
            height: self.height,
            format,
            timestamp: self.timestamp,
            sequence: self.sequence,
            data: self.data.to_vec(),
        }
    }
}

/// Owned copy of a captured frame
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Buffer index the frame was captured into
    pub index: usize,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format
    pub format: PixelFormat,
    /// Capture timestamp
    pub timestamp: Duration,
    /// Driver sequence number
    pub sequence: u32,
    /// Frame data
    pub data: Vec<u8>,
}

impl CapturedFrame {
    /// Get the Y plane (for planar YUV formats)
    pub fn y_plane(&self) -> Option<&[u8]> {
        match self.format {
            PixelFormat::I420 | PixelFormat::NV12 => {
                let y_size = self.width as usize * self.height as usize;
                self.data.get(..y_size)
            }
            _ => None,
        }
    }

    /// Get the interleaved UV plane (for NV12)
    pub fn uv_plane(&self) -> Option<&[u8]> {
        if self.format != PixelFormat::NV12 {
            return None;
        }
        let y_size = self.width as usize * self.height as usize;
        self.data.get(y_size..)
    }
}
