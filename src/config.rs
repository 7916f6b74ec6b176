//! Capture Configuration
//!
//! JSON-backed settings for opening a device and sizing its buffer pool.
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```json
//! { "device_path": "/dev/video1", "width": 720, "height": 576 }
//! ```

use crate::error::{CaptureError, Result};
use crate::memory::DMA_ALIGNMENT;
use crate::video::{align_up, PixelFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Largest buffer count a V4L2 driver accepts (VIDEO_MAX_FRAME)
pub const MAX_BUFFER_COUNT: usize = 32;

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture device node
    pub device_path: PathBuf,
    /// Input to select before registering buffers
    pub input: Option<u32>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format the driver is expected to deliver
    pub pixel_format: PixelFormat,
    /// Buffers in the pool
    pub buffer_count: usize,
    /// Bytes per buffer; derived from the line pitch when absent
    pub buffer_size: Option<usize>,
    /// Dequeue bound in milliseconds; `None` waits indefinitely
    pub dequeue_timeout_ms: Option<u64>,
    /// Frame channel capacity for the capture daemon
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            input: None,
            width: 640,
            height: 480,
            pixel_format: PixelFormat::UYVY,
            buffer_count: 4,
            buffer_size: None,
            dequeue_timeout_ms: Some(2000),
            channel_capacity: 8,
        }
    }
}

impl CaptureConfig {
    /// 640x480 capture
    pub fn vga() -> Self {
        Self::default()
    }

    /// 1280x720 capture
    pub fn hd_720p() -> Self {
        Self {
            width: 1280,
            height: 720,
            ..Default::default()
        }
    }

    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading capture config from {}", path.display());
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Serialize as pretty-printed JSON
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::config(format!(
                "invalid frame size {}x{}",
                self.width, self.height
            )));
        }
        if self.buffer_count == 0 || self.buffer_count > MAX_BUFFER_COUNT {
            return Err(CaptureError::config(format!(
                "buffer_count must be 1..={}, got {}",
                MAX_BUFFER_COUNT, self.buffer_count
            )));
        }
        if self.buffer_size == Some(0) {
            return Err(CaptureError::config("buffer_size must be non-zero"));
        }
        if self.dequeue_timeout_ms == Some(0) {
            return Err(CaptureError::config(
                "dequeue_timeout_ms must be non-zero, use null to wait indefinitely",
            ));
        }
        if self.channel_capacity == 0 {
            return Err(CaptureError::config("channel_capacity must be non-zero"));
        }
        Ok(())
    }

    /// Dequeue bound as a duration
    pub fn dequeue_timeout(&self) -> Option<Duration> {
        self.dequeue_timeout_ms.map(Duration::from_millis)
    }

    /// Buffer size for a driver reporting `line_pitch` bytes per line
    pub fn buffer_size_for_pitch(&self, line_pitch: u32) -> usize {
        self.buffer_size.unwrap_or_else(|| {
            align_up(
                self.pixel_format.frame_size(line_pitch, self.height),
                DMA_ALIGNMENT,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = CaptureConfig::default();
        assert_eq!(config.device_path, PathBuf::from("/dev/video0"));
        assert_eq!(config.buffer_count, 4);
        assert_eq!(config.dequeue_timeout(), Some(Duration::from_secs(2)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_presets() {
        assert_eq!(CaptureConfig::vga().width, 640);
        let hd = CaptureConfig::hd_720p();
        assert_eq!((hd.width, hd.height), (1280, 720));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            CaptureConfig::from_json_str(r#"{"width": 720, "height": 576, "pixel_format": "YUYV"}"#)
                .unwrap();
        assert_eq!(config.width, 720);
        assert_eq!(config.pixel_format, PixelFormat::YUYV);
        assert_eq!(config.buffer_count, 4);
    }

    #[test]
    fn test_invalid_json_values() {
        assert!(matches!(
            CaptureConfig::from_json_str(r#"{"buffer_count": 0}"#),
            Err(CaptureError::Config(_))
        ));
        assert!(matches!(
            CaptureConfig::from_json_str(r#"{"buffer_count": 4"#),
            Err(CaptureError::Json(_))
        ));
    }

    #[test]
    fn test_buffer_size_for_pitch() {
        let config = CaptureConfig::default();
        // 1300 * 480 rounds up to a multiple of 32
        assert_eq!(config.buffer_size_for_pitch(1300), 624_000);

        let fixed = CaptureConfig {
            buffer_size: Some(65536),
            ..Default::default()
        };
        assert_eq!(fixed.buffer_size_for_pitch(1300), 65536);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"device_path": "/dev/video3", "input": 1}}"#).unwrap();

        let config = CaptureConfig::from_file(file.path()).unwrap();
        assert_eq!(config.device_path, PathBuf::from("/dev/video3"));
        assert_eq!(config.input, Some(1));
    }

    #[test]
    fn test_json_round_trip() {
        let config = CaptureConfig::hd_720p();
        let json = config.to_json_string().unwrap();
        assert_eq!(CaptureConfig::from_json_str(&json).unwrap(), config);
    }
}
