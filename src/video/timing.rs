//! Frame Timing Tracker
//!
//! Running inter-frame period statistics computed from driver capture
//! timestamps, in integer microseconds.
//!
//! The average uses the incremental form
//! `avg' = (avg * n + period) / (n + 1)` where `n` is the index of the frame
//! just observed. It is weighted slightly towards the first period (frame 1
//! counts twice) and truncates on every step; both are kept so results stay
//! comparable with existing capture logs.
//!
//! ## Usage
//!
//! ```rust
//! use capture_dma_core::video::FrameTimingTracker;
//! use std::time::Duration;
//!
//! let mut timing = FrameTimingTracker::new();
//! timing.observe(0, Duration::from_micros(0)).unwrap();
//! timing.observe(1, Duration::from_micros(1000)).unwrap();
//! assert_eq!(timing.stats().unwrap().average_us, 1000);
//! ```

use crate::error::{CaptureError, Result};
use crate::video::session::DequeuedBuffer;
use std::time::Duration;
use tracing::trace;

/// Inter-frame period snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTimingStats {
    /// Running average period in microseconds
    pub average_us: u64,
    /// Shortest period observed
    pub min_us: u64,
    /// Longest period observed
    pub max_us: u64,
    /// Frames observed, baseline included
    pub frames: u64,
}

impl FrameTimingStats {
    /// Frame rate implied by the average period
    pub fn fps(&self) -> f64 {
        if self.average_us == 0 {
            return 0.0;
        }
        1_000_000.0 / self.average_us as f64
    }
}

/// Frame timing tracker
///
/// Reset by creating a new tracker.
#[derive(Debug, Clone, Default)]
pub struct FrameTimingTracker {
    previous_us: Option<u64>,
    next_index: u64,
    average_us: u64,
    min_us: u64,
    max_us: u64,
}

impl FrameTimingTracker {
    /// Create a tracker waiting for frame 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the timestamp of frame `frame_index`
    ///
    /// Returns the running average period, or 0 for the baseline frame.
    /// Indices must arrive as 0, 1, 2, ... and timestamps must not go
    /// backwards; otherwise nothing is recorded.
    pub fn observe(&mut self, frame_index: u64, timestamp: Duration) -> Result<u64> {
        if frame_index != self.next_index {
            return Err(CaptureError::invalid_argument(format!(
                "frame index {} out of order, expected {}",
                frame_index, self.next_index
            )));
        }

        let now_us = timestamp.as_micros().min(u64::MAX as u128) as u64;

        let Some(previous_us) = self.previous_us else {
            self.previous_us = Some(now_us);
            self.next_index = 1;
            return Ok(0);
        };

        if now_us < previous_us {
            return Err(CaptureError::invalid_argument(format!(
                "timestamp {}us precedes previous frame at {}us",
                now_us, previous_us
            )));
        }

        let period = now_us - previous_us;

        if frame_index == 1 {
            self.average_us = period;
            self.min_us = period;
            self.max_us = period;
        } else {
            self.min_us = self.min_us.min(period);
            self.max_us = self.max_us.max(period);
            let n = frame_index as u128;
            self.average_us = ((self.average_us as u128 * n + period as u128) / (n + 1)) as u64;
        }

        trace!(
            "frame {}: period={}us avg={}us",
            frame_index,
            period,
            self.average_us
        );

        self.previous_us = Some(now_us);
        self.next_index += 1;
        Ok(self.average_us)
    }

    /// Record a dequeued buffer's capture timestamp
    pub fn observe_buffer(&mut self, frame_index: u64, buffer: &DequeuedBuffer) -> Result<u64> {
        self.observe(frame_index, buffer.timestamp)
    }

    /// Statistics, once at least one period has been measured
    pub fn stats(&self) -> Option<FrameTimingStats> {
        if self.next_index < 2 {
            return None;
        }
        Some(FrameTimingStats {
            average_us: self.average_us,
            min_us: self.min_us,
            max_us: self.max_us,
            frames: self.next_index,
        })
    }

    /// Frame rate implied by the average period
    pub fn fps(&self) -> Option<f64> {
        self.stats().map(|s| s.fps())
    }

    /// Frames observed so far
    pub fn frames_observed(&self) -> u64 {
        self.next_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn us(v: u64) -> Duration {
        Duration::from_micros(v)
    }

    #[test]
    fn test_baseline_returns_zero() {
        let mut timing = FrameTimingTracker::new();
        assert_eq!(timing.observe(0, us(5_000)).unwrap(), 0);
        assert!(timing.stats().is_none());
        assert_eq!(timing.frames_observed(), 1);
    }

    #[test]
    fn test_running_average() {
        let mut timing = FrameTimingTracker::new();
        timing.observe(0, us(0)).unwrap();
        assert_eq!(timing.observe(1, us(1_000)).unwrap(), 1_000);
        // (1000 * 2 + 2000) / 3
        assert_eq!(timing.observe(2, us(3_000)).unwrap(), 1_333);

        let stats = timing.stats().unwrap();
        assert_eq!(stats.min_us, 1_000);
        assert_eq!(stats.max_us, 2_000);
        assert_eq!(stats.frames, 3);
    }

    #[test]
    fn test_out_of_order_index_rejected() {
        let mut timing = FrameTimingTracker::new();
        assert!(matches!(
            timing.observe(1, us(0)),
            Err(CaptureError::InvalidArgument(_))
        ));

        timing.observe(0, us(0)).unwrap();
        timing.observe(1, us(1_000)).unwrap();
        assert!(timing.observe(3, us(2_000)).is_err());
        assert!(timing.observe(1, us(2_000)).is_err());

        // State untouched
        assert_eq!(timing.frames_observed(), 2);
        assert_eq!(timing.observe(2, us(2_000)).unwrap(), 1_000);
    }

    #[test]
    fn test_backwards_timestamp_rejected() {
        let mut timing = FrameTimingTracker::new();
        timing.observe(0, us(10_000)).unwrap();
        assert!(timing.observe(1, us(9_000)).is_err());
        assert_eq!(timing.observe(1, us(10_500)).unwrap(), 500);
    }

    #[test]
    fn test_fps() {
        let mut timing = FrameTimingTracker::new();
        assert!(timing.fps().is_none());
        timing.observe(0, us(0)).unwrap();
        timing.observe(1, us(40_000)).unwrap();
        assert!((timing.fps().unwrap() - 25.0).abs() < f64::EPSILON);
    }
}
