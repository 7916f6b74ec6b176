//! Capture Daemon
//!
//! Runs a registered [`CaptureSession`] on a blocking worker thread and
//! delivers a copy of every filled buffer over a bounded channel. Each buffer
//! is re-queued as soon as it has been copied, so a slow consumer costs
//! dropped frames rather than a stalled driver.

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::video::device::CaptureDevice;
use crate::video::frame::{CapturedFrame, PixelFormat};
use crate::video::session::{CaptureSession, SessionState};
use crate::video::timing::FrameTimingTracker;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for the capture daemon
#[derive(Debug, Clone)]
pub struct CaptureDaemonConfig {
    /// Pixel format stamped on delivered frames
    pub pixel_format: PixelFormat,
    /// Frame queue size (larger = more latency, smaller = more drops)
    pub queue_size: usize,
    /// Stop after this many frames
    pub frame_limit: Option<u64>,
}

impl Default for CaptureDaemonConfig {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::UYVY,
            queue_size: 8,
            frame_limit: None,
        }
    }
}

impl From<&CaptureConfig> for CaptureDaemonConfig {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            pixel_format: config.pixel_format,
            queue_size: config.channel_capacity,
            frame_limit: None,
        }
    }
}

/// Capture daemon statistics
#[derive(Debug, Clone, Default)]
pub struct DaemonStats {
    /// Buffers dequeued from the driver
    pub frames_captured: u64,
    /// Frames handed to the channel
    pub frames_delivered: u64,
    /// Frames dropped (queue full)
    pub frames_dropped: u64,
    /// Dequeues that timed out
    pub timeouts: u64,
    /// Average inter-frame period in microseconds
    pub average_period_us: u64,
    /// Shortest inter-frame period
    pub min_period_us: u64,
    /// Longest inter-frame period
    pub max_period_us: u64,
}

/// Inner statistics with atomic counters
#[derive(Default)]
struct DaemonStatsInner {
    frames_captured: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    timeouts: AtomicU64,
    average_period_us: AtomicU64,
    min_period_us: AtomicU64,
    max_period_us: AtomicU64,
}

impl DaemonStatsInner {
    fn to_stats(&self) -> DaemonStats {
        DaemonStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            average_period_us: self.average_period_us.load(Ordering::Relaxed),
            min_period_us: self.min_period_us.load(Ordering::Relaxed),
            max_period_us: self.max_period_us.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.frames_captured,
            &self.frames_delivered,
            &self.frames_dropped,
            &self.timeouts,
            &self.average_period_us,
            &self.min_period_us,
            &self.max_period_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

type WorkerExit<D> = (CaptureSession<D>, Result<()>);

/// Capture daemon pumping one session
pub struct CaptureDaemon<D: CaptureDevice + 'static> {
    /// Configuration
    config: CaptureDaemonConfig,
    /// Running state
    running: Arc<AtomicBool>,
    /// Statistics
    stats: Arc<DaemonStatsInner>,
    /// Session, while the worker does not hold it
    session: Option<CaptureSession<D>>,
    /// Capture worker
    worker: Option<JoinHandle<WorkerExit<D>>>,
}

impl<D: CaptureDevice + 'static> CaptureDaemon<D> {
    /// Create a daemon around a session with registered buffers
    pub fn new(session: CaptureSession<D>, config: CaptureDaemonConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(DaemonStatsInner::default()),
            session: Some(session),
            worker: None,
        }
    }

    /// Check if the worker is capturing
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Get current statistics
    pub fn stats(&self) -> DaemonStats {
        self.stats.to_stats()
    }

    /// The session, while the daemon is stopped
    pub fn session(&self) -> Option<&CaptureSession<D>> {
        self.session.as_ref()
    }

    /// Give the session back, while the daemon is stopped
    pub fn into_session(mut self) -> Option<CaptureSession<D>> {
        self.session.take()
    }

    /// Start capturing
    ///
    /// Starts streaming if the session is not already streaming, and returns
    /// the receiving end of the frame channel.
    pub async fn start(&mut self) -> Result<mpsc::Receiver<CapturedFrame>> {
        if self.worker.is_some() {
            return Err(CaptureError::invalid_state("start", "daemon running"));
        }

        let mut session = self
            .session
            .take()
            .ok_or_else(|| CaptureError::invalid_state("start", "daemon without session"))?;

        if session.state() == SessionState::BuffersRegistered {
            if let Err(e) = session.start_streaming() {
                self.session = Some(session);
                return Err(e);
            }
        } else if session.state() != SessionState::Streaming {
            let state = session.state();
            self.session = Some(session);
            return Err(CaptureError::invalid_state("start", state));
        }

        info!(
            "Starting capture daemon: {} buffers, format {} (queue_size={})",
            session.buffer_count(),
            self.config.pixel_format,
            self.config.queue_size
        );

        let (tx, rx) = mpsc::channel(self.config.queue_size.max(1));

        self.stats.reset();
        self.running.store(true, Ordering::Relaxed);

        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);

        self.worker = Some(tokio::task::spawn_blocking(move || {
            Self::capture_loop(session, config, running, stats, tx)
        }));

        Ok(rx)
    }

    /// Stop capturing and take the session back
    ///
    /// Returns the error that ended the worker, if any.
    pub async fn stop(&mut self) -> Result<()> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| CaptureError::invalid_state("stop", "daemon not running"))?;

        info!("Stopping capture daemon");
        self.running.store(false, Ordering::Relaxed);

        let (session, result) = worker
            .await
            .map_err(|e| CaptureError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        self.session = Some(session);

        let stats = self.stats();
        info!(
            "Daemon stats: captured={}, delivered={}, dropped={}, timeouts={}, avg_period={}us",
            stats.frames_captured,
            stats.frames_delivered,
            stats.frames_dropped,
            stats.timeouts,
            stats.average_period_us
        );

        result
    }

    /// Main capture loop
    ///
    /// Runs until stopped, the frame limit is reached, the receiver goes
    /// away, or the driver reports an error. Timeouts are counted and
    /// retried; nothing else is.
    fn capture_loop(
        mut session: CaptureSession<D>,
        config: CaptureDaemonConfig,
        running: Arc<AtomicBool>,
        stats: Arc<DaemonStatsInner>,
        tx: mpsc::Sender<CapturedFrame>,
    ) -> WorkerExit<D> {
        let mut timing = FrameTimingTracker::new();
        let mut captured = 0u64;
        let mut result = Ok(());

        info!("Capture daemon processing started");

        while running.load(Ordering::Relaxed) {
            let buffer = match session.dequeue() {
                Ok(buffer) => buffer,
                Err(CaptureError::Timeout) => {
                    stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!("Dequeue timed out");
                    continue;
                }
                Err(e) => {
                    error!("Capture daemon dequeue error: {}", e);
                    result = Err(e);
                    break;
                }
            };

            stats.frames_captured.fetch_add(1, Ordering::Relaxed);
            captured += 1;

            if let Err(e) = timing.observe_buffer(timing.frames_observed(), &buffer) {
                // The tracker only accepts monotonic timestamps; restart it
                // with this frame as the new baseline.
                warn!("Frame timing restarted: {}", e);
                timing = FrameTimingTracker::new();
                if let Err(e) = timing.observe_buffer(0, &buffer) {
                    warn!("Frame timing skipped: {}", e);
                }
            }
            if let Some(t) = timing.stats() {
                stats.average_period_us.store(t.average_us, Ordering::Relaxed);
                stats.min_period_us.store(t.min_us, Ordering::Relaxed);
                stats.max_period_us.store(t.max_us, Ordering::Relaxed);
            }

            let frame = session
                .frame(buffer.index)
                .map(|view| view.to_owned_frame(config.pixel_format));

            let mut receiver_gone = false;
            match frame {
                Ok(frame) => match tx.try_send(frame) {
                    Ok(()) => {
                        stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => {
                        stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("Frame dropped due to full queue");
                    }
                    Err(TrySendError::Closed(_)) => {
                        info!("Frame receiver closed");
                        receiver_gone = true;
                    }
                },
                Err(e) => warn!("Failed to read buffer {}: {}", buffer.index, e),
            }

            if let Err(e) = session.enqueue(buffer.index) {
                error!("Failed to re-queue buffer {}: {}", buffer.index, e);
                result = Err(e);
                break;
            }

            if receiver_gone || config.frame_limit.is_some_and(|limit| captured >= limit) {
                break;
            }
        }

        running.store(false, Ordering::Relaxed);

        if session.state() == SessionState::Streaming {
            if let Err(e) = session.stop_streaming() {
                error!("Failed to stop streaming: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        info!("Capture daemon processing stopped");
        (session, result)
    }
}

impl<D: CaptureDevice + 'static> Drop for CaptureDaemon<D> {
    fn drop(&mut self) {
        // A detached worker sees this on its next dequeue and drops the
        // session, which unregisters and frees the buffers.
        if self.worker.is_some() {
            debug!("Capture daemon dropped while running, signalling worker");
        }
        self.running.store(false, Ordering::Relaxed);
    }
}
