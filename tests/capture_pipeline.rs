//! Capture Pipeline Tests
//!
//! End-to-end runs over the simulated driver:
//! - Full allocate → register → stream → dequeue/enqueue → teardown cycle
//! - Buffer count negotiation failures
//! - Frame timing from driver timestamps
//! - Capture daemon delivery


use capture_dma_core::memory::BufferPool;
use capture_dma_core::video::{
    BufferOwner, CaptureDaemon, CaptureDaemonConfig, CaptureSession, FrameTimingTracker,
    PixelFormat, SessionState, SimulatedDevice,
};
use capture_dma_core::{CaptureConfig, CaptureError};
use capture_test_utils::*;
use std::time::Duration;

/// Test the full capture cycle
#[test]
fn test_end_to_end_capture_cycle() {
    let allocator = host_allocator();
    let pool = BufferPool::create(&allocator, TEST_BUFFER_SIZE, 4).unwrap();

    let mut session = CaptureSession::new(simulated_device());
    session.register_buffers(pool, TEST_WIDTH, TEST_HEIGHT).unwrap();
    session.start_streaming().unwrap();

    let buffer = session.dequeue().unwrap();
    assert!(buffer.index < 4);
    assert!(buffer.bytes_used <= TEST_BUFFER_SIZE);

    let frame = session.frame(buffer.index).unwrap();
    assert_eq!((frame.width, frame.height), (TEST_WIDTH, TEST_HEIGHT));
    assert_eq!(frame.bytes_used(), buffer.bytes_used);

    session.enqueue(buffer.index).unwrap();
    session.stop_streaming().unwrap();

    let pool = session.unregister_buffers().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    pool.destroy().unwrap();
    assert_eq!(allocator.outstanding(), 0);
}

/// Test buffers cycle through the driver in order
#[test]
fn test_buffers_cycle_round_robin() {
    let allocator = host_allocator();
    let pool = BufferPool::create(&allocator, TEST_BUFFER_SIZE, 4).unwrap();
    let mut session = CaptureSession::new(simulated_device());
    session.register_buffers(pool, TEST_WIDTH, TEST_HEIGHT).unwrap();
    session.start_streaming().unwrap();

    let mut indices = Vec::new();
    for expected_seq in 0..12u32 {
        let buffer = session.dequeue().unwrap();
        assert_eq!(buffer.sequence, expected_seq);
        assert_eq!(session.owner(buffer.index), Some(BufferOwner::Client));

        // The simulated driver stamps each frame with its sequence number
        let frame = session.frame(buffer.index).unwrap();
        assert!(frame.data.iter().all(|&b| b == expected_seq as u8));

        indices.push(buffer.index);
        session.enqueue(buffer.index).unwrap();
    }

    assert_eq!(indices, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3]);
}

/// Test holding every buffer starves the driver
#[test]
fn test_holding_all_buffers_times_out() {
    let allocator = host_allocator();
    let pool = BufferPool::create(&allocator, TEST_BUFFER_SIZE, 2).unwrap();
    let mut session = CaptureSession::new(simulated_device());
    session.register_buffers(pool, TEST_WIDTH, TEST_HEIGHT).unwrap();
    session.start_streaming().unwrap();

    let a = session.dequeue().unwrap();
    let b = session.dequeue().unwrap();
    assert_eq!(session.buffers_held_by_driver(), 0);

    let err = session.dequeue_timeout(Some(Duration::from_millis(10))).unwrap_err();
    assert!(matches!(err, CaptureError::Timeout));
    assert!(err.is_recoverable());

    session.enqueue(a.index).unwrap();
    session.enqueue(b.index).unwrap();
    assert!(session.dequeue().is_ok());
}

/// Test any buffer count mismatch is fatal
#[test]
fn test_buffer_count_mismatch() {
    for granted in [1u32, 3, 8] {
        let allocator = host_allocator();
        let pool = BufferPool::create(&allocator, TEST_BUFFER_SIZE, 4).unwrap();
        let mut session = CaptureSession::new(simulated_device().with_granted_count(granted));

        let err = session
            .register_buffers(pool, TEST_WIDTH, TEST_HEIGHT)
            .unwrap_err();
        match err.error() {
            CaptureError::UnsupportedBufferCount {
                requested,
                granted: g,
            } => {
                assert_eq!(*requested, 4);
                assert_eq!(*g, granted);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.device().allocated_buffers(), 0);

        err.into_pool().unwrap().destroy().unwrap();
        assert_eq!(allocator.outstanding(), 0);
    }
}

/// Test driver cap below the pool size
#[test]
fn test_driver_buffer_limit() {
    let allocator = host_allocator();
    let pool = BufferPool::create(&allocator, TEST_BUFFER_SIZE, 6).unwrap();
    let mut session = CaptureSession::new(simulated_device().with_max_buffers(4));

    let err = session
        .register_buffers(pool, TEST_WIDTH, TEST_HEIGHT)
        .unwrap_err();
    assert!(matches!(
        err.error(),
        CaptureError::UnsupportedBufferCount {
            requested: 6,
            granted: 4
        }
    ));
}

/// Test buffer sizing from the negotiated line pitch
#[test]
fn test_pool_sized_from_line_pitch() {
    let config = CaptureConfig {
        width: 720,
        height: 576,
        ..CaptureConfig::default()
    };
    let device = SimulatedDevice::new(720, 576, PixelFormat::UYVY).with_line_pitch(1472);
    let mut session = CaptureSession::with_timeout(device, config.dequeue_timeout());

    let pitch = session.query_line_pitch().unwrap();
    assert_eq!(pitch, 1472);
    let size = config.buffer_size_for_pitch(pitch);
    assert_eq!(size, 1472 * 576);

    let allocator = host_allocator();
    let pool = BufferPool::create(&allocator, size, config.buffer_count).unwrap();
    session.register_buffers(pool, config.width, config.height).unwrap();
    session.start_streaming().unwrap();

    let buffer = session.dequeue().unwrap();
    assert_eq!(buffer.bytes_used, 1472 * 576);
}

/// Test frame timing from driver timestamps
#[test]
fn test_frame_timing_from_capture() {
    let allocator = host_allocator();
    let pool = BufferPool::create(&allocator, TEST_BUFFER_SIZE, 3).unwrap();
    let device = simulated_device().with_frame_interval(Duration::from_micros(40_000));
    let mut session = CaptureSession::new(device);
    session.register_buffers(pool, TEST_WIDTH, TEST_HEIGHT).unwrap();
    session.start_streaming().unwrap();

    let mut timing = FrameTimingTracker::new();
    for frame_index in 0..25u64 {
        let buffer = session.dequeue().unwrap();
        timing.observe_buffer(frame_index, &buffer).unwrap();
        session.enqueue(buffer.index).unwrap();
    }

    let stats = timing.stats().unwrap();
    assert_eq!(stats.average_us, 40_000);
    assert_eq!(stats.min_us, 40_000);
    assert_eq!(stats.max_us, 40_000);
    assert_eq!(stats.frames, 25);
}

/// Test the documented averaging sequence
#[test]
fn test_frame_timing_known_sequence() {
    let mut timing = FrameTimingTracker::new();
    assert_eq!(timing.observe(0, Duration::from_micros(100)).unwrap(), 0);
    assert_eq!(timing.observe(1, Duration::from_micros(1_100)).unwrap(), 1_000);
    assert_eq!(timing.observe(2, Duration::from_micros(3_100)).unwrap(), 1_333);

    let stats = timing.stats().unwrap();
    assert_eq!(stats.max_us, 2_000);
    assert_eq!(stats.min_us, 1_000);
}

/// Test the daemon pumps a registered session
#[tokio::test]
async fn test_daemon_pipeline() {
    let allocator = host_allocator();
    let pool = BufferPool::create(&allocator, TEST_BUFFER_SIZE, 4).unwrap();
    let mut session = CaptureSession::new(simulated_device());
    session.register_buffers(pool, TEST_WIDTH, TEST_HEIGHT).unwrap();

    let config = CaptureDaemonConfig {
        queue_size: 64,
        frame_limit: Some(30),
        ..CaptureDaemonConfig::from(&CaptureConfig::vga())
    };
    let mut daemon = CaptureDaemon::new(session, config);
    let mut rx = daemon.start().await.unwrap();

    let mut received = 0;
    while let Some(frame) = rx.recv().await {
        assert_eq!(frame.format, PixelFormat::UYVY);
        assert_eq!(frame.data.len(), TEST_BUFFER_SIZE);
        received += 1;
    }
    daemon.stop().await.unwrap();

    assert_eq!(received, 30);
    assert_eq!(daemon.stats().frames_captured, 30);

    let mut session = daemon.into_session().unwrap();
    assert_eq!(session.state(), SessionState::BuffersRegistered);
    assert_eq!(session.buffers_held_by_driver(), 0);

    session.unregister_buffers().unwrap().destroy().unwrap();
    assert_eq!(allocator.outstanding(), 0);
}
