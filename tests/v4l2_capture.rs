//! V4L2 Capture Tests
//!
//! Tests against a real capture driver:
//! - Device opening and capability checks
//! - Input enumeration
//! - User-pointer buffer registration and a short capture
//!
//! Note: These tests need a capture device that supports user-pointer
//! streaming (e.g. `sudo modprobe vivid`). Set CAPTURE_TEST_DEVICE to pick
//! the node; tests skip gracefully when it is missing.

#![cfg(target_os = "linux")]


use capture_dma_core::memory::BufferPool;
use capture_dma_core::video::{
    find_capture_devices, CaptureSession, FrameTimingTracker, SessionState, V4l2CaptureDevice,
};
use capture_dma_core::{CaptureConfig, CaptureError};
use capture_test_utils::*;
use std::time::Duration;

fn open_test_device() -> Option<V4l2CaptureDevice> {
    if !is_capture_device_available() {
        println!("Skipping test: no capture device at {}", get_test_device_path().display());
        return None;
    }

    match V4l2CaptureDevice::open(get_test_device_path()) {
        Ok(device) => Some(device),
        Err(e) => {
            println!("Skipping test: {}", e);
            None
        }
    }
}

/// Test opening a missing device node
#[test]
fn test_open_missing_device() {
    let result = V4l2CaptureDevice::open("/dev/video-missing-node");
    assert!(matches!(result, Err(CaptureError::Device { op: "open", .. })));
}

/// Test device discovery returns openable nodes
#[test]
fn test_find_capture_devices() {
    for path in find_capture_devices() {
        assert!(path.exists());
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("video")));
    }
}

/// Test input enumeration ends cleanly
#[test]
fn test_enumerate_inputs() {
    let Some(device) = open_test_device() else {
        return;
    };
    let session = CaptureSession::new(device);

    let inputs: Vec<_> = session.enumerate_inputs().collect::<Result<_, _>>().unwrap();
    for (i, input) in inputs.iter().enumerate() {
        assert_eq!(input.index as usize, i);
        println!("Input {}: {} ({})", input.index, input.name, input.input_type);
    }
}

/// Test a short user-pointer capture
#[test]
fn test_userptr_capture() {
    let Some(device) = open_test_device() else {
        return;
    };

    let config = CaptureConfig::default();
    let mut session = CaptureSession::with_timeout(device, Some(Duration::from_secs(2)));

    let format = session.capture_format().unwrap();
    let size = config.buffer_size_for_pitch(format.bytes_per_line).max(format.size_image as usize);

    let allocator = host_allocator();
    let pool = BufferPool::create(&allocator, size, config.buffer_count).unwrap();

    match session.register_buffers(pool, format.width, format.height) {
        Ok(()) => {}
        Err(e) => {
            // Drivers without USERPTR support reject REQBUFS
            println!("Skipping test: {}", e);
            return;
        }
    }
    assert_eq!(session.state(), SessionState::BuffersRegistered);

    session.start_streaming().unwrap();

    let mut timing = FrameTimingTracker::new();
    for frame_index in 0..10u64 {
        let buffer = session.dequeue().unwrap();
        assert!(buffer.bytes_used <= size);
        timing.observe_buffer(frame_index, &buffer).unwrap();
        session.enqueue(buffer.index).unwrap();
    }
    println!("Average frame period: {:?}us", timing.stats().map(|s| s.average_us));

    session.stop_streaming().unwrap();
    session.unregister_buffers().unwrap().destroy().unwrap();
    assert_eq!(allocator.outstanding(), 0);
}
