//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use camera_pipeline::{CaptureEvent, Orchestrator, PipelineConfig};
use std::time::Duration;

/// Upper bound for waiting on pipeline results
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Small frames and short waits so a session finishes in milliseconds
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.sensor.frame_duration_ms = 2;
    config.sensor.control_delay = 1;
    config.stages.pop_timeout_ms = 10;
    config.selector.retry_interval_ms = 20;
    config.monitor.enabled = false;
    config
}

/// Every pool counts each buffer exactly once, and the last flush or close
/// reclaimed nothing
pub fn assert_no_leaks(device: &Orchestrator) {
    let stats = device.stats();
    assert_eq!(stats.buffers_leaked, 0, "pools reported leaked buffers");
    for pool in &stats.pools {
        assert_eq!(
            pool.free + pool.in_flight,
            pool.allocated,
            "pool {:?} lost track of buffers",
            pool.kind
        );
        assert_eq!(pool.double_releases, 0, "pool {:?} saw double releases", pool.kind);
    }
}

/// Index of the first event matching `pred`
pub fn position(events: &[CaptureEvent], pred: impl Fn(&CaptureEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

/// Frame ids of terminal events, in delivery order
pub fn terminal_order(events: &[CaptureEvent]) -> Vec<u32> {
    events
        .iter()
        .filter(|e| e.is_terminal())
        .map(|e| e.frame_id())
        .collect()
}

/// Check the per-request callback order: shutter, partial metadata, buffers,
/// then final metadata
pub fn assert_request_sequence(events: &[CaptureEvent], frame_id: u32) {
    let mine: Vec<&CaptureEvent> = events.iter().filter(|e| e.frame_id() == frame_id).collect();
    let rank = |e: &CaptureEvent| match e {
        CaptureEvent::Shutter { .. } => 0,
        CaptureEvent::PartialMetadata { .. } => 1,
        CaptureEvent::BufferReady { .. } | CaptureEvent::Error { .. } => 2,
        CaptureEvent::FinalMetadata { .. } => 3,
    };
    for pair in mine.windows(2) {
        assert!(
            rank(pair[0]) <= rank(pair[1]),
            "request {} out of order: {:?} before {:?}",
            frame_id,
            pair[0],
            pair[1]
        );
    }
}
