//! Integration tests for flush and teardown
//!
//! Every accepted request must get exactly one terminal callback across a
//! flush, and every pool must be whole afterwards.

mod common;

use camera_pipeline::pipeline::nodes::StageRegistry;
use camera_pipeline::pipeline::{StageContext, StagePlugin};
use camera_pipeline::{CaptureEvent, DeviceState, ErrorKind, Orchestrator, PipelineConfig};
use common::builders::{RequestBuilder, StreamSetBuilder};
use common::mock_helpers::RecordingSink;
use common::{assert_no_leaks, assert_request_sequence, fast_config, terminal_order, test_timeout};
use serial_test::serial;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Slow enough that submitted requests are still queued when flush runs
fn slow_config() -> PipelineConfig {
    let mut config = fast_config();
    config.sensor.frame_duration_ms = 20;
    config.sensor.control_delay = 0;
    config
}

fn terminals_per_request(events: &[CaptureEvent]) -> BTreeMap<u32, usize> {
    let mut counts = BTreeMap::new();
    for event in events.iter().filter(|e| e.is_terminal()) {
        *counts.entry(event.frame_id()).or_insert(0) += 1;
    }
    counts
}

/// Scaler that holds frames with caller outputs long enough to be caught in
/// flight
struct SlowScaler;

impl StagePlugin for SlowScaler {
    fn name(&self) -> &str {
        "SlowScaler"
    }

    fn process(&mut self, ctx: &mut StageContext) -> camera_pipeline::Result<()> {
        if !ctx.job.outputs.is_empty() {
            std::thread::sleep(Duration::from_millis(150));
        }
        ctx.metadata.set("scaler.outputs", ctx.job.outputs.len() as i64);
        Ok(())
    }
}

fn open_with_slow_scaler(sink: Arc<RecordingSink>) -> Orchestrator {
    let mut config = fast_config();
    config.sensor.frame_duration_ms = 40;
    config.sensor.control_delay = 0;
    config.stages.handlers.scaler = "slow_scaler".into();

    let mut registry = StageRegistry::with_builtins();
    registry.register_plugin("slow_scaler", || Box::new(SlowScaler));
    Orchestrator::open_with_registry(config, sink, registry).unwrap()
}

#[test]
#[serial]
fn test_flush_with_queued_and_in_flight_requests() {
    let sink = RecordingSink::new();
    let device = open_with_slow_scaler(sink.clone());
    device
        .configure_streams(&StreamSetBuilder::new().preview().capture().build())
        .unwrap();

    for round in 0..5u32 {
        let first = round * 10 + 1;
        let (second, third) = (first + 1, first + 2);

        device
            .submit_request(RequestBuilder::new(first).preview().capture().build())
            .unwrap();
        assert!(
            sink.wait_for_event(test_timeout(), |e| {
                matches!(e, CaptureEvent::Shutter { frame_id, .. } if *frame_id == first)
            }),
            "round {}: no shutter for request {}",
            round,
            first
        );
        // Let the scheduler finish the shot that carried the shutter
        std::thread::sleep(Duration::from_millis(5));

        device
            .submit_request(RequestBuilder::new(second).preview().build())
            .unwrap();
        device
            .submit_request(RequestBuilder::new(third).capture().build())
            .unwrap();
        assert_eq!(device.stats().queued_requests, 2, "round {}", round);
        assert!(
            sink.for_request(first).iter().all(|e| !e.is_terminal()),
            "round {}: request {} finished before flush",
            round,
            first
        );

        device.flush().unwrap();
        assert_eq!(device.state(), DeviceState::Configured);

        // Terminal callbacks are delivered before flush returns
        let events = sink.events();
        let terminals = terminals_per_request(&events);
        for number in [first, second, third] {
            assert_eq!(terminals.get(&number), Some(&1), "round {}: {:?}", round, terminals);
            assert_request_sequence(&events, number);
        }
        let order: Vec<u32> = terminal_order(&events)
            .into_iter()
            .filter(|n| *n >= first)
            .collect();
        assert_eq!(order, vec![first, second, third]);

        let stats = device.stats();
        assert_eq!(stats.frames_in_flight, 0);
        assert_eq!(stats.pending_requests, 0);
        assert_no_leaks(&device);
        assert!(device.context().pools_all_free());
    }
    device.close().unwrap();
}

#[test]
#[serial]
fn test_flushed_requests_return_their_buffers() {
    let sink = RecordingSink::new();
    let device = Orchestrator::open(slow_config(), sink.clone()).unwrap();
    device
        .configure_streams(&StreamSetBuilder::new().preview().capture().build())
        .unwrap();

    device
        .submit_request(RequestBuilder::new(1).preview().build())
        .unwrap();
    device
        .submit_request(RequestBuilder::new(2).preview().capture().build())
        .unwrap();
    device
        .submit_request(RequestBuilder::new(3).capture().build())
        .unwrap();
    device.flush().unwrap();

    let events = sink.events();
    for (number, outputs) in [(1u32, 1usize), (2, 2), (3, 1)] {
        let returned = events
            .iter()
            .filter(|e| matches!(e, CaptureEvent::BufferReady { frame_id, .. } if *frame_id == number))
            .count();
        assert_eq!(returned, outputs, "request {} buffers", number);
    }
    assert_eq!(terminals_per_request(&events).len(), 3);
    assert_no_leaks(&device);
    device.close().unwrap();
}

#[test]
#[serial]
fn test_flush_when_idle() {
    let sink = RecordingSink::new();
    let device = Orchestrator::open(fast_config(), sink.clone()).unwrap();

    // Nothing configured yet
    device.flush().unwrap();
    assert_eq!(device.state(), DeviceState::Initialized);

    device
        .configure_streams(&StreamSetBuilder::new().preview().build())
        .unwrap();
    device.flush().unwrap();
    assert_eq!(device.state(), DeviceState::Configured);
    assert!(sink.events().is_empty());
    device.close().unwrap();
}

#[test]
#[serial]
fn test_streaming_resumes_after_flush() {
    let sink = RecordingSink::new();
    let device = Orchestrator::open(fast_config(), sink.clone()).unwrap();
    device
        .configure_streams(&StreamSetBuilder::new().preview().build())
        .unwrap();

    device
        .submit_request(RequestBuilder::new(1).preview().build())
        .unwrap();
    device.flush().unwrap();
    assert_eq!(sink.terminal_count(), 1);

    device
        .submit_request(RequestBuilder::new(2).preview().build())
        .unwrap();
    assert!(sink.wait_for_terminals(2, test_timeout()));
    let second = sink.for_request(2);
    assert!(second
        .iter()
        .any(|e| matches!(e, CaptureEvent::FinalMetadata { .. })));
    device.close().unwrap();
}

#[test]
#[serial]
fn test_close_terminates_pending_requests() {
    let sink = RecordingSink::new();
    let device = Orchestrator::open(slow_config(), sink.clone()).unwrap();
    device
        .configure_streams(&StreamSetBuilder::new().preview().build())
        .unwrap();
    for number in 1..=4 {
        device
            .submit_request(RequestBuilder::new(number).preview().build())
            .unwrap();
    }
    device.close().unwrap();

    let events = sink.events();
    assert_eq!(terminals_per_request(&events).len(), 4);
    // Flushed requests that never ran report a request error
    assert!(events.iter().any(|e| matches!(
        e,
        CaptureEvent::Error {
            kind: ErrorKind::Request,
            ..
        }
    )));
    assert!(device
        .submit_request(RequestBuilder::new(5).preview().build())
        .is_err());
}

#[test]
#[serial]
fn test_drop_closes_device() {
    let sink = RecordingSink::new();
    {
        let device = Orchestrator::open(slow_config(), sink.clone()).unwrap();
        device
            .configure_streams(&StreamSetBuilder::new().preview().build())
            .unwrap();
        device
            .submit_request(RequestBuilder::new(1).preview().build())
            .unwrap();
    }
    assert_eq!(sink.terminal_count(), 1);
}
