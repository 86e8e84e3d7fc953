//! Integration tests for the request lifecycle
//!
//! These tests drive a simulated device end to end:
//! - Preview requests through sensor, 3A, ISP and scaler
//! - Still capture from the hold list and from a caller input buffer
//! - Callback ordering within and across requests
//! - Watchdog teardown

mod common;

use camera_pipeline::pipeline::{StageContext, StagePlugin};
use camera_pipeline::pipeline::nodes::StageRegistry;
use camera_pipeline::{
    BufferHandle, BufferStatus, CameraError, CaptureEvent, DeviceState, ErrorKind, Orchestrator,
    Request, RequestTemplate, StreamId,
};
use common::builders::{RequestBuilder, StreamSetBuilder, CAPTURE, INPUT, PREVIEW};
use common::mock_helpers::{buffers_of, RecordingSink};
use common::{assert_no_leaks, assert_request_sequence, fast_config, terminal_order, test_timeout};
use serial_test::serial;
use std::time::{Duration, Instant};

#[test]
#[serial]
fn test_three_preview_requests_complete_in_order() {
    let sink = RecordingSink::new();
    let device = Orchestrator::open(fast_config(), sink.clone()).unwrap();
    device
        .configure_streams(&StreamSetBuilder::new().preview().build())
        .unwrap();

    for number in 1..=3 {
        device
            .submit_request(RequestBuilder::new(number).preview().build())
            .unwrap();
    }
    assert!(sink.wait_for_terminals(3, test_timeout()), "requests did not finish");
    assert_eq!(device.state(), DeviceState::Run);

    let events = sink.events();
    assert_eq!(terminal_order(&events), vec![1, 2, 3]);
    for number in 1..=3 {
        let mine = sink.for_request(number);
        assert!(
            mine.iter().any(|e| matches!(e, CaptureEvent::FinalMetadata { .. })),
            "request {} has no final metadata",
            number
        );
        assert_eq!(
            buffers_of(&events, number),
            vec![(StreamId(PREVIEW), BufferHandle(number as u64 * 10), BufferStatus::Ok)]
        );
        assert_request_sequence(&events, number);
    }

    // Shutters follow submission order too
    let shutters: Vec<u32> = events
        .iter()
        .filter(|e| matches!(e, CaptureEvent::Shutter { .. }))
        .map(|e| e.frame_id())
        .collect();
    assert_eq!(shutters, vec![1, 2, 3]);

    device.flush().unwrap();
    assert_no_leaks(&device);
    assert!(device.context().pools_all_free());
    device.close().unwrap();
}

#[test]
#[serial]
fn test_final_metadata_carries_request_and_sensor_results() {
    let sink = RecordingSink::new();
    let device = Orchestrator::open(fast_config(), sink.clone()).unwrap();
    device
        .configure_streams(&StreamSetBuilder::new().preview().build())
        .unwrap();
    device
        .submit_request(
            RequestBuilder::new(7)
                .preview()
                .template(RequestTemplate::Manual)
                .build(),
        )
        .unwrap();
    assert!(sink.wait_for_terminals(1, test_timeout()));

    let events = sink.for_request(7);
    let final_meta = events
        .iter()
        .find_map(|e| match e {
            CaptureEvent::FinalMetadata { metadata, .. } => Some(metadata.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(final_meta.get_int("request.frame_number"), Some(7));
    assert!(final_meta.contains("request.pipeline_depth"));
    assert_eq!(final_meta.get_int("sensor.exposure_time"), Some(16_666_666));
    assert!(final_meta.contains("sensor.timestamp"));

    let shutter_ts = events.iter().find_map(|e| match e {
        CaptureEvent::Shutter { timestamp_ns, .. } => Some(*timestamp_ns),
        _ => None,
    });
    assert_eq!(
        shutter_ts.map(|ts| ts as i64),
        final_meta.get_int("sensor.timestamp")
    );
    device.close().unwrap();
}

#[test]
#[serial]
fn test_preview_with_still_capture() {
    let sink = RecordingSink::new();
    let device = Orchestrator::open(fast_config(), sink.clone()).unwrap();
    device
        .configure_streams(&StreamSetBuilder::new().preview().capture().build())
        .unwrap();

    device
        .submit_request(RequestBuilder::new(1).preview().build())
        .unwrap();
    device
        .submit_request(
            RequestBuilder::new(2)
                .preview()
                .capture()
                .template(RequestTemplate::StillCapture)
                .build(),
        )
        .unwrap();
    device
        .submit_request(RequestBuilder::new(3).preview().build())
        .unwrap();
    assert!(sink.wait_for_terminals(3, test_timeout()));

    let events = sink.events();
    assert_eq!(terminal_order(&events), vec![1, 2, 3]);
    let mut still = buffers_of(&events, 2);
    still.sort_by_key(|(stream, _, _)| stream.0);
    assert_eq!(
        still,
        vec![
            (StreamId(PREVIEW), BufferHandle(20), BufferStatus::Ok),
            (StreamId(CAPTURE), BufferHandle(21), BufferStatus::Ok),
        ]
    );
    let final_meta = sink.for_request(2).into_iter().find_map(|e| match e {
        CaptureEvent::FinalMetadata { metadata, .. } => Some(metadata),
        _ => None,
    });
    assert!(final_meta.unwrap().contains("jpeg.size"));
    assert_request_sequence(&events, 2);

    device.flush().unwrap();
    assert_no_leaks(&device);
    device.close().unwrap();
}

#[test]
#[serial]
fn test_capture_only_request_uses_held_raw() {
    let sink = RecordingSink::new();
    let device = Orchestrator::open(fast_config(), sink.clone()).unwrap();
    device
        .configure_streams(&StreamSetBuilder::new().preview().capture().build())
        .unwrap();

    // Stream a little so the hold list fills
    for number in 1..=3 {
        device
            .submit_request(RequestBuilder::new(number).preview().build())
            .unwrap();
    }
    assert!(sink.wait_for_terminals(3, test_timeout()));

    device
        .submit_request(RequestBuilder::new(4).capture().build())
        .unwrap();
    assert!(sink.wait_for_terminals(4, test_timeout()));

    let events = sink.for_request(4);
    assert!(matches!(events.first(), Some(CaptureEvent::Shutter { .. })));
    assert_eq!(
        buffers_of(&events, 4),
        vec![(StreamId(CAPTURE), BufferHandle(41), BufferStatus::Ok)]
    );
    assert!(matches!(events.last(), Some(CaptureEvent::FinalMetadata { .. })));
    assert!(device.stats().selector.selected >= 1);
    device.close().unwrap();
}

#[test]
#[serial]
fn test_reprocess_request_returns_input_buffer() {
    let sink = RecordingSink::new();
    let device = Orchestrator::open(fast_config(), sink.clone()).unwrap();
    device
        .configure_streams(&StreamSetBuilder::new().preview().capture().input().build())
        .unwrap();

    device
        .submit_request(RequestBuilder::new(1).capture().input().build())
        .unwrap();
    assert!(sink.wait_for_terminals(1, test_timeout()));

    let mut returned = buffers_of(&sink.events(), 1);
    returned.sort_by_key(|(stream, _, _)| stream.0);
    assert_eq!(
        returned,
        vec![
            (StreamId(CAPTURE), BufferHandle(11), BufferStatus::Ok),
            (StreamId(INPUT), BufferHandle(12), BufferStatus::Ok),
        ]
    );
    device.close().unwrap();
}

#[test]
#[serial]
fn test_invalid_requests_are_rejected_synchronously() {
    let sink = RecordingSink::new();
    let device = Orchestrator::open(fast_config(), sink.clone()).unwrap();
    device
        .configure_streams(&StreamSetBuilder::new().preview().build())
        .unwrap();

    // Unknown stream, nothing starts
    let unknown = Request::new(1).with_output(StreamId(9), BufferHandle(1));
    assert!(matches!(
        device.submit_request(unknown),
        Err(CameraError::InvalidArgument(_))
    ));
    assert_eq!(device.state(), DeviceState::Configured);

    // No outputs
    assert!(device.submit_request(Request::new(1)).is_err());

    device
        .submit_request(RequestBuilder::new(5).preview().build())
        .unwrap();
    // Frame numbers must increase
    assert!(device
        .submit_request(RequestBuilder::new(5).preview().build())
        .is_err());
    assert!(sink.wait_for_terminals(1, test_timeout()));
    assert_eq!(sink.terminal_count(), 1);
    device.close().unwrap();
}

#[test]
#[serial]
fn test_reconfigure_while_streaming() {
    let sink = RecordingSink::new();
    let device = Orchestrator::open(fast_config(), sink.clone()).unwrap();
    device
        .configure_streams(&StreamSetBuilder::new().preview().build())
        .unwrap();
    device
        .submit_request(RequestBuilder::new(1).preview().build())
        .unwrap();
    assert!(sink.wait_for_terminals(1, test_timeout()));

    device
        .configure_streams(&StreamSetBuilder::new().preview().capture().build())
        .unwrap();
    assert_eq!(device.state(), DeviceState::Configured);
    assert_eq!(device.streams().len(), 2);

    device
        .submit_request(RequestBuilder::new(2).preview().capture().build())
        .unwrap();
    assert!(sink.wait_for_terminals(2, test_timeout()));
    assert_eq!(buffers_of(&sink.events(), 2).len(), 2);
    device.close().unwrap();
}

struct FaultyIsp;

impl StagePlugin for FaultyIsp {
    fn name(&self) -> &str {
        "FaultyIsp"
    }

    fn process(&mut self, _ctx: &mut StageContext) -> camera_pipeline::Result<()> {
        Err(CameraError::HardwareWatchdog("isp bus hang".into()))
    }
}

#[test]
#[serial]
fn test_fatal_stage_error_trips_watchdog() {
    let mut config = fast_config();
    config.monitor.enabled = true;
    config.monitor.interval_ms = 10;
    config.stages.handlers.isp = "faulty_isp".into();

    let mut registry = StageRegistry::with_builtins();
    registry.register_plugin("faulty_isp", || Box::new(FaultyIsp));

    let sink = RecordingSink::new();
    let device = Orchestrator::open_with_registry(config, sink.clone(), registry).unwrap();
    device
        .configure_streams(&StreamSetBuilder::new().preview().build())
        .unwrap();
    device
        .submit_request(RequestBuilder::new(1).preview().build())
        .unwrap();

    let deadline = Instant::now() + test_timeout();
    while device.state() != DeviceState::Error && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(device.state(), DeviceState::Error);
    assert!(sink.events().contains(&CaptureEvent::Error {
        frame_id: 0,
        kind: ErrorKind::Device
    }));
    assert!(device
        .submit_request(RequestBuilder::new(2).preview().build())
        .is_err());

    // Close still terminates the accepted request
    device.close().unwrap();
    assert_eq!(sink.terminal_count(), 1);
}
