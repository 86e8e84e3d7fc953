//! Test to verify test infrastructure and the device surface work correctly

mod common;

use camera_pipeline::orchestrator::StateMachine;
use camera_pipeline::{
    construct_default_settings, DeviceState, Orchestrator, PipelineConfig, RequestTemplate,
    StageLink,
};
use common::builders::{RequestBuilder, StreamSetBuilder};
use common::mock_helpers::RecordingSink;
use common::fast_config;

#[test]
fn test_infrastructure_setup() {
    let streams = StreamSetBuilder::new().preview().capture().input().build();
    assert_eq!(streams.len(), 3);

    let request = RequestBuilder::new(2).preview().input().build();
    assert_eq!(request.frame_number, 2);
    assert!(request.input.is_some());
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("pipeline.toml");

    let mut config = PipelineConfig::default();
    config.sensor.control_delay = 3;
    config.stages.isp_scaler = StageLink::Otf;
    config.selector.hold_depth = 5;
    config.save(&path).unwrap();

    let loaded = PipelineConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
    assert_eq!(loaded.sensor.warmup_frames(), 5);
}

#[test]
fn test_invalid_config_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.toml");
    std::fs::write(&path, "[sensor]\nframe_duration_ms = \"fast\"\n").unwrap();
    assert!(PipelineConfig::load(&path).is_err());
    assert_eq!(PipelineConfig::load_or_default(&path), PipelineConfig::default());
}

#[test]
fn test_state_machine_rejects_skipping_configure() {
    let sm = StateMachine::new();
    sm.transition(DeviceState::Initialized).unwrap();
    assert!(sm.transition(DeviceState::Run).is_err());
    assert_eq!(sm.current(), DeviceState::Initialized);
}

#[test]
fn test_default_settings_through_device() {
    let device = Orchestrator::open(fast_config(), RecordingSink::new()).unwrap();
    for template in RequestTemplate::ALL {
        assert_eq!(
            device.construct_default_settings(template).unwrap(),
            construct_default_settings(template)
        );
    }
    device.close().unwrap();
}

#[test]
fn test_stats_serialize_to_json() {
    let device = Orchestrator::open(fast_config(), RecordingSink::new()).unwrap();
    let json = device.stats().to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["state"], "initialized");
    assert_eq!(value["frames_in_flight"], 0);
    assert_eq!(value["pools"].as_array().map(|p| p.len()), Some(4));
    device.close().unwrap();
}
