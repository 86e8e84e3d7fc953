//! Client requests.
//!
//! A [`Request`] names the output buffers to fill, an optional input buffer
//! to reprocess and the controls to apply. The [`RequestManager`] accepts
//! requests, hands them to the scheduler in submission order and sequences
//! every result callback.

pub mod manager;

pub use manager::{RequestManager, RequestPlan};

use crate::buffer::BufferHandle;
use crate::pipeline::id::StreamId;
use crate::types::{MetaValue, Metadata};
use serde::{Deserialize, Serialize};

/// A caller buffer bound to a negotiated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBuffer {
    pub stream: StreamId,
    pub handle: BufferHandle,
}

impl StreamBuffer {
    pub fn new(stream: StreamId, handle: BufferHandle) -> Self {
        Self { stream, handle }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Request {
    /// Caller sequence number; strictly increasing across submissions
    pub frame_number: u32,
    pub input: Option<StreamBuffer>,
    pub outputs: Vec<StreamBuffer>,
    pub settings: Metadata,
}

impl Request {
    pub fn new(frame_number: u32) -> Self {
        Self {
            frame_number,
            ..Default::default()
        }
    }

    pub fn with_output(mut self, stream: StreamId, handle: BufferHandle) -> Self {
        self.outputs.push(StreamBuffer::new(stream, handle));
        self
    }

    pub fn with_input(mut self, stream: StreamId, handle: BufferHandle) -> Self {
        self.input = Some(StreamBuffer::new(stream, handle));
        self
    }

    pub fn with_settings(mut self, settings: Metadata) -> Self {
        self.settings = settings;
        self
    }
}

/// Use case a default settings map is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTemplate {
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    ZeroShutterLag,
    Manual,
}

impl RequestTemplate {
    pub const ALL: [RequestTemplate; 6] = [
        RequestTemplate::Preview,
        RequestTemplate::StillCapture,
        RequestTemplate::VideoRecord,
        RequestTemplate::VideoSnapshot,
        RequestTemplate::ZeroShutterLag,
        RequestTemplate::Manual,
    ];

    fn capture_intent(self) -> &'static str {
        match self {
            RequestTemplate::Preview => "preview",
            RequestTemplate::StillCapture => "still_capture",
            RequestTemplate::VideoRecord => "video_record",
            RequestTemplate::VideoSnapshot => "video_snapshot",
            RequestTemplate::ZeroShutterLag => "zero_shutter_lag",
            RequestTemplate::Manual => "manual",
        }
    }
}

/// Default exposure for the manual template, 1/60 s
const MANUAL_EXPOSURE_NS: i64 = 16_666_666;
const MANUAL_SENSITIVITY: i64 = 100;

/// Default controls for a template.
pub fn construct_default_settings(template: RequestTemplate) -> Metadata {
    let manual = template == RequestTemplate::Manual;
    let (fps_min, fps_max) = match template {
        RequestTemplate::VideoRecord | RequestTemplate::VideoSnapshot => (30, 30),
        _ => (15, 30),
    };
    let af_mode = match template {
        RequestTemplate::VideoRecord | RequestTemplate::VideoSnapshot => "continuous_video",
        RequestTemplate::Manual => "off",
        _ => "continuous_picture",
    };

    let mut settings = Metadata::new()
        .with("control.capture_intent", template.capture_intent())
        .with("control.mode", if manual { "off" } else { "auto" })
        .with("control.ae_mode", if manual { "off" } else { "on" })
        .with("control.af_mode", af_mode)
        .with("control.awb_mode", if manual { "off" } else { "auto" })
        .with("control.ae_target_fps_range", MetaValue::Ints(vec![fps_min, fps_max]));

    match template {
        RequestTemplate::StillCapture | RequestTemplate::ZeroShutterLag => {
            settings.set("jpeg.quality", 95i64);
            settings.set("noise_reduction.mode", "high_quality");
        }
        RequestTemplate::Manual => {
            settings.set("sensor.exposure_time", MANUAL_EXPOSURE_NS);
            settings.set("sensor.sensitivity", MANUAL_SENSITIVITY);
        }
        _ => settings.set("noise_reduction.mode", "fast"),
    }
    settings
}
