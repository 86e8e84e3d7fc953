//! # camera-pipeline: request-to-frame camera orchestrator
//!
//! Turns client capture requests into frames that travel through a
//! multi-stage imaging pipeline (sensor, 3A statistics, ISP, scaler,
//! reprocessing, dump) and returns ordered results to the caller.
//!
//! ## Architecture
//!
//! - **Orchestrator**: device state machine, scheduler thread, completion
//! - **Request manager**: request intake and strictly ordered result delivery
//! - **Pipeline**: frame table, stage queues, one worker thread per stage group
//! - **Buffer pools**: fixed-size hardware-style buffers shared by stages
//! - **Selector**: hold list of recent raws for zero-shutter-lag capture
//! - **Communication**: crossbeam channels and queues between threads
//!
//! ## Configuration
//!
//! [`PipelineConfig`] is loaded from TOML. The default location is the
//! platform config directory under `camera-pipeline/pipeline.toml`.
//!
//! ## Example
//!
//! ```no_run
//! use camera_pipeline::{
//!     BufferHandle, ChannelSink, Orchestrator, PipelineConfig, Request, StreamConfig, StreamId,
//!     StreamKind,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> camera_pipeline::Result<()> {
//!     let (sink, events) = ChannelSink::new();
//!     let device = Orchestrator::open(PipelineConfig::default(), Arc::new(sink))?;
//!     device.configure_streams(&[StreamConfig::new(0, StreamKind::Preview, 640, 480)])?;
//!
//!     device.submit_request(Request::new(1).with_output(StreamId(0), BufferHandle(1)))?;
//!     for event in events.collect_until_terminal(1, Duration::from_secs(2)) {
//!         println!("{:?}", event);
//!     }
//!     device.close()
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod request;
pub mod types;

// Re-export commonly used types
pub use buffer::{BufferHandle, BufferId, PoolKind};
pub use config::PipelineConfig;
pub use context::PipelineContext;
pub use error::{CameraError, ErrorClass, Result};
pub use orchestrator::{DeviceState, Orchestrator, PipelineStats};
pub use pipeline::{CaptureEvent, ChannelSink, EventReceiver, FrameCount, ResultSink, StreamId};
pub use request::{construct_default_settings, Request, RequestTemplate, StreamBuffer};
pub use types::{
    BufferStatus, ErrorKind, FrameType, MetaValue, Metadata, StageKind, StageLink, StreamConfig,
    StreamKind,
};
