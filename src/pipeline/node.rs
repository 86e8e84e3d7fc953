//! Stage handler abstraction.
//!
//! Two-layer design:
//! - **`StagePlugin` trait**: the image-transform seam for handlers supplied
//!   from outside the crate (hardware back ends, test doubles).
//! - **`BuiltinStage` enum**: the simulated handlers shipped with the crate,
//!   dispatched with a match instead of a vtable.
//!
//! `AnyStage` wraps either variant so a worker can drive both uniformly.

use crate::buffer::{BufferHandle, HwBuffer};
use crate::error::Result;
use crate::pipeline::id::{FrameCount, StreamId};
use crate::pipeline::nodes::{
    DumpStage, IspStage, ReprocessingStage, ScalerStage, SensorStage, Stats3aStage,
};
use crate::types::{FrameType, Metadata, StageKind};
use std::sync::Arc;

/// Everything a handler may touch for one frame, resolved before the call so
/// no frame lock is held while it runs.
#[derive(Debug, Clone)]
pub struct StageJob {
    pub frame: FrameCount,
    pub frame_type: FrameType,
    pub stage: StageKind,
    pub src: Option<Arc<HwBuffer>>,
    pub dsts: Vec<Arc<HwBuffer>>,
    /// Caller buffers this stage fills
    pub outputs: Vec<(StreamId, BufferHandle)>,
    /// Caller buffer to reprocess
    pub input: Option<(StreamId, BufferHandle)>,
    /// Device time when the job was issued
    pub timestamp_ns: u64,
}

/// Context passed to a handler for one frame.
pub struct StageContext<'a> {
    pub job: &'a StageJob,
    /// Frame metadata when the job was issued (request controls included)
    pub controls: &'a Metadata,
    /// Results of this stage, merged into the frame afterwards
    pub metadata: &'a mut Metadata,
}

impl StageContext<'_> {
    pub fn frame(&self) -> FrameCount {
        self.job.frame
    }
}

/// Trait for handlers plugged in at runtime.
pub trait StagePlugin: Send {
    /// Human-readable name of this handler.
    fn name(&self) -> &str;

    /// Called when the stage worker starts.
    fn on_start(&mut self) {}

    /// Process one frame. Errors fail this frame only, unless they are fatal.
    fn process(&mut self, ctx: &mut StageContext) -> Result<()>;

    /// Called when the stage worker stops.
    fn on_stop(&mut self) {}
}

/// Enum dispatch for built-in handlers.
pub enum BuiltinStage {
    Sensor(SensorStage),
    Stats3a(Stats3aStage),
    Isp(IspStage),
    Scaler(ScalerStage),
    Reprocessing(ReprocessingStage),
    Dump(DumpStage),
}

impl BuiltinStage {
    pub fn name(&self) -> &str {
        match self {
            BuiltinStage::Sensor(s) => s.name(),
            BuiltinStage::Stats3a(s) => s.name(),
            BuiltinStage::Isp(s) => s.name(),
            BuiltinStage::Scaler(s) => s.name(),
            BuiltinStage::Reprocessing(s) => s.name(),
            BuiltinStage::Dump(s) => s.name(),
        }
    }

    pub fn on_start(&mut self) {
        match self {
            BuiltinStage::Sensor(s) => s.on_start(),
            BuiltinStage::Stats3a(s) => s.on_start(),
            BuiltinStage::Isp(s) => s.on_start(),
            BuiltinStage::Scaler(s) => s.on_start(),
            BuiltinStage::Reprocessing(s) => s.on_start(),
            BuiltinStage::Dump(s) => s.on_start(),
        }
    }

    pub fn process(&mut self, ctx: &mut StageContext) -> Result<()> {
        match self {
            BuiltinStage::Sensor(s) => s.process(ctx),
            BuiltinStage::Stats3a(s) => s.process(ctx),
            BuiltinStage::Isp(s) => s.process(ctx),
            BuiltinStage::Scaler(s) => s.process(ctx),
            BuiltinStage::Reprocessing(s) => s.process(ctx),
            BuiltinStage::Dump(s) => s.process(ctx),
        }
    }

    pub fn on_stop(&mut self) {
        match self {
            BuiltinStage::Sensor(s) => s.on_stop(),
            BuiltinStage::Stats3a(s) => s.on_stop(),
            BuiltinStage::Isp(s) => s.on_stop(),
            BuiltinStage::Scaler(s) => s.on_stop(),
            BuiltinStage::Reprocessing(s) => s.on_stop(),
            BuiltinStage::Dump(s) => s.on_stop(),
        }
    }
}

/// Wrapper that holds either a built-in handler or a plugin.
pub enum AnyStage {
    Builtin(BuiltinStage),
    Plugin(Box<dyn StagePlugin>),
}

impl AnyStage {
    pub fn name(&self) -> &str {
        match self {
            AnyStage::Builtin(s) => s.name(),
            AnyStage::Plugin(s) => s.name(),
        }
    }

    pub fn on_start(&mut self) {
        match self {
            AnyStage::Builtin(s) => s.on_start(),
            AnyStage::Plugin(s) => s.on_start(),
        }
    }

    pub fn process(&mut self, ctx: &mut StageContext) -> Result<()> {
        match self {
            AnyStage::Builtin(s) => s.process(ctx),
            AnyStage::Plugin(s) => s.process(ctx),
        }
    }

    pub fn on_stop(&mut self) {
        match self {
            AnyStage::Builtin(s) => s.on_stop(),
            AnyStage::Plugin(s) => s.on_stop(),
        }
    }
}

impl std::fmt::Debug for AnyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnyStage::Builtin(s) => write!(f, "Builtin({})", s.name()),
            AnyStage::Plugin(s) => write!(f, "Plugin({})", s.name()),
        }
    }
}
