//! Built-in stage handlers and the handler registry.
//!
//! Handlers are looked up by the names in `stages.handlers` of the pipeline
//! config. Every built-in is registered under its default name; callers can
//! register additional [`StagePlugin`] constructors before the device starts.

pub mod dump;
pub mod isp;
pub mod reprocessing;
pub mod scaler;
pub mod sensor;
pub mod stats3a;

pub use dump::DumpStage;
pub use isp::IspStage;
pub use reprocessing::ReprocessingStage;
pub use scaler::ScalerStage;
pub use sensor::SensorStage;
pub use stats3a::Stats3aStage;

use crate::buffer::HwBuffer;
use crate::config::PipelineConfig;
use crate::error::{CameraError, Result};
use crate::pipeline::node::{AnyStage, BuiltinStage, StagePlugin};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Constructs a handler from the active configuration.
pub type StageBuilder = Arc<dyn Fn(&PipelineConfig) -> AnyStage + Send + Sync>;

/// Name → handler constructor table.
#[derive(Clone)]
pub struct StageRegistry {
    builders: BTreeMap<String, StageBuilder>,
}

impl StageRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    /// Registry holding every built-in handler
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("sim_sensor", |config| {
            AnyStage::Builtin(BuiltinStage::Sensor(SensorStage::new(
                config.sensor.frame_duration(),
            )))
        });
        registry.register("sim_3aa", |_| {
            AnyStage::Builtin(BuiltinStage::Stats3a(Stats3aStage::new()))
        });
        registry.register("sim_isp", |_| AnyStage::Builtin(BuiltinStage::Isp(IspStage::new())));
        registry.register("sim_scaler", |_| {
            AnyStage::Builtin(BuiltinStage::Scaler(ScalerStage::new()))
        });
        registry.register("sim_reprocessing", |_| {
            AnyStage::Builtin(BuiltinStage::Reprocessing(ReprocessingStage::new()))
        });
        registry.register("raw_dump", |config| {
            AnyStage::Builtin(BuiltinStage::Dump(DumpStage::new(
                config.dump.directory.clone(),
            )))
        });
        registry
    }

    /// Register (or replace) a constructor
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&PipelineConfig) -> AnyStage + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Arc::new(builder));
    }

    /// Register a plugin constructor
    pub fn register_plugin<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn() -> Box<dyn StagePlugin> + Send + Sync + 'static,
    {
        self.register(name, move |_| AnyStage::Plugin(builder()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(|k| k.as_str())
    }

    /// Build the handler registered as `name`
    pub fn create(&self, name: &str, config: &PipelineConfig) -> Result<AnyStage> {
        let builder = self.builders.get(name).ok_or_else(|| {
            CameraError::InvalidArgument(format!("no stage handler named '{}'", name))
        })?;
        Ok(builder(config))
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.builders.keys()).finish()
    }
}

/// Write the frame count header and a frame-dependent pattern.
pub(crate) fn stamp_frame(buffer: &HwBuffer, frame: u32) {
    let mut bytes = buffer.lock();
    let header = frame.to_le_bytes();
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = match header.get(i) {
            Some(h) => *h,
            None => (frame as usize).wrapping_add(i) as u8,
        };
    }
}

/// Copy as much of `src` as fits into `dst`.
pub(crate) fn copy_buffer(src: &HwBuffer, dst: &HwBuffer) {
    let data = src.lock();
    let mut out = dst.lock();
    let n = data.len().min(out.len());
    out[..n].copy_from_slice(&data[..n]);
}
