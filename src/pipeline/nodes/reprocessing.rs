//! ReprocessingStage: high quality still capture from a held raw, or from a
//! caller-supplied input buffer.

use crate::error::{CameraError, Result};
use crate::pipeline::node::StageContext;

/// Rough compression ratio of the simulated encoder
const COMPRESSION_RATIO: usize = 10;

pub struct ReprocessingStage {
    captures: u64,
}

impl ReprocessingStage {
    pub fn new() -> Self {
        Self { captures: 0 }
    }

    pub fn name(&self) -> &str {
        "SimReprocessing"
    }

    pub fn on_start(&mut self) {}

    pub fn process(&mut self, ctx: &mut StageContext) -> Result<()> {
        let source_bytes = match (&ctx.job.src, ctx.job.input) {
            (Some(raw), _) => raw.size(),
            (None, Some(_)) => 0,
            (None, None) => {
                return Err(CameraError::stage_fault(
                    "reprocessing",
                    ctx.frame().get(),
                    "neither a held raw nor an input buffer",
                ))
            }
        };

        self.captures += 1;
        ctx.metadata
            .set("jpeg.size", (source_bytes / COMPRESSION_RATIO) as i64);
        ctx.metadata.set("jpeg.quality", 95i64);
        ctx.metadata.set("reprocessing.outputs", ctx.job.outputs.len() as i64);
        Ok(())
    }

    pub fn on_stop(&mut self) {
        tracing::debug!("Reprocessing produced {} captures", self.captures);
    }
}

impl Default for ReprocessingStage {
    fn default() -> Self {
        Self::new()
    }
}
