//! ScalerStage: multi-output scaler filling caller preview/video buffers.

use crate::error::Result;
use crate::pipeline::node::StageContext;

pub struct ScalerStage {
    delivered: u64,
}

impl ScalerStage {
    pub fn new() -> Self {
        Self { delivered: 0 }
    }

    pub fn name(&self) -> &str {
        "SimScaler"
    }

    pub fn on_start(&mut self) {}

    pub fn process(&mut self, ctx: &mut StageContext) -> Result<()> {
        let outputs = ctx.job.outputs.len();
        self.delivered += outputs as u64;
        tracing::trace!("[{}] scaler filled {} outputs", ctx.frame(), outputs);
        ctx.metadata.set("scaler.outputs", outputs as i64);
        Ok(())
    }

    pub fn on_stop(&mut self) {
        tracing::debug!("Scaler filled {} caller buffers", self.delivered);
    }
}

impl Default for ScalerStage {
    fn default() -> Self {
        Self::new()
    }
}
