//! IspStage: image signal processing.
//!
//! With a memory-to-memory link to the scaler the ISP writes a yuv
//! intermediate; chained on-the-fly it only reports metadata.

use super::copy_buffer;
use crate::error::Result;
use crate::pipeline::node::StageContext;

pub struct IspStage {
    noise_reduction: &'static str,
}

impl IspStage {
    pub fn new() -> Self {
        Self {
            noise_reduction: "fast",
        }
    }

    pub fn name(&self) -> &str {
        "SimIsp"
    }

    pub fn on_start(&mut self) {}

    pub fn process(&mut self, ctx: &mut StageContext) -> Result<()> {
        if let (Some(src), Some(dst)) = (ctx.job.src.as_ref(), ctx.job.dsts.first()) {
            copy_buffer(src, dst);
        }
        ctx.metadata.set("isp.noise_reduction", self.noise_reduction);
        ctx.metadata.set("isp.edge_mode", "fast");
        Ok(())
    }

    pub fn on_stop(&mut self) {}
}

impl Default for IspStage {
    fn default() -> Self {
        Self::new()
    }
}
