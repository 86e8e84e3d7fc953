//! Stats3aStage: demosaic front end and 3A statistics.

use super::copy_buffer;
use crate::error::{CameraError, Result};
use crate::pipeline::node::StageContext;

/// Frames auto-exposure needs before it reports convergence
const CONVERGE_AFTER: u64 = 3;

/// Bytes sampled for the luma estimate
const SAMPLE_BYTES: usize = 256;

pub struct Stats3aStage {
    frames_seen: u64,
}

impl Stats3aStage {
    pub fn new() -> Self {
        Self { frames_seen: 0 }
    }

    pub fn name(&self) -> &str {
        "Sim3aa"
    }

    pub fn on_start(&mut self) {
        self.frames_seen = 0;
    }

    pub fn process(&mut self, ctx: &mut StageContext) -> Result<()> {
        let raw = ctx.job.src.as_ref().ok_or_else(|| {
            CameraError::stage_fault("3aa", ctx.frame().get(), "no raw input bound")
        })?;

        let luma = {
            let bytes = raw.lock();
            let sample = &bytes[..bytes.len().min(SAMPLE_BYTES)];
            if sample.is_empty() {
                0.0
            } else {
                sample.iter().map(|b| *b as f64).sum::<f64>() / sample.len() as f64
            }
        };

        if let Some(bayer) = ctx.job.dsts.first() {
            copy_buffer(raw, bayer);
        }

        self.frames_seen += 1;
        let ae_state = if self.frames_seen > CONVERGE_AFTER {
            "converged"
        } else {
            "searching"
        };

        ctx.metadata.set("stats.luma_mean", luma);
        ctx.metadata.set("control.ae_state", ae_state);
        ctx.metadata.set("control.af_state", "passive_focused");
        ctx.metadata.set("control.awb_state", ae_state);
        Ok(())
    }

    pub fn on_stop(&mut self) {}
}

impl Default for Stats3aStage {
    fn default() -> Self {
        Self::new()
    }
}
