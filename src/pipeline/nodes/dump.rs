//! DumpStage: duplicates each raw into a dump buffer and optionally writes it
//! to `<directory>/frame_<count>.raw`.

use super::copy_buffer;
use crate::error::{CameraError, Result, ResultExt};
use crate::pipeline::node::StageContext;
use std::path::PathBuf;

pub struct DumpStage {
    directory: Option<PathBuf>,
    written: u64,
}

impl DumpStage {
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self {
            directory,
            written: 0,
        }
    }

    pub fn name(&self) -> &str {
        "RawDump"
    }

    pub fn on_start(&mut self) {
        if let Some(dir) = &self.directory {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!("Dump directory {:?} unavailable: {}", dir, e);
            }
        }
    }

    pub fn process(&mut self, ctx: &mut StageContext) -> Result<()> {
        let frame = ctx.frame().get();
        let raw = ctx
            .job
            .src
            .as_ref()
            .ok_or_else(|| CameraError::stage_fault("dump", frame, "no raw input bound"))?;
        let copy = ctx
            .job
            .dsts
            .first()
            .ok_or_else(|| CameraError::stage_fault("dump", frame, "no dump buffer bound"))?;

        copy_buffer(raw, copy);

        if let Some(dir) = &self.directory {
            let path = dir.join(format!("frame_{}.raw", frame));
            let bytes = copy.lock().clone();
            std::fs::write(&path, bytes)
                .map_err(CameraError::from)
                .with_context(|| format!("writing {:?}", path))?;
            self.written += 1;
        }
        Ok(())
    }

    pub fn on_stop(&mut self) {
        if self.written > 0 {
            tracing::info!("Dumped {} raw frames", self.written);
        }
    }
}
