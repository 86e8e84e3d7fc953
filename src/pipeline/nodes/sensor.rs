//! SensorStage: simulated sensor readout.
//!
//! Waits one frame duration (exposure + readout), then stamps the raw buffer
//! with the frame count and a test pattern and reports sensor metadata.
//! Manual exposure/sensitivity controls in the frame metadata are honoured.

use super::stamp_frame;
use crate::error::{CameraError, Result};
use crate::pipeline::node::StageContext;
use std::time::Duration;

/// Exposure reported when auto-exposure is in charge
const AUTO_EXPOSURE_NS: i64 = 10_000_000;
const AUTO_SENSITIVITY: i64 = 100;

pub struct SensorStage {
    frame_duration: Duration,
    readouts: u64,
}

impl SensorStage {
    pub fn new(frame_duration: Duration) -> Self {
        Self {
            frame_duration,
            readouts: 0,
        }
    }

    pub fn name(&self) -> &str {
        "SimSensor"
    }

    pub fn on_start(&mut self) {
        self.readouts = 0;
    }

    pub fn process(&mut self, ctx: &mut StageContext) -> Result<()> {
        let raw = ctx.job.dsts.first().ok_or_else(|| {
            CameraError::stage_fault("sensor", ctx.frame().get(), "no raw buffer bound")
        })?;

        std::thread::sleep(self.frame_duration);
        stamp_frame(raw, ctx.frame().get());
        self.readouts += 1;

        let exposure = ctx
            .controls
            .get_int("sensor.exposure_time")
            .unwrap_or(AUTO_EXPOSURE_NS);
        let sensitivity = ctx
            .controls
            .get_int("sensor.sensitivity")
            .unwrap_or(AUTO_SENSITIVITY);

        ctx.metadata.set("sensor.timestamp", ctx.job.timestamp_ns as i64);
        ctx.metadata.set("sensor.frame_count", ctx.frame().get() as i64);
        ctx.metadata.set("sensor.exposure_time", exposure);
        ctx.metadata.set("sensor.sensitivity", sensitivity);
        ctx.metadata
            .set("sensor.frame_duration", self.frame_duration.as_nanos() as i64);
        Ok(())
    }

    pub fn on_stop(&mut self) {
        tracing::debug!("Sensor stopped after {} readouts", self.readouts);
    }
}
