//! Frame scheduling.
//!
//! The scheduler thread creates one sensor frame per shot. A shot is the
//! sensor worker finishing a frame, or a synthesized tick when the sensor
//! queue has run dry. Each sensor frame carries the next queued request, or
//! is an internal frame that keeps the sensor and the hold list warm.

use super::Core;
use crate::pipeline::id::FrameCount;
use crate::pipeline::selector::SelectTarget;
use crate::pipeline::worker::ShotDone;
use crate::request::RequestPlan;
use crate::types::{FrameType, StageKind};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const RECONFIGURE_POLL: Duration = Duration::from_millis(2);
const MIN_IDLE_TICK: Duration = Duration::from_millis(50);

pub(super) fn spawn(core: Arc<Core>, shots: Receiver<ShotDone>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("pipeline-scheduler".into())
        .spawn(move || run(core, shots))
}

fn run(core: Arc<Core>, shots: Receiver<ShotDone>) {
    let cfg = core.ctx.config();
    tracing::info!("Scheduler started");

    // Fill the sensor pipeline up to its control delay
    let prime = (cfg.sensor.control_delay + 1).max(1);
    for _ in 0..prime {
        if core.stop.load(Ordering::Acquire) {
            break;
        }
        core.create_next_frame();
    }

    let idle = (cfg.sensor.frame_duration() * 4).max(MIN_IDLE_TICK);
    while !core.stop.load(Ordering::Acquire) {
        match shots.recv_timeout(idle) {
            Ok(shot) => {
                tracing::trace!("[{}] shot done at {} ns", shot.frame, shot.timestamp_ns);
                core.on_shot_done();
            }
            Err(RecvTimeoutError::Timeout) => {
                if core.factory.queue(StageKind::Sensor).is_empty() {
                    tracing::debug!("Sensor idle, synthesizing a tick");
                    core.on_shot_done();
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::info!("Scheduler stopped");
}

impl Core {
    fn on_shot_done(&self) {
        while self.reconfiguring.load(Ordering::Acquire) && !self.stop.load(Ordering::Acquire) {
            std::thread::sleep(RECONFIGURE_POLL);
        }
        if self.stop.load(Ordering::Acquire) {
            return;
        }
        self.create_next_frame();
    }

    /// Create the next sensor frame and whatever capture frame rides on it.
    pub(super) fn create_next_frame(&self) {
        let warmup = self.ctx.config().sensor.warmup_frames();
        let index = self.sensor_frames.fetch_add(1, Ordering::Relaxed);

        if index < warmup {
            // Preview is not trusted yet; capture-only requests may still
            // reach back into the hold list.
            let anchor = self.create_internal_frame();
            if let Some(plan) = self.requests.pop_service_if(|p| p.is_capture_only()) {
                self.schedule_request(&plan, anchor);
            }
            return;
        }

        match self.requests.pop_service() {
            None => {
                self.create_internal_frame();
            }
            Some(plan) if plan.is_capture_only() => {
                let anchor = self.create_internal_frame();
                self.schedule_request(&plan, anchor);
            }
            Some(plan) => self.schedule_request(&plan, FrameCount::INVALID),
        }
    }

    fn create_internal_frame(&self) -> FrameCount {
        let fc = self.ctx.next_frame_count();
        let plan = self.factory.plan_for(FrameType::Internal, false);
        self.factory.create_frame(fc, FrameType::Internal, plan);
        self.counters.internal.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.factory.push_to_stage(fc, StageKind::Sensor) {
            tracing::debug!("[{}] internal frame not started: {}", fc, e);
        }
        fc
    }

    fn schedule_request(&self, plan: &RequestPlan, anchor: FrameCount) {
        for (fc, head) in self.build_request_frames(plan, anchor) {
            if let Err(e) = self.factory.push_to_stage(fc, head) {
                tracing::debug!("[{}] R{} not started: {}", fc, plan.frame_number, e);
            }
        }
    }

    /// Create the frames serving `plan` without pushing them.
    ///
    /// A request with preview-path outputs gets a client frame; capture
    /// outputs or an input buffer add a capture frame. The capture frame of a
    /// capture-only request is anchored to `anchor`.
    pub(super) fn build_request_frames(
        &self,
        plan: &RequestPlan,
        anchor: FrameCount,
    ) -> Vec<(FrameCount, StageKind)> {
        let number = plan.frame_number;
        let with_client = !plan.is_capture_only();
        let with_capture = plan.needs_capture();
        // Registered before any frame can finish
        self.requests
            .expect_frames(number, u32::from(with_client) + u32::from(with_capture));

        let mut frames = Vec::with_capacity(2);
        let mut client = None;

        if with_client {
            let fc = self.ctx.next_frame_count();
            let stages = self.factory.plan_for(FrameType::Client, true);
            self.factory.create_frame(fc, FrameType::Client, stages);
            self.setup_frame(fc, |frame| {
                frame.set_request(number);
                frame.metadata_mut().merge(&plan.settings);
            });
            for out in &plan.preview {
                if let Err(e) = self
                    .factory
                    .bind_output(fc, StageKind::Scaler, out.stream, out.handle)
                {
                    tracing::warn!("[{}] R{} output {} not bound: {}", fc, number, out.stream, e);
                }
            }
            self.counters.client.fetch_add(1, Ordering::Relaxed);
            frames.push((fc, StageKind::Sensor));
            client = Some(fc);
        }

        if with_capture {
            let fc = self.ctx.next_frame_count();
            let stages = self.factory.plan_for(FrameType::Capture, true);
            self.factory.create_frame(fc, FrameType::Capture, stages);
            let target = SelectTarget {
                reference: client.unwrap_or(anchor),
                min_frame: client,
                timestamp_ns: self.ctx.now_ns(),
            };
            self.setup_frame(fc, |frame| {
                frame.set_request(number);
                frame.metadata_mut().merge(&plan.settings);
                frame.set_capture_target(target);
                if let Some(input) = plan.input {
                    frame.set_input(input.stream, input.handle);
                }
            });
            for out in &plan.capture {
                if let Err(e) = self
                    .factory
                    .bind_output(fc, StageKind::Reprocessing, out.stream, out.handle)
                {
                    tracing::warn!("[{}] R{} output {} not bound: {}", fc, number, out.stream, e);
                }
            }
            self.counters.capture.fetch_add(1, Ordering::Relaxed);
            frames.push((fc, StageKind::Reprocessing));
        }

        tracing::debug!("[R{}] scheduled on {:?}", number, frames);
        frames
    }

    fn setup_frame(&self, fc: FrameCount, f: impl FnOnce(&mut crate::pipeline::frame::Frame)) {
        if let Err(e) = self.factory.with_frame(fc, f) {
            tracing::warn!("[{}] frame vanished during setup: {}", fc, e);
        }
    }
}
