//! Watchdog thread.
//!
//! Every `interval_ms` the monitor bumps the renew counter of each running
//! stage worker and the result-delay counter of the request manager. A
//! worker that reports a fatal fault, or a counter that passes its limit,
//! trips the watchdog once and the monitor exits.

use crate::config::MonitorConfig;
use crate::error::CameraError;
use crate::pipeline::worker::{StageHealth, WorkerState};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;

/// What the monitor watches besides the stage workers.
pub trait MonitorHooks: Send + Sync {
    /// Count one more tick without result progress. `None` when nothing is
    /// pending (or the device is not streaming).
    fn bump_result_delay(&self) -> Option<u32>;

    /// The device has to go down.
    fn trip(&self, reason: CameraError);
}

pub struct Monitor {
    config: MonitorConfig,
    workers: Vec<Arc<StageHealth>>,
    hooks: Arc<dyn MonitorHooks>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        workers: Vec<Arc<StageHealth>>,
        hooks: Arc<dyn MonitorHooks>,
    ) -> Self {
        Self {
            config,
            workers,
            hooks,
        }
    }

    /// Run on a dedicated thread until `shutdown` fires or is dropped.
    pub fn spawn(self, shutdown: Receiver<()>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("pipeline-monitor".into())
            .spawn(move || self.run(shutdown))
    }

    fn run(self, shutdown: Receiver<()>) {
        tracing::debug!(
            "Monitor started: every {:?}, stall limit {}",
            self.config.interval(),
            self.config.stall_limit
        );
        loop {
            match shutdown.recv_timeout(self.config.interval()) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            if let Some(reason) = self.check() {
                tracing::error!("Watchdog tripped: {}", reason);
                self.hooks.trip(reason);
                break;
            }
        }
        tracing::debug!("Monitor stopped");
    }

    /// One watchdog tick. Returns the reason to tear the device down, if any.
    pub fn check(&self) -> Option<CameraError> {
        for health in &self.workers {
            match health.state() {
                WorkerState::Error => {
                    return Some(CameraError::HardwareWatchdog(format!(
                        "{} worker reported a fatal fault",
                        health.stage
                    )));
                }
                WorkerState::Running => {
                    let renew = health.bump();
                    if renew > self.config.stall_limit {
                        return Some(CameraError::HardwareWatchdog(format!(
                            "{} stalled for {} ticks",
                            health.stage, renew
                        )));
                    }
                }
                WorkerState::Idle | WorkerState::Stopped => {}
            }
        }

        if let Some(delay) = self.hooks.bump_result_delay() {
            if delay > self.config.result_delay_limit {
                return Some(CameraError::HardwareWatchdog(format!(
                    "no result delivered for {} ticks",
                    delay
                )));
            }
        }
        None
    }
}
