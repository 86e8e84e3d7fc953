//! Stage workers.
//!
//! One worker thread per stage group. A worker blocks on its stage queue with
//! a bounded wait, runs the handler chain for each popped frame and hands the
//! outcome back to the [`FrameFactory`]. Handlers never see the frame table.
//!
//! Each worker publishes a [`StageHealth`] record. The monitor bumps the
//! `renew` counter on every tick and the worker zeroes it every time it comes
//! back to its queue, so a counter that keeps growing means the handler is
//! stuck.

use crate::error::CameraError;
use crate::pipeline::factory::{ChainOutcome, FrameFactory};
use crate::pipeline::id::FrameCount;
use crate::pipeline::node::{AnyStage, StageContext};
use crate::pipeline::queue::PopResult;
use crate::pipeline::selector::FrameSelector;
use crate::types::{EntityState, Metadata, RollingStats, StageKind};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Sensor cadence tick sent to the scheduler after every sensor readout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotDone {
    pub frame: FrameCount,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Stopped,
    /// A handler reported a fatal fault
    Error,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Running,
            2 => WorkerState::Stopped,
            3 => WorkerState::Error,
            _ => WorkerState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Running => 1,
            WorkerState::Stopped => 2,
            WorkerState::Error => 3,
        }
    }
}

/// Liveness and throughput of one worker, shared with the monitor.
#[derive(Debug)]
pub struct StageHealth {
    pub stage: StageKind,
    renew: AtomicU32,
    state: AtomicU8,
    processed: AtomicU64,
    failed: AtomicU64,
    latency: Mutex<RollingStats>,
}

/// Point-in-time copy of a [`StageHealth`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub stage: StageKind,
    pub state: WorkerState,
    pub renew: u32,
    pub processed: u64,
    pub failed: u64,
    pub latency_min_us: u64,
    pub latency_max_us: u64,
    pub latency_avg_us: f64,
}

impl StageHealth {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            renew: AtomicU32::new(0),
            state: AtomicU8::new(WorkerState::Idle.as_u8()),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            latency: Mutex::new(RollingStats::new()),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Monitor side: one more tick without progress. Returns the new count.
    pub fn bump(&self) -> u32 {
        self.renew.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Worker side: still alive
    pub fn renew(&self) {
        self.renew.store(0, Ordering::Release);
    }

    pub fn renew_count(&self) -> u32 {
        self.renew.load(Ordering::Acquire)
    }

    fn record(&self, elapsed: Duration, ok: bool) {
        if ok {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut latency = self.latency.lock().unwrap_or_else(|e| e.into_inner());
        latency.push(elapsed.as_micros() as u64);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let (min, max, avg) = self
            .latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_tuple();
        HealthSnapshot {
            stage: self.stage,
            state: self.state(),
            renew: self.renew_count(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            latency_min_us: min,
            latency_max_us: max,
            latency_avg_us: avg,
        }
    }
}

/// Worker for one stage group.
pub struct StageWorker {
    head: StageKind,
    /// Handlers for the head and every stage that may be chained behind it
    handlers: BTreeMap<StageKind, AnyStage>,
    factory: Arc<FrameFactory>,
    selector: Arc<FrameSelector>,
    health: Arc<StageHealth>,
    stop: Arc<AtomicBool>,
    shots: Option<Sender<ShotDone>>,
    pop_timeout: Duration,
    max_retries: u32,
}

impl StageWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        head: StageKind,
        handlers: BTreeMap<StageKind, AnyStage>,
        factory: Arc<FrameFactory>,
        selector: Arc<FrameSelector>,
        health: Arc<StageHealth>,
        stop: Arc<AtomicBool>,
        pop_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            head,
            handlers,
            factory,
            selector,
            health,
            stop,
            shots: None,
            pop_timeout,
            max_retries,
        }
    }

    /// Send a [`ShotDone`] after every frame (sensor worker only)
    pub fn with_shot_sender(mut self, shots: Sender<ShotDone>) -> Self {
        self.shots = Some(shots);
        self
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("stage-{}", self.head.name()))
            .spawn(move || {
                let mut worker = self;
                worker.run();
            })
    }

    pub fn run(&mut self) {
        tracing::debug!(
            "{} worker started ({:?})",
            self.head,
            self.handlers.values().collect::<Vec<_>>()
        );
        for handler in self.handlers.values_mut() {
            handler.on_start();
        }
        self.health.renew();
        self.health.set_state(WorkerState::Running);

        let queue = self.factory.queue(self.head).clone();
        while !self.stop.load(Ordering::Acquire) {
            self.health.renew();
            match queue.wait_and_pop(self.pop_timeout) {
                PopResult::Item(frame) => {
                    if !self.process(frame) {
                        break;
                    }
                }
                PopResult::Released | PopResult::TimedOut => continue,
            }
        }

        for handler in self.handlers.values_mut() {
            handler.on_stop();
        }
        if self.health.state() != WorkerState::Error {
            self.health.set_state(WorkerState::Stopped);
        }
        tracing::debug!("{} worker stopped", self.head);
    }

    /// Run one frame through this worker's chain. Returns `false` when the
    /// worker must stop because a handler failed fatally.
    fn process(&mut self, frame: FrameCount) -> bool {
        if self.head == StageKind::Reprocessing && !self.prepare_capture(frame) {
            return true;
        }

        let Some(work) = self.factory.begin_chain(frame, self.head) else {
            tracing::debug!("[{}] dropped by {} (no longer pending)", frame, self.head);
            return true;
        };

        let started = Instant::now();
        let mut metadata = Metadata::new();
        let mut fault = None;
        let mut fatal = false;
        for job in &work.jobs {
            let result = match self.handlers.get_mut(&job.stage) {
                Some(handler) => {
                    let mut ctx = StageContext {
                        job,
                        controls: &work.controls,
                        metadata: &mut metadata,
                    };
                    handler.process(&mut ctx)
                }
                None => Err(CameraError::stage_fault(
                    job.stage,
                    frame.get(),
                    "no handler configured",
                )),
            };
            if let Err(e) = result {
                fatal = e.is_fatal();
                if fatal {
                    tracing::error!("[{}] {} fatal: {}", frame, job.stage, e);
                }
                fault = Some((job.stage, e.to_string()));
                break;
            }
        }

        self.health.record(started.elapsed(), fault.is_none());
        let timestamp_ns = metadata
            .get_int("sensor.timestamp")
            .map(|ts| ts as u64)
            .or_else(|| work.jobs.first().map(|j| j.timestamp_ns))
            .unwrap_or_default();

        self.factory
            .complete_chain(frame, self.head, ChainOutcome { metadata, fault });

        if let Some(shots) = &self.shots {
            let _ = shots.send(ShotDone {
                frame,
                timestamp_ns,
            });
        }

        if fatal {
            self.health.set_state(WorkerState::Error);
            return false;
        }
        true
    }

    /// Give a capture frame its source raw. Returns `false` if the frame was
    /// failed (or is gone) instead.
    fn prepare_capture(&self, frame: FrameCount) -> bool {
        let pending = self.factory.with_frame(frame, |f| {
            (
                f.state(StageKind::Reprocessing),
                f.input().is_some() || f.source().is_some(),
                f.capture_target(),
            )
        });
        let (state, has_source, target) = match pending {
            Ok(pending) => pending,
            Err(_) => return false,
        };
        if state != EntityState::Requested {
            return false;
        }
        if has_source {
            return true;
        }
        let Some(target) = target else {
            self.factory
                .fail_stage(frame, StageKind::Reprocessing, "capture frame has no target");
            return false;
        };

        match self.selector.select_for(target, self.max_retries) {
            Ok(held) => {
                tracing::debug!("[{}] reprocessing raw of {}", frame, held.frame);
                match self.factory.attach_source(frame, held) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("{}", e);
                        false
                    }
                }
            }
            Err(e) => {
                tracing::warn!("[{}] no raw for capture: {}", frame, e);
                self.health.record(Duration::ZERO, false);
                self.factory
                    .fail_stage(frame, StageKind::Reprocessing, &e.to_string());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::context::PipelineContext;
    use crate::error::Result;
    use crate::pipeline::factory::{FrameListener, FrameTable};
    use crate::pipeline::node::StagePlugin;
    use crate::types::FrameType;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Completions(StdMutex<Vec<FrameCount>>);

    impl FrameListener for Completions {
        fn stage_done(&self, _frame: FrameCount, _stage: StageKind, _ok: bool) {}

        fn frame_complete(&self, frame: FrameCount) {
            self.0.lock().unwrap().push(frame);
        }
    }

    struct Fails {
        fatal: bool,
    }

    impl StagePlugin for Fails {
        fn name(&self) -> &str {
            "Fails"
        }

        fn process(&mut self, ctx: &mut StageContext) -> Result<()> {
            if self.fatal {
                Err(CameraError::HardwareWatchdog("sensor hung".into()))
            } else {
                Err(CameraError::stage_fault("sensor", ctx.frame().get(), "bad readout"))
            }
        }
    }

    fn setup() -> (Arc<FrameFactory>, Arc<FrameSelector>, Arc<Completions>) {
        let ctx = Arc::new(PipelineContext::new(PipelineConfig::default()).unwrap());
        let completions = Arc::new(Completions::default());
        let factory = Arc::new(FrameFactory::new(
            ctx.clone(),
            Arc::new(FrameTable::new()),
            completions.clone(),
        ));
        let selector = Arc::new(FrameSelector::new(
            ctx.config().selector,
            ctx.pool(crate::buffer::PoolKind::Raw).clone(),
        ));
        (factory, selector, completions)
    }

    fn sensor_worker(
        factory: &Arc<FrameFactory>,
        selector: &Arc<FrameSelector>,
        fatal: bool,
    ) -> (StageWorker, Arc<StageHealth>, Arc<AtomicBool>) {
        let health = Arc::new(StageHealth::new(StageKind::Sensor));
        let stop = Arc::new(AtomicBool::new(false));
        let mut handlers = BTreeMap::new();
        handlers.insert(StageKind::Sensor, AnyStage::Plugin(Box::new(Fails { fatal })));
        let worker = StageWorker::new(
            StageKind::Sensor,
            handlers,
            factory.clone(),
            selector.clone(),
            health.clone(),
            stop.clone(),
            Duration::from_millis(10),
            1,
        );
        (worker, health, stop)
    }

    #[test]
    fn test_health_renew_cycle() {
        let health = StageHealth::new(StageKind::Isp);
        assert_eq!(health.bump(), 1);
        assert_eq!(health.bump(), 2);
        health.renew();
        assert_eq!(health.renew_count(), 0);
        assert_eq!(health.snapshot().state, WorkerState::Idle);
    }

    #[test]
    fn test_stage_fault_fails_frame_and_keeps_running() {
        let (factory, selector, completions) = setup();
        let (mut worker, health, _stop) = sensor_worker(&factory, &selector, false);
        let (tx, rx) = crossbeam_channel::unbounded();
        worker = worker.with_shot_sender(tx);

        let fc = FrameCount(1);
        let plan = factory.plan_for(FrameType::Internal, false);
        factory.create_frame(fc, FrameType::Internal, plan);
        factory.push_to_stage(fc, StageKind::Sensor).unwrap();
        let popped = match factory.queue(StageKind::Sensor).wait_and_pop(Duration::from_millis(10)) {
            PopResult::Item(f) => f,
            other => panic!("expected a frame, got {:?}", other),
        };

        assert!(worker.process(popped));
        assert_eq!(*completions.0.lock().unwrap(), vec![fc]);
        assert_eq!(rx.try_recv().unwrap().frame, fc);
        assert_eq!(health.snapshot().failed, 1);
    }

    #[test]
    fn test_fatal_fault_stops_worker() {
        let (factory, selector, _) = setup();
        let (worker, health, stop) = sensor_worker(&factory, &selector, true);
        let handle = worker.spawn().unwrap();

        let fc = FrameCount(1);
        let plan = factory.plan_for(FrameType::Internal, false);
        factory.create_frame(fc, FrameType::Internal, plan);
        factory.push_to_stage(fc, StageKind::Sensor).unwrap();

        handle.join().unwrap();
        assert_eq!(health.state(), WorkerState::Error);
        stop.store(true, Ordering::Release);
    }

    #[test]
    fn test_capture_without_raw_fails_after_retries() {
        let (factory, selector, completions) = setup();
        selector.set_config(crate::config::SelectorConfig {
            retry_interval_ms: 1,
            ..Default::default()
        });
        let health = Arc::new(StageHealth::new(StageKind::Reprocessing));
        let worker = StageWorker::new(
            StageKind::Reprocessing,
            BTreeMap::new(),
            factory.clone(),
            selector,
            health,
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(10),
            2,
        );

        let fc = FrameCount(5);
        let plan = factory.plan_for(FrameType::Capture, true);
        factory.create_frame(fc, FrameType::Capture, plan);
        factory
            .with_frame(fc, |f| {
                f.set_capture_target(crate::pipeline::selector::SelectTarget {
                    reference: FrameCount(4),
                    min_frame: None,
                    timestamp_ns: 0,
                })
            })
            .unwrap();

        assert!(!worker.prepare_capture(fc));
        assert_eq!(*completions.0.lock().unwrap(), vec![fc]);
    }
}
