//! Device-level orchestration.
//!
//! [`Orchestrator`] is the device handle: it owns the pipeline context, the
//! frame factory, the capture selector and the request manager, and it runs
//! the scheduler, stage worker and monitor threads while streaming.
//!
//! # Threads
//!
//! ```text
//!  submit_request ──► RequestManager (service queue)
//!                           │
//!  sensor worker ─ShotDone─► scheduler ──► FrameFactory ──► stage queues ──► stage workers
//!                                                                              │
//!                       RequestManager ◄── completion (FrameListener) ◄────────┘
//!                             │
//!                             └──► ResultSink callbacks
//! ```
//!
//! Streaming starts lazily on the first request after `configure_streams`
//! and stops on `flush()` or `close()`.

mod completion;
mod scheduler;
pub mod state;

pub use state::{DeviceState, StateMachine};

use crate::buffer::{PoolKind, PoolStats};
use crate::config::{FatalPolicy, PipelineConfig};
use crate::context::PipelineContext;
use crate::error::{CameraError, Result};
use crate::pipeline::bridge::ResultSink;
use crate::pipeline::factory::{FrameFactory, FrameTable};
use crate::pipeline::monitor::Monitor;
use crate::pipeline::nodes::StageRegistry;
use crate::pipeline::selector::{FrameSelector, SelectorStats};
use crate::pipeline::worker::{HealthSnapshot, StageHealth, StageWorker};
use crate::request::{construct_default_settings, Request, RequestManager, RequestTemplate};
use crate::types::{Metadata, StageKind, StageSet, StreamConfig, StreamKind};
use completion::{CoreHooks, CoreListener};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long a flush waits for a starting device to reach `Run`
const START_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct FrameCounters {
    client: AtomicU64,
    internal: AtomicU64,
    capture: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    /// Buffers reclaimed from pools at flush or close
    leaked: AtomicU64,
}

#[derive(Default)]
struct Threads {
    scheduler: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    monitor: Option<(Sender<()>, JoinHandle<()>)>,
}

/// Serialisable snapshot of the device.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub state: DeviceState,
    pub frames_client: u64,
    pub frames_internal: u64,
    pub frames_capture: u64,
    pub frames_completed: u64,
    pub frames_failed: u64,
    pub frames_in_flight: usize,
    pub buffers_leaked: u64,
    pub stages: Vec<HealthSnapshot>,
    pub pools: Vec<PoolStats>,
    pub selector: SelectorStats,
    pub pending_requests: usize,
    pub queued_requests: usize,
}

impl PipelineStats {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub(crate) struct Core {
    ctx: Arc<PipelineContext>,
    factory: Arc<FrameFactory>,
    selector: Arc<FrameSelector>,
    requests: Arc<RequestManager>,
    registry: StageRegistry,
    state: StateMachine,
    streams: Mutex<Vec<StreamConfig>>,
    reprocessing: AtomicBool,
    flushing: AtomicBool,
    reconfiguring: AtomicBool,
    closed: AtomicBool,
    stop: Arc<AtomicBool>,
    /// Sensor frames created since the last start
    sensor_frames: AtomicU64,
    counters: FrameCounters,
    threads: Mutex<Threads>,
    health: Mutex<Vec<Arc<StageHealth>>>,
    /// Serializes start, flush, configure and close
    lifecycle: Mutex<()>,
}

/// Camera device handle.
pub struct Orchestrator {
    core: Arc<Core>,
}

impl Orchestrator {
    /// Open a device with the built-in stage handlers.
    pub fn open(config: PipelineConfig, sink: Arc<dyn ResultSink>) -> Result<Self> {
        Self::open_with_registry(config, sink, StageRegistry::with_builtins())
    }

    /// Open a device resolving stage handlers through `registry`.
    pub fn open_with_registry(
        config: PipelineConfig,
        sink: Arc<dyn ResultSink>,
        registry: StageRegistry,
    ) -> Result<Self> {
        for stage in StageKind::ALL {
            let name = config.stages.handlers.get(stage);
            if !registry.contains(name) {
                return Err(CameraError::InvalidArgument(format!(
                    "no handler '{}' for stage {}",
                    name, stage
                )));
            }
        }

        let ctx = Arc::new(PipelineContext::new(config)?);
        let cfg = ctx.config();
        let selector = Arc::new(FrameSelector::new(
            cfg.selector.clone(),
            ctx.pool(PoolKind::Raw).clone(),
        ));
        let requests = Arc::new(RequestManager::new(sink));

        let core = Arc::new_cyclic(|weak: &Weak<Core>| {
            let listener = Arc::new(CoreListener(weak.clone()));
            let factory = Arc::new(FrameFactory::new(
                ctx.clone(),
                Arc::new(FrameTable::new()),
                listener,
            ));
            Core {
                ctx,
                factory,
                selector,
                requests,
                registry,
                state: StateMachine::new(),
                streams: Mutex::new(Vec::new()),
                reprocessing: AtomicBool::new(false),
                flushing: AtomicBool::new(false),
                reconfiguring: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                stop: Arc::new(AtomicBool::new(false)),
                sensor_frames: AtomicU64::new(0),
                counters: FrameCounters::default(),
                threads: Mutex::new(Threads::default()),
                health: Mutex::new(Vec::new()),
                lifecycle: Mutex::new(()),
            }
        });
        core.state.transition(DeviceState::Initialized)?;
        tracing::info!(
            "Device opened ({} ms frames, control delay {})",
            cfg.sensor.frame_duration_ms,
            cfg.sensor.control_delay
        );
        Ok(Self { core })
    }

    /// Negotiate the stream set. A streaming device is flushed first.
    pub fn configure_streams(&self, streams: &[StreamConfig]) -> Result<()> {
        self.core.configure_streams(streams)
    }

    pub fn construct_default_settings(&self, template: RequestTemplate) -> Result<Metadata> {
        self.core.ensure_open()?;
        match self.core.state.current() {
            DeviceState::Open | DeviceState::Error => Err(CameraError::InvalidState(format!(
                "no default settings in state {}",
                self.core.state.current()
            ))),
            _ => Ok(construct_default_settings(template)),
        }
    }

    /// Accept a request. Starts streaming on the first request.
    pub fn submit_request(&self, request: Request) -> Result<()> {
        self.core.submit_request(request)
    }

    /// Cancel all in-flight and queued work. Every accepted request gets its
    /// terminal callback before this returns.
    pub fn flush(&self) -> Result<()> {
        self.core.flush()
    }

    /// Tear down. Pending requests are flushed.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }

    pub fn state(&self) -> DeviceState {
        self.core.state.current()
    }

    pub fn streams(&self) -> Vec<StreamConfig> {
        self.core.lock_streams().clone()
    }

    pub fn stage_health(&self) -> Vec<HealthSnapshot> {
        self.core
            .lock_health()
            .iter()
            .map(|h| h.snapshot())
            .collect()
    }

    pub fn stats(&self) -> PipelineStats {
        self.core.stats()
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.core.ctx
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Err(e) = self.core.close() {
            tracing::warn!("Close on drop failed: {}", e);
        }
    }
}

impl Core {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CameraError::InvalidState("device is closed".into()));
        }
        Ok(())
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_threads(&self) -> MutexGuard<'_, Threads> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_health(&self) -> MutexGuard<'_, Vec<Arc<StageHealth>>> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_streams(&self) -> MutexGuard<'_, Vec<StreamConfig>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn configure_streams(self: &Arc<Self>, streams: &[StreamConfig]) -> Result<()> {
        self.ensure_open()?;
        let _lifecycle = self.lock_lifecycle();

        match self.state.current() {
            DeviceState::Initialized | DeviceState::Configured => {}
            DeviceState::Start | DeviceState::Run => {
                tracing::info!("Reconfiguring while streaming, flushing first");
                self.flush_locked()?;
            }
            state => {
                return Err(CameraError::InvalidState(format!(
                    "cannot configure streams in state {}",
                    state
                )))
            }
        }

        validate_streams(streams)?;
        self.reconfiguring.store(true, Ordering::Release);
        let applied = self.apply_streams(streams);
        self.reconfiguring.store(false, Ordering::Release);
        applied?;

        self.state.transition(DeviceState::Configured)?;
        Ok(())
    }

    fn apply_streams(&self, streams: &[StreamConfig]) -> Result<()> {
        self.requests.set_streams(streams)?;

        let yuv_size = streams
            .iter()
            .filter(|s| s.kind.is_preview_path())
            .map(|s| s.frame_size())
            .max();
        if let Some(size) = yuv_size {
            let mut settings = *self.ctx.config().pools.get(PoolKind::Yuv);
            settings.buffer_size = size;
            self.ctx.pool(PoolKind::Yuv).reconfigure(settings)?;
            self.ctx
                .update_config(|c| *c.pools.get_mut(PoolKind::Yuv) = settings);
        }

        let reprocessing = streams
            .iter()
            .any(|s| matches!(s.kind, StreamKind::Capture | StreamKind::Input));
        self.reprocessing.store(reprocessing, Ordering::Release);
        *self.lock_streams() = streams.to_vec();
        tracing::info!(
            "Configured {} streams (reprocessing {})",
            streams.len(),
            if reprocessing { "on" } else { "off" }
        );
        Ok(())
    }

    fn submit_request(self: &Arc<Self>, request: Request) -> Result<()> {
        self.ensure_open()?;
        let _lifecycle = self.lock_lifecycle();

        let state = self.state.current();
        if !state.accepts_requests() || self.flushing.load(Ordering::Acquire) {
            return Err(CameraError::InvalidState(format!(
                "requests are not accepted in state {}",
                state
            )));
        }

        let number = self.requests.register_request(request)?;
        if state == DeviceState::Configured {
            if let Err(e) = self.start() {
                tracing::error!("[R{}] streaming failed to start: {}", number, e);
                self.requests.flush_pending();
                return Err(e);
            }
        }
        Ok(())
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        self.state.transition(DeviceState::Start)?;
        if let Err(e) = self.spawn_threads() {
            self.stop_threads();
            self.state.transition(DeviceState::Flush)?;
            self.state.transition(DeviceState::Configured)?;
            return Err(e);
        }
        self.state.transition(DeviceState::Run)?;
        Ok(())
    }

    fn spawn_threads(self: &Arc<Self>) -> Result<()> {
        let cfg = self.ctx.config();
        self.stop.store(false, Ordering::Release);
        self.factory.rearm_queues();
        self.selector.resume();
        self.sensor_frames.store(0, Ordering::Relaxed);

        let routing = self.factory.routing();
        let every_stage = StageSet::of(&StageKind::ALL);
        let (shot_tx, shot_rx) = crossbeam_channel::unbounded();
        let mut threads = self.lock_threads();
        let mut health = Vec::new();

        for head in StageKind::ALL {
            if routing.is_chained(head, every_stage)
                || (head == StageKind::Reprocessing && !self.reprocessing.load(Ordering::Acquire))
                || (head == StageKind::Dump && !routing.dump)
            {
                continue;
            }
            let mut handlers = BTreeMap::new();
            for stage in routing.chain(head, every_stage) {
                let handler = self
                    .registry
                    .create(cfg.stages.handlers.get(stage), &cfg)?;
                handlers.insert(stage, handler);
            }

            let stage_health = Arc::new(StageHealth::new(head));
            let mut worker = StageWorker::new(
                head,
                handlers,
                self.factory.clone(),
                self.selector.clone(),
                stage_health.clone(),
                self.stop.clone(),
                cfg.stages.pop_timeout(),
                cfg.selector.max_retries,
            );
            if head == StageKind::Sensor {
                worker = worker.with_shot_sender(shot_tx.clone());
            }
            threads.workers.push(worker.spawn()?);
            health.push(stage_health);
        }
        drop(shot_tx);
        *self.lock_health() = health.clone();

        threads.scheduler = Some(scheduler::spawn(self.clone(), shot_rx)?);

        if cfg.monitor.enabled {
            let (tx, rx) = crossbeam_channel::bounded(1);
            let hooks = Arc::new(CoreHooks(Arc::downgrade(self)));
            let handle = Monitor::new(cfg.monitor.clone(), health, hooks).spawn(rx)?;
            threads.monitor = Some((tx, handle));
        }
        tracing::info!("Streaming started with {} stage workers", threads.workers.len());
        Ok(())
    }

    /// Stop and join every pipeline thread. Frames stay in the table.
    fn stop_threads(&self) {
        self.stop.store(true, Ordering::Release);
        self.selector.cancel();
        self.factory.release_queues();

        let mut threads = self.lock_threads();
        if let Some((tx, handle)) = threads.monitor.take() {
            let _ = tx.send(());
            if handle.join().is_err() {
                tracing::error!("Monitor thread panicked");
            }
        }
        if let Some(handle) = threads.scheduler.take() {
            if handle.join().is_err() {
                tracing::error!("Scheduler thread panicked");
            }
        }
        for handle in threads.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Stage worker panicked");
            }
        }
        drop(threads);

        let stale = self.factory.release_queues();
        if !stale.is_empty() {
            tracing::debug!("Dropped {} queued frame entries", stale.len());
        }
    }

    fn flush(self: &Arc<Self>) -> Result<()> {
        self.ensure_open()?;
        let _lifecycle = self.lock_lifecycle();
        self.flush_locked()
    }

    fn flush_locked(self: &Arc<Self>) -> Result<()> {
        match self.state.current() {
            DeviceState::Initialized => return Ok(()),
            DeviceState::Start => {
                if !self
                    .state
                    .wait_until(START_WAIT, |s| s != DeviceState::Start)
                {
                    tracing::warn!("Device still starting, flushing anyway");
                }
            }
            DeviceState::Open | DeviceState::Error | DeviceState::Flush => {
                return Err(CameraError::InvalidState(format!(
                    "cannot flush in state {}",
                    self.state.current()
                )));
            }
            DeviceState::Configured | DeviceState::Run => {}
        }

        self.state.transition(DeviceState::Flush)?;
        tracing::info!("Flush started");
        self.drain_pipeline();
        self.state.transition(DeviceState::Configured)?;
        tracing::info!("Flush done");
        Ok(())
    }

    /// Stop streaming and give every frame and request its terminal state.
    fn drain_pipeline(&self) {
        self.flushing.store(true, Ordering::Release);
        self.stop_threads();

        for fc in self.factory.table().counts() {
            self.factory.abort_frame(fc, "flushed");
        }
        for fc in self.factory.table().counts() {
            if let Some(mut frame) = self.factory.table().remove(fc) {
                tracing::warn!("[{}] left behind by flush, releasing", fc);
                self.ctx.release_buffers(frame.take_buffers());
            }
        }

        // Requests that never got a frame get a failed placeholder
        while let Some(plan) = self.requests.pop_service() {
            let frames = self.build_request_frames(&plan, crate::pipeline::id::FrameCount::INVALID);
            for (fc, _) in frames {
                self.factory.abort_frame(fc, "flushed before scheduling");
            }
        }
        let flushed = self.requests.flush_pending();
        if flushed > 0 {
            tracing::debug!("{} requests terminated by flush", flushed);
        }

        let cleared = self.selector.clear();
        self.selector.resume();
        if cleared > 0 {
            tracing::debug!("Released {} held raws", cleared);
        }
        for (kind, leaked) in self.ctx.reset_pools() {
            tracing::error!("Pool {} leaked {} buffers", kind, leaked);
            self.counters.leaked.fetch_add(leaked as u64, Ordering::Relaxed);
        }
        self.flushing.store(false, Ordering::Release);
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _lifecycle = self.lock_lifecycle();
        self.drain_pipeline();
        let stats = self.stats();
        tracing::info!(
            "Device closed: {} frames completed, {} failed",
            stats.frames_completed,
            stats.frames_failed
        );
        Ok(())
    }

    /// Watchdog trip: report, stop streaming and apply the fatal policy.
    fn on_fatal(&self, reason: CameraError) {
        if self.flushing.load(Ordering::Acquire) {
            return;
        }
        tracing::error!("Fatal device error: {}", reason);
        self.requests.emit_device_error();
        if let Err(e) = self.state.transition(DeviceState::Error) {
            tracing::warn!("Fatal error could not move the device to Error: {}", e);
        }

        self.stop.store(true, Ordering::Release);
        self.selector.cancel();
        self.factory.release_queues();

        if self.ctx.config().monitor.fatal_policy == FatalPolicy::Abort {
            tracing::error!("Aborting process");
            std::process::abort();
        }
    }

    fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            state: self.state.current(),
            frames_client: c.client.load(Ordering::Relaxed),
            frames_internal: c.internal.load(Ordering::Relaxed),
            frames_capture: c.capture.load(Ordering::Relaxed),
            frames_completed: c.completed.load(Ordering::Relaxed),
            frames_failed: c.failed.load(Ordering::Relaxed),
            frames_in_flight: self.factory.table().len(),
            buffers_leaked: c.leaked.load(Ordering::Relaxed),
            stages: self.lock_health().iter().map(|h| h.snapshot()).collect(),
            pools: self.ctx.pool_stats(),
            selector: self.selector.stats(),
            pending_requests: self.requests.pending_len(),
            queued_requests: self.requests.service_len(),
        }
    }
}

fn validate_streams(streams: &[StreamConfig]) -> Result<()> {
    if streams.is_empty() {
        return Err(CameraError::InvalidArgument("empty stream set".into()));
    }
    let mut ids = BTreeSet::new();
    let mut inputs = 0;
    for stream in streams {
        if !ids.insert(stream.id) {
            return Err(CameraError::InvalidArgument(format!(
                "duplicate stream {}",
                stream.id
            )));
        }
        if stream.width == 0 || stream.height == 0 || stream.max_buffers == 0 {
            return Err(CameraError::InvalidArgument(format!(
                "stream {} has zero size or buffer count",
                stream.id
            )));
        }
        if stream.kind == StreamKind::Input {
            inputs += 1;
        }
    }
    if inputs > 1 {
        return Err(CameraError::InvalidArgument(
            "at most one input stream is supported".into(),
        ));
    }
    if inputs == streams.len() {
        return Err(CameraError::InvalidArgument("no output stream".into()));
    }
    Ok(())
}
