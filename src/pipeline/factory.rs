//! Frame construction, stage routing and stage-to-stage handoff.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────── FrameTable (Mutex<BTreeMap<FrameCount, Frame>>) ───────────┐
//!              │                                                                        │
//! scheduler ──► create_frame ──► push_to_stage(Sensor) ──► [sensor queue] ──► worker ──► complete_chain
//!                                                                                         │
//!                         push_to_stage(next head) ◄──────────────────────────────────────┘
//! ```
//!
//! Queues carry frame counts only; the frame itself stays in the table. Pool
//! buffers for a stage are acquired when the frame is pushed to it, without
//! holding the table lock, and bound into the frame's ledger afterwards.
//!
//! Hardware stages linked on-the-fly form a chain that runs on the worker of
//! the chain head. Only the head owns a requested entity.

use crate::buffer::{BufferHandle, BufferId, PoolKind};
use crate::config::StagesConfig;
use crate::context::PipelineContext;
use crate::error::{CameraError, Result};
use crate::pipeline::frame::{ClientOutput, Frame};
use crate::pipeline::id::{FrameCount, StreamId};
use crate::pipeline::node::StageJob;
use crate::pipeline::queue::StageQueue;
use crate::pipeline::selector::HeldRaw;
use crate::types::{EntityState, FrameType, Metadata, StageKind, StageLink, StageSet};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

/// Hardware stages in processing order
pub const MAIN_CHAIN: [StageKind; 4] = [
    StageKind::Sensor,
    StageKind::Stats3a,
    StageKind::Isp,
    StageKind::Scaler,
];

/// Receives frame progress from whichever thread produced it.
pub trait FrameListener: Send + Sync {
    /// One stage of a frame finished (successfully or not)
    fn stage_done(&self, frame: FrameCount, stage: StageKind, ok: bool);

    /// The frame's completion predicate became true. Called exactly once.
    fn frame_complete(&self, frame: FrameCount);
}

// ==================== Frame Table ====================

/// In-flight frames keyed by frame count.
#[derive(Debug, Default)]
pub struct FrameTable {
    frames: Mutex<BTreeMap<FrameCount, Frame>>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<FrameCount, Frame>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert unless a frame with the same count is tracked. Returns whether
    /// the frame was inserted.
    pub fn insert(&self, frame: Frame) -> bool {
        let mut frames = self.lock();
        if frames.contains_key(&frame.count()) {
            return false;
        }
        frames.insert(frame.count(), frame);
        true
    }

    /// Run `f` on a tracked frame under the table lock
    pub fn with<R>(&self, count: FrameCount, f: impl FnOnce(&mut Frame) -> R) -> Option<R> {
        self.lock().get_mut(&count).map(f)
    }

    pub fn remove(&self, count: FrameCount) -> Option<Frame> {
        self.lock().remove(&count)
    }

    pub fn contains(&self, count: FrameCount) -> bool {
        self.lock().contains_key(&count)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Tracked frame counts in ascending order
    pub fn counts(&self) -> Vec<FrameCount> {
        self.lock().keys().copied().collect()
    }
}

// ==================== Routing ====================

/// Which stages a frame visits and how they are grouped into worker chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRouting {
    pub sensor_3aa: StageLink,
    pub stats3a_isp: StageLink,
    pub isp_scaler: StageLink,
    pub dump: bool,
}

impl StageRouting {
    pub fn from_config(stages: &StagesConfig, dump: bool) -> Self {
        Self {
            sensor_3aa: stages.sensor_3aa,
            stats3a_isp: stages.stats3a_isp,
            isp_scaler: stages.isp_scaler,
            dump,
        }
    }

    /// Link from `stage` to its main-chain successor
    pub fn link_after(&self, stage: StageKind) -> Option<StageLink> {
        match stage {
            StageKind::Sensor => Some(self.sensor_3aa),
            StageKind::Stats3a => Some(self.stats3a_isp),
            StageKind::Isp => Some(self.isp_scaler),
            _ => None,
        }
    }

    pub fn successor(stage: StageKind) -> Option<StageKind> {
        let pos = MAIN_CHAIN.iter().position(|s| *s == stage)?;
        MAIN_CHAIN.get(pos + 1).copied()
    }

    pub fn predecessor(stage: StageKind) -> Option<StageKind> {
        let pos = MAIN_CHAIN.iter().position(|s| *s == stage)?;
        pos.checked_sub(1).map(|p| MAIN_CHAIN[p])
    }

    /// Stages a frame of this type runs
    pub fn plan_for(&self, frame_type: FrameType, has_outputs: bool) -> StageSet {
        match frame_type {
            FrameType::Capture => StageSet::of(&[StageKind::Reprocessing]),
            FrameType::Client | FrameType::Internal => {
                let mut plan = StageSet::of(&[StageKind::Sensor, StageKind::Stats3a, StageKind::Isp]);
                if frame_type == FrameType::Client && has_outputs {
                    plan.insert(StageKind::Scaler);
                }
                if self.dump {
                    plan.insert(StageKind::Dump);
                }
                plan
            }
        }
    }

    /// True when `stage` runs inside its predecessor's chain for this plan
    pub fn is_chained(&self, stage: StageKind, plan: StageSet) -> bool {
        match Self::predecessor(stage) {
            Some(prev) => plan.contains(prev) && self.link_after(prev) == Some(StageLink::Otf),
            None => false,
        }
    }

    /// Stage owning the worker (and entity) that runs `stage`
    pub fn head_of(&self, stage: StageKind, plan: StageSet) -> StageKind {
        let mut head = stage;
        while self.is_chained(head, plan) {
            match Self::predecessor(head) {
                Some(prev) => head = prev,
                None => break,
            }
        }
        head
    }

    /// Plan stages that own a requested entity
    pub fn requested_for(&self, plan: StageSet) -> StageSet {
        let mut requested = plan;
        for stage in plan.iter() {
            if self.is_chained(stage, plan) {
                requested.remove(stage);
            }
        }
        requested
    }

    /// `head` followed by every planned stage chained behind it
    pub fn chain(&self, head: StageKind, plan: StageSet) -> Vec<StageKind> {
        let mut chain = vec![head];
        let mut current = head;
        while let Some(next) = Self::successor(current) {
            if plan.contains(next) && self.is_chained(next, plan) {
                chain.push(next);
                current = next;
            } else {
                break;
            }
        }
        chain
    }

    /// Heads to push to once `head`'s chain is done
    pub fn next_heads(&self, head: StageKind, plan: StageSet) -> Vec<StageKind> {
        let mut next = Vec::new();
        let last = self.chain(head, plan).last().copied().unwrap_or(head);
        if let Some(succ) = Self::successor(last) {
            if plan.contains(succ) {
                next.push(succ);
            }
        }
        if head == StageKind::Sensor && plan.contains(StageKind::Dump) {
            next.push(StageKind::Dump);
        }
        next
    }

    /// Stages that read the pool buffer `stage` writes
    pub fn readers(&self, stage: StageKind, plan: StageSet) -> StageSet {
        let mut readers = StageSet::empty();
        match stage {
            StageKind::Sensor => {
                for reader in [StageKind::Stats3a, StageKind::Dump] {
                    if plan.contains(reader) {
                        readers.insert(reader);
                    }
                }
            }
            StageKind::Stats3a | StageKind::Isp => {
                if let Some(succ) = Self::successor(stage) {
                    if plan.contains(succ) {
                        readers.insert(succ);
                    }
                }
            }
            _ => {}
        }
        readers
    }

    /// Pool that `stage` draws its destination buffer from, if any
    pub fn dst_pool(&self, stage: StageKind, plan: StageSet) -> Option<PoolKind> {
        let separate_successor = |stage: StageKind| {
            Self::successor(stage)
                .map(|succ| plan.contains(succ) && self.link_after(stage) == Some(StageLink::M2m))
                .unwrap_or(false)
        };
        match stage {
            StageKind::Sensor => Some(PoolKind::Raw),
            StageKind::Stats3a if separate_successor(stage) => Some(PoolKind::Bayer),
            StageKind::Isp if separate_successor(stage) => Some(PoolKind::Yuv),
            StageKind::Dump => Some(PoolKind::Dump),
            _ => None,
        }
    }

    /// Stages that cannot run once `stage` failed
    pub fn downstream_of(&self, stage: StageKind, plan: StageSet) -> StageSet {
        let mut failed = StageSet::of(&[stage]);
        let mut current = stage;
        while let Some(next) = Self::successor(current) {
            if plan.contains(next) {
                failed.insert(next);
            }
            current = next;
        }
        if stage == StageKind::Sensor && plan.contains(StageKind::Dump) {
            failed.insert(StageKind::Dump);
        }
        failed
    }
}

// ==================== Factory ====================

/// Result of running one chain of handlers.
#[derive(Debug)]
pub struct ChainOutcome {
    pub metadata: Metadata,
    /// First failing stage and why
    pub fault: Option<(StageKind, String)>,
}

/// Jobs for one chain, ready to hand to the handlers.
#[derive(Debug)]
pub struct ChainWork {
    pub jobs: Vec<StageJob>,
    pub controls: Metadata,
}

pub struct FrameFactory {
    ctx: Arc<PipelineContext>,
    table: Arc<FrameTable>,
    routing: RwLock<StageRouting>,
    queues: Vec<Arc<StageQueue<FrameCount>>>,
    listener: Arc<dyn FrameListener>,
    /// Bounded wait for a stage buffer during a push
    acquire_timeout: Duration,
}

impl FrameFactory {
    pub fn new(
        ctx: Arc<PipelineContext>,
        table: Arc<FrameTable>,
        listener: Arc<dyn FrameListener>,
    ) -> Self {
        let config = ctx.config();
        let routing = StageRouting::from_config(&config.stages, config.dump.enabled);
        let queues = StageKind::ALL
            .iter()
            .map(|s| Arc::new(StageQueue::new(s.name(), config.stages.queue_capacity)))
            .collect();
        let acquire_timeout = config.pools.acquire_timeout();
        Self {
            ctx,
            table,
            routing: RwLock::new(routing),
            queues,
            listener,
            acquire_timeout,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn routing(&self) -> StageRouting {
        *self.routing.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the routing. Only valid while no frame is in flight.
    pub fn set_routing(&self, routing: StageRouting) -> Result<()> {
        if !self.table.is_empty() {
            return Err(CameraError::InvalidState(format!(
                "cannot reroute with {} frames in flight",
                self.table.len()
            )));
        }
        *self.routing.write().unwrap_or_else(|e| e.into_inner()) = routing;
        Ok(())
    }

    pub fn table(&self) -> &Arc<FrameTable> {
        &self.table
    }

    pub fn queue(&self, stage: StageKind) -> &Arc<StageQueue<FrameCount>> {
        &self.queues[stage.index()]
    }

    /// Plan for a new frame under the current routing
    pub fn plan_for(&self, frame_type: FrameType, has_outputs: bool) -> StageSet {
        self.routing().plan_for(frame_type, has_outputs)
    }

    /// Create and track a frame. An already tracked frame with the same count
    /// is reused; returns whether a new frame was created.
    pub fn create_frame(&self, count: FrameCount, frame_type: FrameType, plan: StageSet) -> bool {
        let requested = self.routing().requested_for(plan);
        let created = self
            .table
            .insert(Frame::new(count, frame_type, plan, requested));
        if created {
            tracing::trace!("[{}] created {} frame, stages {:?}", count, frame_type, requested);
        } else {
            tracing::debug!("[{}] already tracked, reusing", count);
        }
        created
    }

    pub fn with_frame<R>(&self, count: FrameCount, f: impl FnOnce(&mut Frame) -> R) -> Result<R> {
        self.table
            .with(count, f)
            .ok_or_else(|| CameraError::InvalidArgument(format!("[{}] not tracked", count)))
    }

    /// Toggle a stage before the frame's first push
    pub fn set_stage_request(&self, count: FrameCount, stage: StageKind, requested: bool) -> Result<()> {
        self.with_frame(count, |frame| frame.set_stage_request(stage, requested))?
    }

    /// Bind a caller buffer to the stage that produces it
    pub fn bind_output(
        &self,
        count: FrameCount,
        producer: StageKind,
        stream: StreamId,
        handle: BufferHandle,
    ) -> Result<()> {
        let routing = self.routing();
        self.with_frame(count, |frame| {
            let owner = routing.head_of(producer, frame.plan());
            frame.add_output(ClientOutput {
                stream,
                handle,
                producer,
                owner,
            });
        })
    }

    /// Give a capture frame the raw the selector picked
    pub fn attach_source(&self, count: FrameCount, held: HeldRaw) -> Result<()> {
        let buffer = held.buffer;
        let attached = self.table.with(count, |frame| {
            frame.bind_src(StageKind::Reprocessing, buffer);
            frame.own_buffer(buffer, StageSet::of(&[StageKind::Reprocessing]), false);
            frame.set_source(held);
        });
        if attached.is_none() {
            self.ctx.release_buffer(buffer);
            return Err(CameraError::InvalidArgument(format!("[{}] not tracked", count)));
        }
        Ok(())
    }

    /// Acquire the stage's buffers and enqueue the frame on its queue.
    ///
    /// Buffer starvation fails this stage (and everything depending on it)
    /// for this frame only; the error is returned for logging.
    pub fn push_to_stage(&self, count: FrameCount, stage: StageKind) -> Result<()> {
        let routing = self.routing();
        let plan = self.with_frame(count, |frame| {
            match frame.state(stage) {
                EntityState::Requested => Ok(frame.plan()),
                state => Err(CameraError::InvalidState(format!(
                    "[{}] cannot push to {} in state {:?}",
                    count, stage, state
                ))),
            }
        })??;

        let timeout = self.acquire_timeout;
        let mut acquired: Vec<(StageKind, BufferId)> = Vec::new();
        for s in routing.chain(stage, plan) {
            let Some(pool) = routing.dst_pool(s, plan) else {
                continue;
            };
            match self.ctx.pool(pool).acquire_timeout(timeout) {
                Ok((id, _)) => acquired.push((s, id)),
                Err(e) => {
                    tracing::warn!("[{}] {} starved: {}", count, s, e);
                    self.ctx.release_buffers(acquired.iter().map(|(_, id)| *id));
                    self.fail_stage(count, s, &e.to_string());
                    return Err(e);
                }
            }
        }

        let bound = self.table.with(count, |frame| {
            for (s, id) in &acquired {
                frame.add_dst(*s, *id);
                let readers = routing.readers(*s, plan);
                let mut consumers = StageSet::of(&[routing.head_of(*s, plan)]);
                for reader in readers.iter() {
                    frame.bind_src(reader, *id);
                    consumers.insert(routing.head_of(reader, plan));
                }
                frame.own_buffer(*id, consumers, id.pool == PoolKind::Raw);
            }
            frame.mark_pushed();
        });
        if bound.is_none() {
            self.ctx.release_buffers(acquired.iter().map(|(_, id)| *id));
            return Err(CameraError::InvalidArgument(format!("[{}] vanished before push", count)));
        }

        tracing::trace!("[{}] -> {} queue", count, stage);
        self.queue(stage).push(count);
        Ok(())
    }

    /// Mark `head` processing and build the jobs of its chain. `None` if the
    /// frame is gone or the entity no longer waits for this stage.
    pub fn begin_chain(&self, count: FrameCount, head: StageKind) -> Option<ChainWork> {
        let routing = self.routing();
        let snapshot = self.table.with(count, |frame| {
            if frame.state(head) != EntityState::Requested {
                return None;
            }
            frame.set_entity_state(head, EntityState::Processing).ok()?;
            let plan = frame.plan();
            let stages: Vec<_> = routing
                .chain(head, plan)
                .into_iter()
                .map(|s| {
                    let entity = frame.entity(s);
                    let outputs: Vec<_> = frame
                        .outputs()
                        .iter()
                        .filter(|o| o.producer == s)
                        .map(|o| (o.stream, o.handle))
                        .collect();
                    (s, entity.src(), entity.dsts().to_vec(), outputs)
                })
                .collect();
            Some((frame.frame_type(), frame.input(), frame.metadata().clone(), stages))
        })??;

        let (frame_type, input, controls, stages) = snapshot;
        let timestamp_ns = self.ctx.now_ns();
        let mut jobs = Vec::with_capacity(stages.len());
        for (stage, src, dsts, outputs) in stages {
            let resolve = |id: BufferId| match self.ctx.buffer(id) {
                Ok(buffer) => Some(buffer),
                Err(e) => {
                    tracing::warn!("[{}] {}: {}", count, stage, e);
                    None
                }
            };
            jobs.push(StageJob {
                frame: count,
                frame_type,
                stage,
                src: src.and_then(resolve),
                dsts: dsts.into_iter().filter_map(resolve).collect(),
                outputs,
                input: if stage == StageKind::Reprocessing { input } else { None },
                timestamp_ns,
            });
        }
        Some(ChainWork { jobs, controls })
    }

    /// Record a chain's outcome, notify the listener and push the frame on.
    pub fn complete_chain(&self, count: FrameCount, head: StageKind, outcome: ChainOutcome) {
        let routing = self.routing();
        let ChainOutcome { metadata, fault } = outcome;

        let updated = self.table.with(count, |frame| {
            let plan = frame.plan();
            frame.metadata_mut().merge(&metadata);
            if let Some(ts) = metadata.get_int("sensor.timestamp") {
                frame.set_timestamp_ns(ts as u64);
            }

            let mut freed = Vec::new();
            match &fault {
                None => {
                    if let Err(e) = frame.set_entity_state(head, EntityState::Complete) {
                        tracing::warn!("{}", e);
                    }
                    freed.extend(frame.consume(head));
                }
                Some((stage, reason)) => {
                    let failed = frame.fail_stages(routing.downstream_of(head, plan), reason);
                    tracing::warn!("[{}] {} failed: {} (skipping {:?})", count, stage, reason, failed);
                    for s in failed.iter() {
                        freed.extend(frame.consume(s));
                    }
                }
            }
            (plan, freed, frame.take_completion())
        });

        let Some((plan, freed, completed)) = updated else {
            tracing::warn!("[{}] finished {} but frame is no longer tracked", count, head);
            return;
        };
        self.ctx.release_buffers(freed);

        let failed_at = fault.as_ref().map(|(s, _)| *s);
        for stage in routing.chain(head, plan) {
            let ok = match failed_at {
                None => true,
                Some(f) => MAIN_CHAIN.iter().position(|s| *s == stage)
                    < MAIN_CHAIN.iter().position(|s| *s == f),
            };
            self.listener.stage_done(count, stage, ok);
        }

        if completed {
            self.listener.frame_complete(count);
            return;
        }

        if fault.is_none() {
            for next in routing.next_heads(head, plan) {
                if let Err(e) = self.push_to_stage(count, next) {
                    tracing::debug!("[{}] push to {} failed: {}", count, next, e);
                }
            }
        }
    }

    /// Fail `stage` and everything depending on it for one frame.
    /// Returns whether this completed the frame.
    pub fn fail_stage(&self, count: FrameCount, stage: StageKind, reason: &str) -> bool {
        let routing = self.routing();
        let updated = self.table.with(count, |frame| {
            let plan = frame.plan();
            let head = routing.head_of(stage, plan);
            let failed = frame.fail_stages(routing.downstream_of(head, plan), reason);
            let mut freed = Vec::new();
            for s in failed.iter() {
                freed.extend(frame.consume(s));
            }
            (failed, freed, frame.take_completion())
        });

        let Some((failed, freed, completed)) = updated else {
            return false;
        };
        self.ctx.release_buffers(freed);
        for s in failed.iter() {
            self.listener.stage_done(count, s, false);
        }
        if completed {
            self.listener.frame_complete(count);
        }
        completed
    }

    /// Fail every unfinished entity of a frame (teardown path).
    pub fn abort_frame(&self, count: FrameCount, reason: &str) -> bool {
        let updated = self.table.with(count, |frame| {
            let requested = frame.requested();
            frame.fail_stages(requested, reason);
            frame.take_completion()
        });
        match updated {
            Some(true) => {
                self.listener.frame_complete(count);
                true
            }
            _ => false,
        }
    }

    /// Drain every stage queue and wake its waiters
    pub fn release_queues(&self) -> Vec<FrameCount> {
        let mut drained = Vec::new();
        for queue in &self.queues {
            drained.extend(queue.release());
        }
        drained
    }

    /// Drop stale wake tokens before workers restart
    pub fn rearm_queues(&self) {
        for queue in &self.queues {
            queue.clear_wakeups();
        }
    }

    pub fn queue_depths(&self) -> Vec<(StageKind, usize)> {
        StageKind::ALL
            .iter()
            .map(|s| (*s, self.queue(*s).len()))
            .collect()
    }
}
