//! The unit of pipeline work.
//!
//! A [`Frame`] holds one [`StageEntity`] per stage kind. Only the entities
//! marked requested take part in the completion predicate; stages chained
//! on-the-fly behind another stage run inside that stage's entity and stay
//! `NotRequested`.
//!
//! Buffer ownership is tracked in a per-frame ledger: every pool buffer the
//! frame holds records which entities still consume it. When the last
//! consumer finishes the buffer is handed back to the caller for release.
//! Retained buffers (the sensor raw, a hold-list candidate) stay in the
//! ledger until the frame completes.

use crate::buffer::{BufferHandle, BufferId};
use crate::error::{CameraError, Result};
use crate::pipeline::id::{FrameCount, StreamId};
use crate::pipeline::selector::{HeldRaw, SelectTarget};
use crate::types::{BufferStatus, EntityState, FrameType, Metadata, StageKind, StageSet};
use std::collections::BTreeMap;
use std::time::Instant;

/// One stage's view of a frame.
#[derive(Debug, Clone)]
pub struct StageEntity {
    pub stage: StageKind,
    state: EntityState,
    src: Option<BufferId>,
    dsts: Vec<BufferId>,
    fault: Option<String>,
    started_at: Option<Instant>,
}

impl StageEntity {
    fn new(stage: StageKind) -> Self {
        Self {
            stage,
            state: EntityState::NotRequested,
            src: None,
            dsts: Vec::new(),
            fault: None,
            started_at: None,
        }
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn src(&self) -> Option<BufferId> {
        self.src
    }

    pub fn dsts(&self) -> &[BufferId] {
        &self.dsts
    }

    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }
}

/// A caller buffer this frame fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOutput {
    pub stream: StreamId,
    pub handle: BufferHandle,
    /// Stage whose handler writes it
    pub producer: StageKind,
    /// Requested entity whose outcome decides its status
    pub owner: StageKind,
}

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    consumers: StageSet,
    retain: bool,
}

#[derive(Debug)]
pub struct Frame {
    count: FrameCount,
    frame_type: FrameType,
    plan: StageSet,
    entities: [StageEntity; StageKind::COUNT],
    request: Option<u32>,
    metadata: Metadata,
    timestamp_ns: Option<u64>,
    outputs: Vec<ClientOutput>,
    input: Option<(StreamId, BufferHandle)>,
    capture_target: Option<SelectTarget>,
    source: Option<HeldRaw>,
    ledger: BTreeMap<BufferId, LedgerEntry>,
    pushed: bool,
    completed: bool,
    created_at: Instant,
}

impl Frame {
    /// `plan` is every stage that will run; `requested` the subset owning an
    /// entity in the completion predicate.
    pub fn new(count: FrameCount, frame_type: FrameType, plan: StageSet, requested: StageSet) -> Self {
        let mut entities = StageKind::ALL.map(StageEntity::new);
        for stage in requested.iter() {
            entities[stage.index()].state = EntityState::Requested;
        }
        Self {
            count,
            frame_type,
            plan,
            entities,
            request: None,
            metadata: Metadata::new(),
            timestamp_ns: None,
            outputs: Vec::new(),
            input: None,
            capture_target: None,
            source: None,
            ledger: BTreeMap::new(),
            pushed: false,
            completed: false,
            created_at: Instant::now(),
        }
    }

    pub fn count(&self) -> FrameCount {
        self.count
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn plan(&self) -> StageSet {
        self.plan
    }

    /// Stages holding a requested entity
    pub fn requested(&self) -> StageSet {
        let mut set = StageSet::empty();
        for entity in &self.entities {
            if entity.state.is_requested() {
                set.insert(entity.stage);
            }
        }
        set
    }

    pub fn entity(&self, stage: StageKind) -> &StageEntity {
        &self.entities[stage.index()]
    }

    pub fn state(&self, stage: StageKind) -> EntityState {
        self.entities[stage.index()].state
    }

    pub fn request(&self) -> Option<u32> {
        self.request
    }

    pub fn set_request(&mut self, frame_number: u32) {
        self.request = Some(frame_number);
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn timestamp_ns(&self) -> Option<u64> {
        self.timestamp_ns
    }

    pub fn set_timestamp_ns(&mut self, ts: u64) {
        self.timestamp_ns = Some(ts);
    }

    pub fn outputs(&self) -> &[ClientOutput] {
        &self.outputs
    }

    pub fn add_output(&mut self, output: ClientOutput) {
        self.outputs.push(output);
    }

    pub fn input(&self) -> Option<(StreamId, BufferHandle)> {
        self.input
    }

    pub fn set_input(&mut self, stream: StreamId, handle: BufferHandle) {
        self.input = Some((stream, handle));
    }

    pub fn capture_target(&self) -> Option<SelectTarget> {
        self.capture_target
    }

    pub fn set_capture_target(&mut self, target: SelectTarget) {
        self.capture_target = Some(target);
    }

    /// The held raw a capture frame was given
    pub fn source(&self) -> Option<&HeldRaw> {
        self.source.as_ref()
    }

    pub fn set_source(&mut self, held: HeldRaw) {
        self.source = Some(held);
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn is_pushed(&self) -> bool {
        self.pushed
    }

    pub fn mark_pushed(&mut self) {
        self.pushed = true;
    }

    /// Toggle a stage before the frame enters its first queue.
    pub fn set_stage_request(&mut self, stage: StageKind, requested: bool) -> Result<()> {
        if self.pushed {
            return Err(CameraError::InvalidState(format!(
                "[{}] stage {} toggled after first push",
                self.count, stage
            )));
        }
        let entity = &mut self.entities[stage.index()];
        entity.state = if requested {
            EntityState::Requested
        } else {
            EntityState::NotRequested
        };
        if requested {
            self.plan.insert(stage);
        } else {
            self.plan.remove(stage);
        }
        Ok(())
    }

    /// Advance a stage-entity's state machine.
    pub fn set_entity_state(&mut self, stage: StageKind, next: EntityState) -> Result<()> {
        let count = self.count;
        let entity = &mut self.entities[stage.index()];
        let allowed = matches!(
            (entity.state, next),
            (EntityState::Requested, EntityState::Processing)
                | (EntityState::Requested, EntityState::Complete)
                | (EntityState::Requested, EntityState::Error)
                | (EntityState::Processing, EntityState::Complete)
                | (EntityState::Processing, EntityState::Error)
        );
        if !allowed {
            return Err(CameraError::InvalidState(format!(
                "[{}] {} entity cannot go {:?} -> {:?}",
                count, stage, entity.state, next
            )));
        }
        if next == EntityState::Processing {
            entity.started_at = Some(Instant::now());
        }
        entity.state = next;
        Ok(())
    }

    /// Mark every requested, unfinished entity in `stages` as failed.
    /// Returns the stages that changed.
    pub fn fail_stages(&mut self, stages: StageSet, reason: &str) -> StageSet {
        let mut failed = StageSet::empty();
        for stage in stages.iter() {
            let entity = &mut self.entities[stage.index()];
            if entity.state.is_requested() && !entity.state.is_done() {
                entity.state = EntityState::Error;
                entity.fault = Some(reason.to_string());
                failed.insert(stage);
            }
        }
        failed
    }

    pub fn bind_src(&mut self, stage: StageKind, id: BufferId) {
        self.entities[stage.index()].src = Some(id);
    }

    pub fn add_dst(&mut self, stage: StageKind, id: BufferId) {
        self.entities[stage.index()].dsts.push(id);
    }

    /// Take ownership of a pool buffer on behalf of `consumers`.
    pub fn own_buffer(&mut self, id: BufferId, consumers: StageSet, retain: bool) {
        self.ledger.insert(id, LedgerEntry { consumers, retain });
    }

    /// `stage` is done with its buffers; returns those nobody needs anymore.
    pub fn consume(&mut self, stage: StageKind) -> Vec<BufferId> {
        let mut freed = Vec::new();
        for (id, entry) in self.ledger.iter_mut() {
            entry.consumers.remove(stage);
            if entry.consumers.is_empty() && !entry.retain {
                freed.push(*id);
            }
        }
        for id in &freed {
            self.ledger.remove(id);
        }
        freed
    }

    /// Drop `id` from the ledger without releasing it (ownership moves on).
    pub fn detach_buffer(&mut self, id: BufferId) -> bool {
        self.ledger.remove(&id).is_some()
    }

    pub fn owns(&self, id: BufferId) -> bool {
        self.ledger.contains_key(&id)
    }

    /// Empty the ledger; the caller releases everything returned.
    pub fn take_buffers(&mut self) -> Vec<BufferId> {
        std::mem::take(&mut self.ledger).into_keys().collect()
    }

    pub fn owned_count(&self) -> usize {
        self.ledger.len()
    }

    /// All requested entities reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.entities
            .iter()
            .filter(|e| e.state.is_requested())
            .all(|e| e.state.is_done())
    }

    /// True exactly once: the first call after the frame became complete.
    pub fn take_completion(&mut self) -> bool {
        if self.completed || !self.is_complete() {
            return false;
        }
        self.completed = true;
        true
    }

    pub fn is_completion_taken(&self) -> bool {
        self.completed
    }

    pub fn has_error(&self) -> bool {
        self.entities.iter().any(|e| e.state == EntityState::Error)
    }

    /// First recorded fault, if any
    pub fn first_fault(&self) -> Option<(StageKind, &str)> {
        self.entities
            .iter()
            .find_map(|e| e.fault.as_deref().map(|f| (e.stage, f)))
    }

    /// Caller buffers with their final status
    pub fn output_results(&self) -> Vec<(ClientOutput, BufferStatus)> {
        self.outputs
            .iter()
            .map(|out| {
                let status = if self.state(out.owner) == EntityState::Complete {
                    BufferStatus::Ok
                } else {
                    BufferStatus::Error
                };
                (*out, status)
            })
            .collect()
    }

    /// Number of requested stages that finished successfully
    pub fn completed_stage_count(&self) -> u32 {
        self.entities
            .iter()
            .filter(|e| e.state == EntityState::Complete)
            .count() as u32
    }
}
