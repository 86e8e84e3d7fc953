//! Bounded buffer pool for one pipeline stage.
//!
//! # Architecture
//!
//! ```text
//!   acquire() ──► free list ──► in flight ──► release(index) ──► free list
//!                    ▲
//!                    └── growth (OnDemand: inline, Silent: background thread)
//! ```
//!
//! All bookkeeping lives under one mutex. A condvar is signalled on every
//! release so `acquire_timeout` waits instead of polling. Releasing an index
//! that is already free is counted and logged, never applied twice.

use super::{BufferAllocator, BufferId, HwBuffer, PoolKind};
use crate::config::{AllocMode, PoolSettings};
use crate::error::{CameraError, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub kind: PoolKind,
    /// Buffers currently allocated
    pub allocated: usize,
    pub free: usize,
    pub in_flight: usize,
    /// Allocation ceiling
    pub max_count: usize,
    pub double_releases: u64,
}

struct PoolState {
    settings: PoolSettings,
    buffers: Vec<Arc<HwBuffer>>,
    in_flight: Vec<bool>,
    free: VecDeque<u32>,
    double_releases: u64,
    growing: bool,
    /// Bumped on reconfigure so stale background growth is discarded
    generation: u64,
}

impl PoolState {
    fn allocated(&self) -> usize {
        self.buffers.len()
    }

    fn in_flight_count(&self) -> usize {
        self.buffers.len() - self.free.len()
    }

    fn take_free(&mut self) -> Option<(BufferId, Arc<HwBuffer>)> {
        let index = self.free.pop_front()?;
        self.in_flight[index as usize] = true;
        let buffer = self.buffers[index as usize].clone();
        Some((buffer.id(), buffer))
    }

    fn push_new(&mut self, buffer: Arc<HwBuffer>, in_flight: bool) {
        let index = self.buffers.len() as u32;
        self.buffers.push(buffer);
        self.in_flight.push(in_flight);
        if !in_flight {
            self.free.push_back(index);
        }
    }
}

/// Per-stage pool of hardware buffers.
pub struct BufferPool {
    kind: PoolKind,
    allocator: Arc<dyn BufferAllocator>,
    state: Mutex<PoolState>,
    available: Condvar,
    weak_self: Weak<BufferPool>,
}

impl BufferPool {
    /// Create a pool and allocate its initial `count` buffers.
    pub fn new(
        kind: PoolKind,
        settings: PoolSettings,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Arc<Self>> {
        let buffers = allocate_range(kind, allocator.as_ref(), 0, settings.count, settings.buffer_size)?;
        let count = buffers.len();

        tracing::debug!(
            "Pool {} allocated {} x {} bytes ({:?}, max {})",
            kind,
            count,
            settings.buffer_size,
            settings.mode,
            settings.max_count
        );

        Ok(Arc::new_cyclic(|weak| Self {
            kind,
            allocator,
            state: Mutex::new(PoolState {
                settings,
                buffers,
                in_flight: vec![false; count],
                free: (0..count as u32).collect(),
                double_releases: 0,
                growing: false,
                generation: 0,
            }),
            available: Condvar::new(),
            weak_self: weak.clone(),
        }))
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a free buffer without blocking.
    ///
    /// `None` means the pool is exhausted; callers retry through
    /// [`acquire_timeout`](Self::acquire_timeout).
    pub fn acquire(&self) -> Option<(BufferId, Arc<HwBuffer>)> {
        let mut state = self.lock();
        self.acquire_locked(&mut state)
    }

    fn acquire_locked(&self, state: &mut PoolState) -> Option<(BufferId, Arc<HwBuffer>)> {
        if let Some(taken) = state.take_free() {
            if state.free.is_empty() {
                self.grow_in_background(state);
            }
            return Some(taken);
        }

        match state.settings.mode {
            AllocMode::AtOnce => None,
            AllocMode::OnDemand => {
                if state.allocated() >= state.settings.max_count as usize {
                    return None;
                }
                let id = BufferId::new(self.kind, state.allocated() as u32);
                match self.allocator.allocate(id, state.settings.buffer_size) {
                    Ok(buffer) => {
                        tracing::debug!("Pool {} grew to {}", self.kind, state.allocated() + 1);
                        state.push_new(buffer.clone(), true);
                        Some((id, buffer))
                    }
                    Err(e) => {
                        tracing::warn!("Pool {} failed to grow: {}", self.kind, e);
                        None
                    }
                }
            }
            AllocMode::Silent => {
                self.grow_in_background(state);
                None
            }
        }
    }

    /// Start one background allocation when a silent pool runs dry.
    fn grow_in_background(&self, state: &mut PoolState) {
        if state.settings.mode != AllocMode::Silent
            || state.growing
            || state.allocated() >= state.settings.max_count as usize
        {
            return;
        }
        let Some(pool) = self.weak_self.upgrade() else {
            return;
        };
        state.growing = true;

        let id = BufferId::new(self.kind, state.allocated() as u32);
        let size = state.settings.buffer_size;
        let generation = state.generation;

        let spawned = std::thread::Builder::new()
            .name(format!("pool-{}-grow", self.kind))
            .spawn(move || {
                let result = pool.allocator.allocate(id, size);
                let mut state = pool.lock();
                state.growing = false;
                match result {
                    Ok(buffer) if state.generation == generation => {
                        state.push_new(buffer, false);
                        tracing::debug!("Pool {} grew to {} in background", pool.kind, state.allocated());
                        pool.available.notify_one();
                    }
                    Ok(_) => {
                        tracing::debug!("Pool {} discarded stale background buffer", pool.kind);
                    }
                    Err(e) => {
                        tracing::warn!("Pool {} background growth failed: {}", pool.kind, e);
                    }
                }
            });

        if let Err(e) = spawned {
            state.growing = false;
            tracing::warn!("Pool {} could not spawn growth thread: {}", self.kind, e);
        }
    }

    /// Take a free buffer, waiting up to `timeout` for a release.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<(BufferId, Arc<HwBuffer>)> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(taken) = self.acquire_locked(&mut state) {
                return Ok(taken);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CameraError::buffer_unavailable(
                    self.kind,
                    format!(
                        "no free buffer after {:?} ({} in flight)",
                        timeout,
                        state.in_flight_count()
                    ),
                ));
            }
            state = match self.available.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Return a buffer. Returns `false` (and logs) if `index` was not in flight.
    pub fn release(&self, index: u32) -> bool {
        let mut state = self.lock();
        let slot = index as usize;
        if slot >= state.allocated() {
            tracing::warn!("Pool {}: release of unknown index {}", self.kind, index);
            state.double_releases += 1;
            return false;
        }
        if !state.in_flight[slot] {
            tracing::warn!("Pool {}: index {} released while already free", self.kind, index);
            state.double_releases += 1;
            return false;
        }
        state.in_flight[slot] = false;
        state.free.push_back(index);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Release by id; ids from another pool are rejected.
    pub fn release_id(&self, id: BufferId) -> bool {
        if id.pool != self.kind {
            tracing::warn!("Pool {}: refusing to release foreign buffer {}", self.kind, id);
            return false;
        }
        self.release(id.index)
    }

    /// Replace the pool contents. Only valid while nothing is in flight.
    pub fn reconfigure(&self, settings: PoolSettings) -> Result<()> {
        if settings.count == 0 || settings.max_count < settings.count {
            return Err(CameraError::InvalidArgument(format!(
                "pool {}: invalid sizing count={} max={}",
                self.kind, settings.count, settings.max_count
            )));
        }

        let mut state = self.lock();
        let in_flight = state.in_flight_count();
        if in_flight > 0 {
            return Err(CameraError::InvalidState(format!(
                "pool {} has {} buffers in flight",
                self.kind, in_flight
            )));
        }

        let buffers = allocate_range(
            self.kind,
            self.allocator.as_ref(),
            0,
            settings.count,
            settings.buffer_size,
        )?;
        let count = buffers.len();
        state.buffers = buffers;
        state.in_flight = vec![false; count];
        state.free = (0..count as u32).collect();
        state.settings = settings;
        state.generation += 1;
        state.growing = false;

        tracing::debug!(
            "Pool {} reconfigured: {} x {} bytes (max {})",
            self.kind,
            count,
            settings.buffer_size,
            settings.max_count
        );
        Ok(())
    }

    /// Force every buffer back to free. Returns how many were still in flight.
    pub fn reset(&self) -> usize {
        let mut state = self.lock();
        let reclaimed = state.in_flight_count();
        if reclaimed > 0 {
            tracing::warn!("Pool {}: reclaimed {} leaked buffers", self.kind, reclaimed);
        }
        let count = state.allocated();
        state.in_flight = vec![false; count];
        state.free = (0..count as u32).collect();
        drop(state);
        self.available.notify_all();
        reclaimed
    }

    /// Backing buffer for `index`
    pub fn buffer(&self, index: u32) -> Option<Arc<HwBuffer>> {
        self.lock().buffers.get(index as usize).cloned()
    }

    pub fn settings(&self) -> PoolSettings {
        self.lock().settings
    }

    pub fn is_all_free(&self) -> bool {
        self.lock().in_flight_count() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            kind: self.kind,
            allocated: state.allocated(),
            free: state.free.len(),
            in_flight: state.in_flight_count(),
            max_count: state.settings.max_count as usize,
            double_releases: state.double_releases,
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("kind", &self.kind)
            .field("stats", &self.stats())
            .finish()
    }
}

fn allocate_range(
    kind: PoolKind,
    allocator: &dyn BufferAllocator,
    start: u32,
    end: u32,
    size: usize,
) -> Result<Vec<Arc<HwBuffer>>> {
    (start..end)
        .map(|index| allocator.allocate(BufferId::new(kind, index), size))
        .collect()
}
