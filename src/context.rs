//! Device-lifetime shared state.
//!
//! `PipelineContext` owns everything that would otherwise be a process-wide
//! singleton: the frame-count generator, the monotonic clock the sensor
//! timestamps are taken from, and the registry of buffer pools. It is created
//! when the device is opened and handed by `Arc` to every component.

use crate::buffer::{BufferAllocator, BufferId, BufferPool, HeapAllocator, HwBuffer, PoolKind, PoolStats};
use crate::config::PipelineConfig;
use crate::error::{CameraError, Result};
use crate::pipeline::id::FrameCount;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

pub struct PipelineContext {
    config: RwLock<PipelineConfig>,
    next_frame: AtomicU32,
    epoch: Instant,
    pools: BTreeMap<PoolKind, Arc<BufferPool>>,
}

impl PipelineContext {
    /// Build the context with heap-backed pools
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_allocator(config, Arc::new(HeapAllocator))
    }

    /// Build the context, allocating every pool through `allocator`
    pub fn with_allocator(config: PipelineConfig, allocator: Arc<dyn BufferAllocator>) -> Result<Self> {
        config.validate()?;

        let mut pools = BTreeMap::new();
        for kind in PoolKind::ALL {
            let pool = BufferPool::new(kind, *config.pools.get(kind), allocator.clone())?;
            pools.insert(kind, pool);
        }

        Ok(Self {
            config: RwLock::new(config),
            next_frame: AtomicU32::new(1),
            epoch: Instant::now(),
            pools,
        })
    }

    /// Snapshot of the active configuration
    pub fn config(&self) -> PipelineConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply `f` to the configuration. Callers are responsible for quiescence.
    pub fn update_config(&self, f: impl FnOnce(&mut PipelineConfig)) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        f(&mut config);
    }

    /// Allocate the next frame count. Counts start at 1 and increase until
    /// `u32::MAX`, then wrap back to 1; `FrameCount::INVALID` is never issued.
    pub fn next_frame_count(&self) -> FrameCount {
        let prev = self
            .next_frame
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.checked_add(1).unwrap_or(1))
            })
            .unwrap_or_else(|n| n);
        FrameCount(prev)
    }

    /// Last frame count handed out, `FrameCount::INVALID` before the first
    /// and right after a wrap
    pub fn last_frame_count(&self) -> FrameCount {
        match self.next_frame.load(Ordering::Relaxed) {
            1 => FrameCount::INVALID,
            n => FrameCount(n - 1),
        }
    }

    /// Nanoseconds since the device was opened
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub fn pool(&self, kind: PoolKind) -> &Arc<BufferPool> {
        // Every kind is inserted in the constructor
        &self.pools[&kind]
    }

    /// Resolve an id to its memory
    pub fn buffer(&self, id: BufferId) -> Result<Arc<HwBuffer>> {
        self.pool(id.pool)
            .buffer(id.index)
            .ok_or_else(|| CameraError::InvalidArgument(format!("unknown buffer {}", id)))
    }

    /// Return a buffer to its pool
    pub fn release_buffer(&self, id: BufferId) -> bool {
        self.pool(id.pool).release_id(id)
    }

    pub fn release_buffers(&self, ids: impl IntoIterator<Item = BufferId>) {
        for id in ids {
            self.release_buffer(id);
        }
    }

    /// Force every pool back to all-free, returning leaked counts per pool
    pub fn reset_pools(&self) -> Vec<(PoolKind, usize)> {
        self.pools
            .iter()
            .map(|(kind, pool)| (*kind, pool.reset()))
            .filter(|(_, leaked)| *leaked > 0)
            .collect()
    }

    pub fn pools_all_free(&self) -> bool {
        self.pools.values().all(|p| p.is_all_free())
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.values().map(|p| p.stats()).collect()
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("last_frame", &self.last_frame_count())
            .field("pools", &self.pool_stats())
            .finish()
    }
}
