//! Hardware buffers and the pools that own them.
//!
//! Buffers are identified by [`BufferId`] (pool + index) everywhere outside
//! the pool; frames and the hold list only ever store ids, and resolve them
//! through the pool registry in [`crate::context::PipelineContext`] when a
//! stage actually touches memory.

pub mod pool;

pub use pool::{BufferPool, PoolStats};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Which pool a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Sensor readout
    Raw,
    /// 3A output feeding a separate ISP
    Bayer,
    /// ISP output feeding a separate scaler
    Yuv,
    /// Dump stage copies
    Dump,
}

impl PoolKind {
    pub const ALL: [PoolKind; 4] = [PoolKind::Raw, PoolKind::Bayer, PoolKind::Yuv, PoolKind::Dump];

    pub fn name(self) -> &'static str {
        match self {
            PoolKind::Raw => "raw",
            PoolKind::Bayer => "bayer",
            PoolKind::Yuv => "yuv",
            PoolKind::Dump => "dump",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pool-qualified buffer index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId {
    pub pool: PoolKind,
    pub index: u32,
}

impl BufferId {
    pub const fn new(pool: PoolKind, index: u32) -> Self {
        Self { pool, index }
    }
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pool, self.index)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One hardware-backed memory region.
#[derive(Debug)]
pub struct HwBuffer {
    id: BufferId,
    memory: Mutex<Vec<u8>>,
}

impl HwBuffer {
    pub fn new(id: BufferId, size: usize) -> Self {
        Self {
            id,
            memory: Mutex::new(vec![0; size]),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Lock the backing memory. Poisoning is ignored, the bytes stay usable.
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Source of backing memory for a pool.
///
/// The real device maps ION/dma-buf regions here; the default heap allocator
/// is enough for simulation and tests.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, id: BufferId, size: usize) -> Result<Arc<HwBuffer>>;
}

/// Plain heap memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, id: BufferId, size: usize) -> Result<Arc<HwBuffer>> {
        Ok(Arc::new(HwBuffer::new(id, size)))
    }
}

/// Opaque caller-owned buffer (gralloc handle on a real device).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferHandle(pub u64);

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferHandle({:#x})", self.0)
    }
}
