//! Capture-path raw selection.
//!
//! Completed sensor raws are parked in a bounded FIFO hold list. A capture
//! frame asks for one of them with [`FrameSelector::select_for`], which polls
//! with a fixed interval (woken early whenever a raw arrives) until the match
//! policy finds a candidate or the retry budget runs out.
//!
//! Ownership: a held raw belongs to the selector. It leaves the hold list
//! either by selection (ownership moves to the capture frame), by eviction or
//! discard (released to the raw pool here), or by [`FrameSelector::clear`].

use crate::buffer::{BufferId, BufferPool};
use crate::config::{SelectorConfig, SelectorPolicy};
use crate::error::{CameraError, Result};
use crate::pipeline::id::FrameCount;
use crate::types::Metadata;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// A raw waiting in the hold list.
#[derive(Debug, Clone, PartialEq)]
pub struct HeldRaw {
    pub frame: FrameCount,
    pub buffer: BufferId,
    pub timestamp_ns: u64,
    /// 3A results of the frame that produced the raw
    pub metadata: Metadata,
}

/// What a capture frame is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectTarget {
    /// Frame the capture is anchored to
    pub reference: FrameCount,
    /// Raws older than this are stale and get discarded while waiting
    pub min_frame: Option<FrameCount>,
    /// Target sensor time for window matching
    pub timestamp_ns: u64,
}

/// Hold-list counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SelectorStats {
    pub held: usize,
    pub depth: usize,
    pub selected: u64,
    pub evicted: u64,
    pub discarded: u64,
    pub timeouts: u64,
}

struct SelectorState {
    hold: VecDeque<HeldRaw>,
    config: SelectorConfig,
    cancelled: bool,
    stats: SelectorStats,
}

pub struct FrameSelector {
    raw_pool: Arc<BufferPool>,
    state: Mutex<SelectorState>,
    arrived: Condvar,
}

impl FrameSelector {
    pub fn new(config: SelectorConfig, raw_pool: Arc<BufferPool>) -> Self {
        Self {
            raw_pool,
            state: Mutex::new(SelectorState {
                hold: VecDeque::with_capacity(config.hold_depth + 1),
                config,
                cancelled: false,
                stats: SelectorStats::default(),
            }),
            arrived: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SelectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap in new settings; the hold list is trimmed to the new depth.
    pub fn set_config(&self, config: SelectorConfig) {
        let evicted = {
            let mut state = self.lock();
            state.config = config;
            trim(&mut state)
        };
        self.release_all(evicted);
    }

    /// Park a completed raw, evicting the oldest entries beyond the hold depth.
    /// Returns the frame counts of evicted raws, oldest first.
    pub fn manage_hold_list(&self, held: HeldRaw) -> Vec<FrameCount> {
        tracing::trace!("[{}] holding raw {}", held.frame, held.buffer);
        let evicted = {
            let mut state = self.lock();
            state.hold.push_back(held);
            trim(&mut state)
        };
        self.arrived.notify_all();

        let frames = evicted.iter().map(|h| h.frame).collect();
        self.release_all(evicted);
        frames
    }

    /// Find a held raw for a capture frame, waiting at most `max_retries`
    /// intervals.
    pub fn select_for(&self, target: SelectTarget, max_retries: u32) -> Result<HeldRaw> {
        let mut state = self.lock();
        let interval = state.config.retry_interval();

        for attempt in 0..=max_retries {
            if state.cancelled {
                return Err(CameraError::Timeout(format!(
                    "[{}] raw selection cancelled",
                    target.reference
                )));
            }

            let (picked, stale) = pick(&mut state, &target);
            if !stale.is_empty() {
                state.stats.discarded += stale.len() as u64;
                tracing::debug!(
                    "[{}] discarded {} stale raws below {:?}",
                    target.reference,
                    stale.len(),
                    target.min_frame
                );
                for held in &stale {
                    self.raw_pool.release_id(held.buffer);
                }
            }

            if let Some(held) = picked {
                state.stats.selected += 1;
                tracing::debug!(
                    "[{}] selected raw from {} after {} retries",
                    target.reference,
                    held.frame,
                    attempt
                );
                return Ok(held);
            }

            if attempt == max_retries {
                break;
            }
            state = match self.arrived.wait_timeout(state, interval) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        state.stats.timeouts += 1;
        Err(CameraError::Timeout(format!(
            "[{}] no held raw after {} retries ({} held)",
            target.reference,
            max_retries,
            state.hold.len()
        )))
    }

    /// Wake every waiter and fail all selections until [`resume`](Self::resume).
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.arrived.notify_all();
    }

    pub fn resume(&self) {
        self.lock().cancelled = false;
    }

    /// Release every held raw. Returns how many were held.
    pub fn clear(&self) -> usize {
        let held: Vec<HeldRaw> = self.lock().hold.drain(..).collect();
        let count = held.len();
        self.release_all(held);
        count
    }

    pub fn len(&self) -> usize {
        self.lock().hold.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Held frame counts, oldest first
    pub fn held_frames(&self) -> Vec<FrameCount> {
        self.lock().hold.iter().map(|h| h.frame).collect()
    }

    pub fn stats(&self) -> SelectorStats {
        let state = self.lock();
        SelectorStats {
            held: state.hold.len(),
            depth: state.config.hold_depth,
            ..state.stats
        }
    }

    fn release_all(&self, held: Vec<HeldRaw>) {
        for raw in held {
            self.raw_pool.release_id(raw.buffer);
        }
    }
}

fn trim(state: &mut SelectorState) -> Vec<HeldRaw> {
    let mut evicted = Vec::new();
    while state.hold.len() > state.config.hold_depth {
        if let Some(oldest) = state.hold.pop_front() {
            tracing::trace!("[{}] evicted from hold list", oldest.frame);
            evicted.push(oldest);
        }
    }
    state.stats.evicted += evicted.len() as u64;
    evicted
}

/// Apply the match policy. Returns the picked entry (removed from the hold
/// list) and any stale entries that were dropped on the way.
fn pick(state: &mut SelectorState, target: &SelectTarget) -> (Option<HeldRaw>, Vec<HeldRaw>) {
    let policy = state.config.policy;
    let floor = match policy {
        SelectorPolicy::FrameCount => Some(target.reference),
        _ => target.min_frame,
    };

    let mut stale = Vec::new();
    if let Some(floor) = floor {
        let mut kept = VecDeque::with_capacity(state.hold.len());
        for held in state.hold.drain(..) {
            if held.frame < floor {
                stale.push(held);
            } else {
                kept.push_back(held);
            }
        }
        state.hold = kept;
    }

    let index = match policy {
        SelectorPolicy::Latest => state
            .hold
            .iter()
            .enumerate()
            .max_by_key(|(_, h)| h.frame)
            .map(|(i, _)| i),
        SelectorPolicy::FrameCount => state
            .hold
            .iter()
            .enumerate()
            .min_by_key(|(_, h)| h.frame)
            .map(|(i, _)| i),
        SelectorPolicy::TimestampWindow { window_ns } => state
            .hold
            .iter()
            .enumerate()
            .map(|(i, h)| (i, h.timestamp_ns.abs_diff(target.timestamp_ns)))
            .filter(|(_, diff)| *diff <= window_ns)
            .min_by_key(|(_, diff)| *diff)
            .map(|(i, _)| i),
    };

    (index.and_then(|i| state.hold.remove(i)), stale)
}
