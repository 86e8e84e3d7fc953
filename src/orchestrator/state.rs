//! Device state machine.
//!
//! ```text
//! Open ─► Initialized ─► Configured ─► Start ─► Run ─► Flush ─► Configured
//!                  │          ▲  │                        ▲
//!                  └──────────┼──┴────────────────────────┘
//!                             └── (re)configure
//! ```
//!
//! `Error` is absorbing: once entered, every transition except to `Error`
//! itself fails.

use crate::error::{CameraError, Result};
use serde::Serialize;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Open,
    Initialized,
    Configured,
    Start,
    Run,
    Flush,
    Error,
}

impl DeviceState {
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        match (self, next) {
            (Error, Error) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Open, Initialized) => true,
            (Initialized, Configured | Flush) => true,
            (Configured, Configured | Start | Flush) => true,
            (Start, Run | Flush) => true,
            (Run, Flush) => true,
            (Flush, Configured) => true,
            _ => false,
        }
    }

    /// Requests are accepted in these states
    pub fn accepts_requests(self) -> bool {
        matches!(self, DeviceState::Configured | DeviceState::Start | DeviceState::Run)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Open => "open",
            DeviceState::Initialized => "initialized",
            DeviceState::Configured => "configured",
            DeviceState::Start => "start",
            DeviceState::Run => "run",
            DeviceState::Flush => "flush",
            DeviceState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Shared device state with waiters.
#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<DeviceState>,
    changed: Condvar,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState::Open),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> DeviceState {
        *self.lock()
    }

    /// Move to `next`. Returns the previous state.
    pub fn transition(&self, next: DeviceState) -> Result<DeviceState> {
        let mut state = self.lock();
        let prev = *state;
        if !prev.can_transition_to(next) {
            return Err(CameraError::InvalidState(format!(
                "device cannot go {} -> {}",
                prev, next
            )));
        }
        *state = next;
        drop(state);
        if prev != next {
            tracing::info!("Device state {} -> {}", prev, next);
        }
        self.changed.notify_all();
        Ok(prev)
    }

    /// Move to `next` only if the device is in one of `from`.
    pub fn transition_from(&self, from: &[DeviceState], next: DeviceState) -> Result<DeviceState> {
        let mut state = self.lock();
        let prev = *state;
        if !from.contains(&prev) || !prev.can_transition_to(next) {
            return Err(CameraError::InvalidState(format!(
                "device in {} cannot go to {}",
                prev, next
            )));
        }
        *state = next;
        drop(state);
        tracing::info!("Device state {} -> {}", prev, next);
        self.changed.notify_all();
        Ok(prev)
    }

    /// Wait until the state satisfies `pred`, at most `timeout`.
    pub fn wait_until(&self, timeout: Duration, pred: impl Fn(DeviceState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !pred(*state) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
