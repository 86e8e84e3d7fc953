//! Error handling for the camera pipeline
//!
//! This module defines the crate-wide error type and a Result alias. Every
//! error maps onto one of four classes: synchronous rejections, transient
//! buffer starvation, per-frame stage faults and the single fatal watchdog
//! class that tears the device down.

use thiserror::Error;

/// Coarse classification used by the orchestrator to decide how far an error
/// is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Rejected synchronously, nothing was started
    InvalidArgument,
    /// Transient, retried with a bounded timeout
    BufferUnavailable,
    /// One frame failed; the rest of the pipeline keeps running
    StageFault,
    /// Device-wide, fatal
    HardwareWatchdog,
}

/// Main error type for camera pipeline operations
#[derive(Error, Debug)]
pub enum CameraError {
    /// Malformed request or stream configuration
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A buffer pool stayed empty for the whole retry budget
    #[error("Buffer unavailable in pool {pool}: {message}")]
    BufferUnavailable { pool: String, message: String },

    /// A stage failed irrecoverably for one frame
    #[error("Stage {stage} fault on frame {frame_count}: {message}")]
    StageFault {
        stage: String,
        frame_count: u32,
        message: String,
    },

    /// A hardware stage is provably stuck
    #[error("Hardware watchdog: {0}")]
    HardwareWatchdog(String),

    /// The operation is not allowed in the current device state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A bounded wait ran out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CameraError>,
    },
}

impl CameraError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CameraError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a stage fault
    pub fn stage_fault(stage: impl ToString, frame_count: u32, message: impl Into<String>) -> Self {
        CameraError::StageFault {
            stage: stage.to_string(),
            frame_count,
            message: message.into(),
        }
    }

    /// Shorthand for buffer starvation
    pub fn buffer_unavailable(pool: impl ToString, message: impl Into<String>) -> Self {
        CameraError::BufferUnavailable {
            pool: pool.to_string(),
            message: message.into(),
        }
    }

    /// Map this error onto the propagation taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            CameraError::InvalidArgument(_)
            | CameraError::InvalidState(_)
            | CameraError::Config(_)
            | CameraError::Serialization(_) => ErrorClass::InvalidArgument,
            CameraError::BufferUnavailable { .. } | CameraError::Timeout(_) => {
                ErrorClass::BufferUnavailable
            }
            CameraError::StageFault { .. } | CameraError::Channel(_) | CameraError::Io(_) => {
                ErrorClass::StageFault
            }
            CameraError::HardwareWatchdog(_) => ErrorClass::HardwareWatchdog,
            CameraError::WithContext { source, .. } => source.class(),
        }
    }

    /// Only watchdog failures unwind past the stage boundary
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::HardwareWatchdog
    }
}

impl From<toml::de::Error> for CameraError {
    fn from(err: toml::de::Error) -> Self {
        CameraError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CameraError {
    fn from(err: serde_json::Error) -> Self {
        CameraError::Serialization(err.to_string())
    }
}

/// Result type alias for camera pipeline operations
pub type Result<T> = std::result::Result<T, CameraError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
