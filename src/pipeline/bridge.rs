//! Thread boundary between the pipeline and its caller.
//!
//! Results leave the pipeline through a [`ResultSink`]. Callbacks arrive on
//! pipeline threads, already sequenced: per request, shutter first, then
//! partial metadata and buffers, then final metadata; requests finish in
//! submission order.
//!
//! [`ChannelSink`] turns the callbacks into [`CaptureEvent`]s on a crossbeam
//! channel for callers that would rather poll.

use crate::buffer::BufferHandle;
use crate::pipeline::id::StreamId;
use crate::types::{BufferStatus, ErrorKind, Metadata};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::time::Duration;

/// Caller-provided result callbacks.
#[cfg_attr(test, mockall::automock)]
pub trait ResultSink: Send + Sync {
    /// Start of exposure for a request
    fn on_shutter(&self, frame_id: u32, timestamp_ns: u64);

    /// Early 3A results
    fn on_partial_metadata(&self, frame_id: u32, metadata: &Metadata);

    /// One output (or the returned input) buffer
    fn on_buffer_ready(&self, frame_id: u32, stream: StreamId, handle: BufferHandle, status: BufferStatus);

    /// Last result of a request
    fn on_final_metadata(&self, frame_id: u32, metadata: &Metadata);

    /// Request, result, buffer or device error. Device errors use frame id 0.
    fn on_error(&self, frame_id: u32, kind: ErrorKind);
}

/// One sink callback as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Shutter {
        frame_id: u32,
        timestamp_ns: u64,
    },
    PartialMetadata {
        frame_id: u32,
        metadata: Metadata,
    },
    BufferReady {
        frame_id: u32,
        stream: StreamId,
        handle: BufferHandle,
        status: BufferStatus,
    },
    FinalMetadata {
        frame_id: u32,
        metadata: Metadata,
    },
    Error {
        frame_id: u32,
        kind: ErrorKind,
    },
}

impl CaptureEvent {
    pub fn frame_id(&self) -> u32 {
        match self {
            CaptureEvent::Shutter { frame_id, .. }
            | CaptureEvent::PartialMetadata { frame_id, .. }
            | CaptureEvent::BufferReady { frame_id, .. }
            | CaptureEvent::FinalMetadata { frame_id, .. }
            | CaptureEvent::Error { frame_id, .. } => *frame_id,
        }
    }

    /// Final metadata, or a request/result error, ends a request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaptureEvent::FinalMetadata { .. }
                | CaptureEvent::Error {
                    kind: ErrorKind::Request | ErrorKind::Result,
                    ..
                }
        )
    }
}

/// Channel capacity for events (pipeline → caller).
/// Sized for several seconds of results at 30 fps with a handful of streams.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// [`ResultSink`] that forwards every callback to a channel.
pub struct ChannelSink {
    tx: Sender<CaptureEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end
    pub fn new() -> (Self, EventReceiver) {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, EventReceiver) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, EventReceiver { rx })
    }

    fn send(&self, event: CaptureEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!("Event channel full, blocking on {:?}", event.frame_id());
                let _ = self.tx.send(event);
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!("Event receiver dropped");
            }
        }
    }
}

impl ResultSink for ChannelSink {
    fn on_shutter(&self, frame_id: u32, timestamp_ns: u64) {
        self.send(CaptureEvent::Shutter {
            frame_id,
            timestamp_ns,
        });
    }

    fn on_partial_metadata(&self, frame_id: u32, metadata: &Metadata) {
        self.send(CaptureEvent::PartialMetadata {
            frame_id,
            metadata: metadata.clone(),
        });
    }

    fn on_buffer_ready(&self, frame_id: u32, stream: StreamId, handle: BufferHandle, status: BufferStatus) {
        self.send(CaptureEvent::BufferReady {
            frame_id,
            stream,
            handle,
            status,
        });
    }

    fn on_final_metadata(&self, frame_id: u32, metadata: &Metadata) {
        self.send(CaptureEvent::FinalMetadata {
            frame_id,
            metadata: metadata.clone(),
        });
    }

    fn on_error(&self, frame_id: u32, kind: ErrorKind) {
        self.send(CaptureEvent::Error { frame_id, kind });
    }
}

/// Caller-side end of a [`ChannelSink`].
pub struct EventReceiver {
    rx: Receiver<CaptureEvent>,
}

impl EventReceiver {
    /// Drain all pending events.
    pub fn drain(&self) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Try to receive a single event without blocking.
    pub fn try_recv(&self) -> Option<CaptureEvent> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<CaptureEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Collect events until `terminal` requests have finished or `timeout`
    /// passes without a new event.
    pub fn collect_until_terminal(&self, terminal: usize, timeout: Duration) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        let mut finished = 0;
        while finished < terminal {
            let Some(event) = self.recv_timeout(timeout) else {
                break;
            };
            if event.is_terminal() {
                finished += 1;
            }
            events.push(event);
        }
        events
    }
}
