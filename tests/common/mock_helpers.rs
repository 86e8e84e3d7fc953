//! Result sinks for integration tests

use camera_pipeline::{
    BufferHandle, BufferStatus, CaptureEvent, ErrorKind, Metadata, ResultSink, StreamId,
};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Sink that records every callback and lets a test wait for terminals
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CaptureEvent>>,
    changed: Condvar,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: CaptureEvent) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<CaptureEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn terminal_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.is_terminal())
            .count()
    }

    /// Wait until `count` requests have terminated. Returns false on timeout.
    pub fn wait_for_terminals(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        loop {
            if events.iter().filter(|e| e.is_terminal()).count() >= count {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self.changed.wait_timeout(events, deadline - now).unwrap().0;
        }
    }

    /// Wait until some recorded event matches `pred`. Returns false on timeout.
    pub fn wait_for_event(&self, timeout: Duration, pred: impl Fn(&CaptureEvent) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        loop {
            if events.iter().any(&pred) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self.changed.wait_timeout(events, deadline - now).unwrap().0;
        }
    }

    pub fn for_request(&self, frame_id: u32) -> Vec<CaptureEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.frame_id() == frame_id)
            .cloned()
            .collect()
    }
}

impl ResultSink for RecordingSink {
    fn on_shutter(&self, frame_id: u32, timestamp_ns: u64) {
        self.push(CaptureEvent::Shutter {
            frame_id,
            timestamp_ns,
        });
    }

    fn on_partial_metadata(&self, frame_id: u32, metadata: &Metadata) {
        self.push(CaptureEvent::PartialMetadata {
            frame_id,
            metadata: metadata.clone(),
        });
    }

    fn on_buffer_ready(&self, frame_id: u32, stream: StreamId, handle: BufferHandle, status: BufferStatus) {
        self.push(CaptureEvent::BufferReady {
            frame_id,
            stream,
            handle,
            status,
        });
    }

    fn on_final_metadata(&self, frame_id: u32, metadata: &Metadata) {
        self.push(CaptureEvent::FinalMetadata {
            frame_id,
            metadata: metadata.clone(),
        });
    }

    fn on_error(&self, frame_id: u32, kind: ErrorKind) {
        self.push(CaptureEvent::Error { frame_id, kind });
    }
}

/// Buffers returned for a request, with their status
pub fn buffers_of(events: &[CaptureEvent], frame_id: u32) -> Vec<(StreamId, BufferHandle, BufferStatus)> {
    events
        .iter()
        .filter_map(|e| match e {
            CaptureEvent::BufferReady {
                frame_id: id,
                stream,
                handle,
                status,
            } if *id == frame_id => Some((*stream, *handle, *status)),
            _ => None,
        })
        .collect()
}
