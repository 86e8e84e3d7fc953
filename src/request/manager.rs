//! Request bookkeeping and result sequencing.
//!
//! Every accepted request gets an entry keyed by its frame number. Results
//! arrive from pipeline threads in any order and are parked on the entry;
//! after each arrival [`RequestManager`] pumps the entries in key order and
//! emits whatever the ordering rules allow:
//!
//! - shutters go out in request order;
//! - partial metadata of a request follows its shutter;
//! - buffers wait until the partial has gone out, or until it is known that
//!   none will come;
//! - the terminal callback (final metadata or a request/result error) waits
//!   until every frame of the request is done, every buffer has been
//!   delivered, and every earlier request has had its terminal callback.
//!
//! Callbacks run with the sequencer lock held, so a [`ResultSink`] must not
//! call back into the manager.

use crate::buffer::BufferHandle;
use crate::error::{CameraError, Result};
use crate::pipeline::bridge::ResultSink;
use crate::pipeline::id::StreamId;
use crate::request::{Request, StreamBuffer};
use crate::types::{BufferStatus, ErrorKind, Metadata, StreamConfig, StreamKind};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// What the scheduler needs to know about a queued request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestPlan {
    pub frame_number: u32,
    pub settings: Metadata,
    /// Outputs filled by the scaler of a client frame
    pub preview: Vec<StreamBuffer>,
    /// Outputs filled by the reprocessing stage of a capture frame
    pub capture: Vec<StreamBuffer>,
    pub input: Option<StreamBuffer>,
}

impl RequestPlan {
    /// No preview-path output, so no client frame is needed
    pub fn is_capture_only(&self) -> bool {
        self.preview.is_empty()
    }

    /// Capture outputs or an input buffer need a capture frame
    pub fn needs_capture(&self) -> bool {
        !self.capture.is_empty() || self.input.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Final,
    Error(ErrorKind),
}

#[derive(Debug)]
struct PendingBuffer {
    buffer: StreamBuffer,
    status: Option<BufferStatus>,
    sent: bool,
}

#[derive(Debug)]
struct RequestEntry {
    plan: RequestPlan,
    frames_expected: u32,
    frames_done: u32,
    shutter: Option<u64>,
    shutter_sent: bool,
    partial: Option<Metadata>,
    partial_sent: bool,
    /// The partial arrived or never will
    partial_settled: bool,
    buffers: Vec<PendingBuffer>,
    result: Metadata,
    pipeline_depth: u32,
    terminal: Option<Terminal>,
    terminal_sent: bool,
    any_sent: bool,
}

impl RequestEntry {
    fn new(plan: RequestPlan, request: &Request) -> Self {
        let buffers = request
            .outputs
            .iter()
            .chain(request.input.iter())
            .map(|b| PendingBuffer {
                buffer: *b,
                status: None,
                sent: false,
            })
            .collect();
        Self {
            plan,
            frames_expected: 0,
            frames_done: 0,
            shutter: None,
            shutter_sent: false,
            partial: None,
            partial_sent: false,
            partial_settled: false,
            buffers,
            result: Metadata::new(),
            pipeline_depth: 0,
            terminal: None,
            terminal_sent: false,
            any_sent: false,
        }
    }

    fn frames_finished(&self) -> bool {
        self.frames_expected > 0 && self.frames_done >= self.frames_expected
    }

    /// No shutter will ever arrive for this request
    fn shutter_settled(&self) -> bool {
        self.shutter_sent || (self.terminal.is_some() && self.shutter.is_none() && self.frames_finished())
    }

    fn all_buffers_sent(&self) -> bool {
        self.buffers.iter().all(|b| b.sent)
    }

    /// Error every buffer that never got a result
    fn fail_unresolved(&mut self) -> usize {
        let mut failed = 0;
        for pending in self.buffers.iter_mut().filter(|b| b.status.is_none()) {
            pending.status = Some(BufferStatus::Error);
            failed += 1;
        }
        failed
    }
}

struct Sequencer {
    entries: BTreeMap<u32, RequestEntry>,
    service: VecDeque<u32>,
    streams: BTreeMap<StreamId, StreamConfig>,
    last_frame_number: Option<u32>,
}

pub struct RequestManager {
    sink: Arc<dyn ResultSink>,
    sequencer: Mutex<Sequencer>,
    result_renew: AtomicU32,
}

impl RequestManager {
    pub fn new(sink: Arc<dyn ResultSink>) -> Self {
        Self {
            sink,
            sequencer: Mutex::new(Sequencer {
                entries: BTreeMap::new(),
                service: VecDeque::new(),
                streams: BTreeMap::new(),
                last_frame_number: None,
            }),
            result_renew: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sequencer> {
        self.sequencer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the negotiated stream set. Only valid with nothing pending.
    pub fn set_streams(&self, streams: &[StreamConfig]) -> Result<()> {
        let mut seq = self.lock();
        if !seq.entries.is_empty() {
            return Err(CameraError::InvalidState(format!(
                "{} requests still pending",
                seq.entries.len()
            )));
        }
        seq.streams = streams.iter().map(|s| (s.id, s.clone())).collect();
        Ok(())
    }

    pub fn stream(&self, id: StreamId) -> Option<StreamConfig> {
        self.lock().streams.get(&id).cloned()
    }

    /// Validate and accept a request. Returns its frame number.
    pub fn register_request(&self, request: Request) -> Result<u32> {
        let mut seq = self.lock();
        let number = request.frame_number;

        if request.outputs.is_empty() {
            return Err(CameraError::InvalidArgument(format!(
                "request {} has no output buffers",
                number
            )));
        }
        if let Some(last) = seq.last_frame_number {
            if number <= last {
                return Err(CameraError::InvalidArgument(format!(
                    "request {} does not follow {}",
                    number, last
                )));
            }
        }

        let mut preview = Vec::new();
        let mut capture = Vec::new();
        for output in &request.outputs {
            match seq.streams.get(&output.stream).map(|s| s.kind) {
                Some(kind) if kind.is_preview_path() => preview.push(*output),
                Some(StreamKind::Capture) => capture.push(*output),
                Some(_) => {
                    return Err(CameraError::InvalidArgument(format!(
                        "request {}: {} is an input stream",
                        number, output.stream
                    )))
                }
                None => {
                    return Err(CameraError::InvalidArgument(format!(
                        "request {}: unknown output stream {}",
                        number, output.stream
                    )))
                }
            }
        }
        if let Some(input) = request.input {
            let kind = seq.streams.get(&input.stream).map(|s| s.kind);
            if kind != Some(StreamKind::Input) {
                return Err(CameraError::InvalidArgument(format!(
                    "request {}: input buffer is not bound to an input stream ({})",
                    number, input.stream
                )));
            }
        }

        let plan = RequestPlan {
            frame_number: number,
            settings: request.settings.clone(),
            preview,
            capture,
            input: request.input,
        };
        seq.entries.insert(number, RequestEntry::new(plan, &request));
        seq.service.push_back(number);
        seq.last_frame_number = Some(number);
        tracing::debug!(
            "[R{}] accepted: {} outputs{}",
            number,
            request.outputs.len(),
            if request.input.is_some() { ", with input" } else { "" }
        );
        Ok(number)
    }

    /// Oldest request not yet scheduled
    pub fn peek_service(&self) -> Option<RequestPlan> {
        let seq = self.lock();
        let number = *seq.service.front()?;
        seq.entries.get(&number).map(|e| e.plan.clone())
    }

    pub fn pop_service(&self) -> Option<RequestPlan> {
        self.pop_service_if(|_| true)
    }

    /// Pop the oldest queued request if `accept` agrees
    pub fn pop_service_if(&self, accept: impl FnOnce(&RequestPlan) -> bool) -> Option<RequestPlan> {
        let mut seq = self.lock();
        let number = *seq.service.front()?;
        let plan = seq.entries.get(&number).map(|e| e.plan.clone())?;
        if !accept(&plan) {
            return None;
        }
        seq.service.pop_front();
        Some(plan)
    }

    pub fn service_len(&self) -> usize {
        self.lock().service.len()
    }

    /// Requests without a terminal callback yet
    pub fn pending_len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_len() > 0
    }

    /// The request will be completed by `frames` frames
    pub fn expect_frames(&self, number: u32, frames: u32) {
        let mut seq = self.lock();
        if let Some(entry) = seq.entries.get_mut(&number) {
            entry.frames_expected += frames;
        }
    }

    pub fn notify_shutter(&self, number: u32, timestamp_ns: u64) {
        let mut seq = self.lock();
        let Some(entry) = seq.entries.get_mut(&number) else {
            tracing::warn!("[R{}] shutter for unknown request", number);
            return;
        };
        if entry.shutter.is_some() {
            tracing::warn!("[R{}] shutter already delivered, ignored", number);
            return;
        }
        entry.shutter = Some(timestamp_ns);
        self.pump(&mut seq);
    }

    pub fn push_partial(&self, number: u32, metadata: &Metadata) {
        let mut seq = self.lock();
        let Some(entry) = seq.entries.get_mut(&number) else {
            tracing::warn!("[R{}] partial result for unknown request", number);
            return;
        };
        if entry.partial_settled {
            tracing::warn!("[R{}] partial result already settled, ignored", number);
            return;
        }
        entry.partial = Some(metadata.clone());
        entry.partial_settled = true;
        self.pump(&mut seq);
    }

    /// No partial result will arrive for the request; its buffers may go out
    pub fn settle_partial(&self, number: u32) {
        let mut seq = self.lock();
        let Some(entry) = seq.entries.get_mut(&number) else {
            return;
        };
        if entry.partial_settled {
            return;
        }
        entry.partial_settled = true;
        self.pump(&mut seq);
    }

    pub fn push_buffer(&self, number: u32, stream: StreamId, handle: BufferHandle, status: BufferStatus) {
        let mut seq = self.lock();
        let Some(entry) = seq.entries.get_mut(&number) else {
            tracing::warn!("[R{}] buffer {:?} for unknown request", number, handle);
            return;
        };
        let pending = entry
            .buffers
            .iter_mut()
            .find(|b| b.buffer.stream == stream && b.buffer.handle == handle);
        match pending {
            Some(pending) if pending.status.is_none() => pending.status = Some(status),
            Some(_) => {
                tracing::warn!("[R{}] buffer {:?} already delivered, ignored", number, handle);
                return;
            }
            None => {
                tracing::warn!("[R{}] buffer {:?} on {} not in request", number, handle, stream);
                return;
            }
        }
        self.pump(&mut seq);
    }

    /// Record an error. Buffer errors fail the first undelivered buffer of
    /// that stream; request and result errors end the request.
    pub fn push_error(&self, number: u32, kind: ErrorKind) {
        let mut seq = self.lock();
        let Some(entry) = seq.entries.get_mut(&number) else {
            tracing::warn!("[R{}] {:?} error for unknown request", number, kind);
            return;
        };
        match kind {
            ErrorKind::Buffer { stream } => {
                if let Some(pending) = entry
                    .buffers
                    .iter_mut()
                    .find(|b| b.buffer.stream == stream && b.status.is_none())
                {
                    pending.status = Some(BufferStatus::Error);
                }
            }
            ErrorKind::Request | ErrorKind::Result => match entry.terminal {
                None | Some(Terminal::Final) => entry.terminal = Some(Terminal::Error(kind)),
                Some(Terminal::Error(_)) => {
                    tracing::warn!("[R{}] already failed, {:?} ignored", number, kind);
                    return;
                }
            },
            ErrorKind::Device => {
                tracing::warn!("[R{}] device errors are not per request", number);
                return;
            }
        }
        self.pump(&mut seq);
    }

    /// One frame of the request completed. Its metadata joins the final
    /// result; `depth` counts the stages the frame was pushed through.
    pub fn frame_done(&self, number: u32, metadata: &Metadata, depth: u32) {
        let mut seq = self.lock();
        let Some(entry) = seq.entries.get_mut(&number) else {
            tracing::warn!("[R{}] frame done for unknown request", number);
            return;
        };
        if entry.frames_finished() {
            tracing::warn!("[R{}] more frames done than expected, ignored", number);
            return;
        }
        entry.frames_done += 1;
        entry.result.merge(metadata);
        entry.pipeline_depth += depth;
        if entry.frames_finished() {
            entry.partial_settled = true;
            let unresolved = entry.fail_unresolved();
            if unresolved > 0 {
                tracing::warn!("[R{}] {} buffers never produced", number, unresolved);
            }
            if entry.terminal.is_none() {
                entry.terminal = Some(Terminal::Final);
            }
        }
        self.pump(&mut seq);
    }

    /// Terminate every pending request with an error and return all of its
    /// buffers. Returns how many requests were flushed.
    pub fn flush_pending(&self) -> usize {
        let mut seq = self.lock();
        seq.service.clear();
        let mut flushed = 0;
        for (number, entry) in seq.entries.iter_mut() {
            entry.fail_unresolved();
            entry.partial_settled = true;
            if !entry.frames_finished() {
                entry.frames_expected = entry.frames_expected.max(1);
                entry.frames_done = entry.frames_expected;
            }
            if !matches!(entry.terminal, Some(Terminal::Error(_))) {
                entry.terminal = Some(Terminal::Error(ErrorKind::Request));
            }
            tracing::debug!("[R{}] flushed", number);
            flushed += 1;
        }
        self.pump(&mut seq);
        if !seq.entries.is_empty() {
            tracing::error!("{} requests survived flush", seq.entries.len());
        }
        flushed
    }

    /// Report a fatal device error (frame id 0)
    pub fn emit_device_error(&self) {
        let _seq = self.lock();
        self.sink.on_error(0, ErrorKind::Device);
    }

    /// Monitor tick. `None` when nothing is pending.
    pub fn bump_result_delay(&self) -> Option<u32> {
        if !self.has_pending() {
            self.result_renew.store(0, Ordering::Release);
            return None;
        }
        Some(self.result_renew.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn result_delay(&self) -> u32 {
        self.result_renew.load(Ordering::Acquire)
    }

    fn pump(&self, seq: &mut Sequencer) {
        let sink = &self.sink;
        let mut emitted = false;
        let mut shutters_in_order = true;
        let mut earlier_terminal = true;

        for (&number, entry) in seq.entries.iter_mut() {
            if !entry.shutter_sent && shutters_in_order {
                if let Some(ts) = entry.shutter {
                    sink.on_shutter(number, ts);
                    entry.shutter_sent = true;
                    entry.any_sent = true;
                    emitted = true;
                }
            }

            // Without a shutter, results wait for the request to settle. A
            // request error then goes out before its buffers.
            let request_failed = entry.terminal == Some(Terminal::Error(ErrorKind::Request));
            if entry.shutter_sent || (entry.shutter_settled() && !request_failed) {
                if !entry.partial_sent {
                    if let Some(partial) = entry.partial.take() {
                        sink.on_partial_metadata(number, &partial);
                        entry.partial_sent = true;
                        entry.any_sent = true;
                        emitted = true;
                    }
                }
                let buffers_ready = entry.partial_settled && entry.partial.is_none();
                for pending in entry.buffers.iter_mut().filter(|b| buffers_ready && !b.sent) {
                    let Some(status) = pending.status else {
                        continue;
                    };
                    if status == BufferStatus::Error {
                        sink.on_error(
                            number,
                            ErrorKind::Buffer {
                                stream: pending.buffer.stream,
                            },
                        );
                    }
                    sink.on_buffer_ready(number, pending.buffer.stream, pending.buffer.handle, status);
                    pending.sent = true;
                    entry.any_sent = true;
                    emitted = true;
                }
            }

            if earlier_terminal && !entry.terminal_sent && entry.frames_finished() {
                if let Some(terminal) = entry.terminal {
                    emitted |= Self::emit_terminal(sink.as_ref(), number, entry, terminal);
                }
            }

            shutters_in_order &= entry.shutter_settled();
            earlier_terminal &= entry.terminal_sent;
        }

        seq.entries.retain(|_, entry| !entry.terminal_sent);
        if emitted {
            self.result_renew.store(0, Ordering::Release);
        }
    }

    fn emit_terminal(sink: &dyn ResultSink, number: u32, entry: &mut RequestEntry, terminal: Terminal) -> bool {
        let terminal = match terminal {
            Terminal::Error(ErrorKind::Request) if entry.any_sent => {
                tracing::debug!("[R{}] request error downgraded, results already out", number);
                Terminal::Error(ErrorKind::Result)
            }
            other => other,
        };

        match terminal {
            Terminal::Final => {
                // Shutter or buffers still owed: they go first
                if !entry.shutter_settled() || !entry.all_buffers_sent() {
                    return false;
                }
                let mut result = std::mem::take(&mut entry.result);
                result.set("request.pipeline_depth", entry.pipeline_depth as i64);
                result.set("request.frame_number", number as i64);
                sink.on_final_metadata(number, &result);
            }
            Terminal::Error(ErrorKind::Request) => {
                sink.on_error(number, ErrorKind::Request);
                for pending in entry.buffers.iter_mut().filter(|b| !b.sent) {
                    sink.on_buffer_ready(number, pending.buffer.stream, pending.buffer.handle, BufferStatus::Error);
                    pending.sent = true;
                }
            }
            Terminal::Error(kind) => {
                for pending in entry.buffers.iter_mut().filter(|b| !b.sent) {
                    let status = pending.status.unwrap_or(BufferStatus::Error);
                    sink.on_buffer_ready(number, pending.buffer.stream, pending.buffer.handle, status);
                    pending.sent = true;
                }
                sink.on_error(number, kind);
            }
        }
        tracing::trace!("[R{}] terminal {:?}", number, terminal);
        entry.terminal_sent = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bridge::MockResultSink;
    use mockall::predicate::*;
    use mockall::Sequence;

    fn streams() -> Vec<StreamConfig> {
        vec![
            StreamConfig::new(0, StreamKind::Preview, 640, 480),
            StreamConfig::new(1, StreamKind::Capture, 1920, 1080),
            StreamConfig::new(2, StreamKind::Input, 1920, 1080),
        ]
    }

    fn manager(sink: MockResultSink) -> RequestManager {
        let manager = RequestManager::new(Arc::new(sink));
        manager.set_streams(&streams()).unwrap();
        manager
    }

    fn preview_request(number: u32) -> Request {
        Request::new(number).with_output(StreamId(0), BufferHandle(number as u64 * 10))
    }

    #[test]
    fn test_rejects_malformed_requests() {
        let manager = manager(MockResultSink::new());
        assert!(manager.register_request(Request::new(1)).is_err());
        assert!(manager
            .register_request(Request::new(1).with_output(StreamId(9), BufferHandle(1)))
            .is_err());
        assert!(manager
            .register_request(Request::new(1).with_output(StreamId(2), BufferHandle(1)))
            .is_err());
        assert!(manager
            .register_request(preview_request(1).with_input(StreamId(0), BufferHandle(2)))
            .is_err());

        assert_eq!(manager.register_request(preview_request(5)).unwrap(), 5);
        let err = manager.register_request(preview_request(5)).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::InvalidArgument);
        assert_eq!(manager.pending_len(), 1);
    }

    #[test]
    fn test_plan_splits_outputs() {
        let manager = manager(MockResultSink::new());
        manager
            .register_request(
                preview_request(1).with_output(StreamId(1), BufferHandle(99)),
            )
            .unwrap();
        manager
            .register_request(Request::new(2).with_output(StreamId(1), BufferHandle(98)))
            .unwrap();

        let first = manager.pop_service().unwrap();
        assert!(!first.is_capture_only());
        assert!(first.needs_capture());
        // Refused by the predicate, so it stays queued
        assert!(manager.pop_service_if(|p| !p.is_capture_only()).is_none());
        assert_eq!(manager.service_len(), 1);
        assert!(manager.pop_service().unwrap().is_capture_only());
    }

    #[test]
    fn test_single_request_callback_order() {
        let mut sink = MockResultSink::new();
        let mut order = Sequence::new();
        sink.expect_on_shutter()
            .with(eq(1), eq(500))
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_partial_metadata()
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_buffer_ready()
            .with(eq(1), eq(StreamId(0)), eq(BufferHandle(10)), eq(BufferStatus::Ok))
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_final_metadata()
            .withf(|id, meta| *id == 1 && meta.get_int("request.pipeline_depth") == Some(4))
            .times(1)
            .in_sequence(&mut order)
            .return_const(());

        let manager = manager(sink);
        manager.register_request(preview_request(1)).unwrap();
        manager.pop_service();
        manager.expect_frames(1, 1);

        // Buffer and partial arrive before the shutter; they must wait for it
        manager.push_buffer(1, StreamId(0), BufferHandle(10), BufferStatus::Ok);
        manager.push_partial(1, &Metadata::new());
        manager.notify_shutter(1, 500);
        manager.frame_done(1, &Metadata::new(), 4);
        assert!(!manager.has_pending());
    }

    #[test]
    fn test_failed_capture_buffer_waits_for_partial() {
        let mut sink = MockResultSink::new();
        let mut order = Sequence::new();
        sink.expect_on_shutter()
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_partial_metadata()
            .with(eq(1), always())
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_error()
            .with(eq(1), eq(ErrorKind::Buffer { stream: StreamId(1) }))
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_buffer_ready()
            .with(eq(1), eq(StreamId(1)), eq(BufferHandle(11)), eq(BufferStatus::Error))
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_buffer_ready()
            .with(eq(1), eq(StreamId(0)), eq(BufferHandle(10)), eq(BufferStatus::Ok))
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_final_metadata()
            .times(1)
            .in_sequence(&mut order)
            .return_const(());

        let manager = manager(sink);
        manager
            .register_request(preview_request(1).with_output(StreamId(1), BufferHandle(11)))
            .unwrap();
        manager.pop_service();
        manager.expect_frames(1, 2);
        manager.notify_shutter(1, 100);

        // The capture frame fails while the client frame is still in 3A
        manager.push_buffer(1, StreamId(1), BufferHandle(11), BufferStatus::Error);
        manager.frame_done(1, &Metadata::new(), 1);
        assert_eq!(manager.pending_len(), 1);

        manager.push_partial(1, &Metadata::new().with("control.ae_state", "converged"));
        manager.settle_partial(1);
        manager.push_buffer(1, StreamId(0), BufferHandle(10), BufferStatus::Ok);
        manager.frame_done(1, &Metadata::new(), 4);
        assert!(!manager.has_pending());
    }

    #[test]
    fn test_settled_without_partial_releases_buffers() {
        let mut sink = MockResultSink::new();
        let mut order = Sequence::new();
        sink.expect_on_shutter()
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_buffer_ready()
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_partial_metadata().never();

        let manager = manager(sink);
        manager.register_request(preview_request(1)).unwrap();
        manager.expect_frames(1, 1);
        manager.notify_shutter(1, 5);
        manager.push_buffer(1, StreamId(0), BufferHandle(10), BufferStatus::Ok);
        manager.settle_partial(1);
        // A partial that shows up after its buffers is dropped
        manager.push_partial(1, &Metadata::new());
        assert_eq!(manager.pending_len(), 1);
    }

    #[test]
    fn test_terminal_waits_for_earlier_request() {
        let mut sink = MockResultSink::new();
        let mut order = Sequence::new();
        sink.expect_on_shutter().times(2).return_const(());
        sink.expect_on_buffer_ready().times(2).return_const(());
        sink.expect_on_final_metadata()
            .with(eq(1), always())
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_final_metadata()
            .with(eq(2), always())
            .times(1)
            .in_sequence(&mut order)
            .return_const(());

        let manager = manager(sink);
        for n in [1, 2] {
            manager.register_request(preview_request(n)).unwrap();
            manager.expect_frames(n, 1);
        }
        manager.notify_shutter(1, 10);
        manager.notify_shutter(2, 20);
        manager.push_buffer(2, StreamId(0), BufferHandle(20), BufferStatus::Ok);
        manager.frame_done(2, &Metadata::new(), 3);
        assert_eq!(manager.pending_len(), 2);

        manager.push_buffer(1, StreamId(0), BufferHandle(10), BufferStatus::Ok);
        manager.frame_done(1, &Metadata::new(), 3);
        assert_eq!(manager.pending_len(), 0);
    }

    #[test]
    fn test_request_error_returns_buffers() {
        let mut sink = MockResultSink::new();
        let mut order = Sequence::new();
        sink.expect_on_error()
            .with(eq(1), eq(ErrorKind::Request))
            .times(1)
            .in_sequence(&mut order)
            .return_const(());
        sink.expect_on_buffer_ready()
            .with(eq(1), always(), always(), eq(BufferStatus::Error))
            .times(1)
            .in_sequence(&mut order)
            .return_const(());

        let manager = manager(sink);
        manager.register_request(preview_request(1)).unwrap();
        manager.expect_frames(1, 1);
        manager.push_buffer(1, StreamId(0), BufferHandle(10), BufferStatus::Error);
        manager.push_error(1, ErrorKind::Request);
        manager.frame_done(1, &Metadata::new(), 1);
        assert!(!manager.has_pending());
    }

    #[test]
    fn test_request_error_after_shutter_becomes_result_error() {
        let mut sink = MockResultSink::new();
        sink.expect_on_shutter().times(1).return_const(());
        sink.expect_on_error()
            .with(eq(1), eq(ErrorKind::Buffer { stream: StreamId(0) }))
            .times(1)
            .return_const(());
        sink.expect_on_buffer_ready().times(1).return_const(());
        sink.expect_on_error()
            .with(eq(1), eq(ErrorKind::Result))
            .times(1)
            .return_const(());

        let manager = manager(sink);
        manager.register_request(preview_request(1)).unwrap();
        manager.expect_frames(1, 1);
        manager.notify_shutter(1, 1);
        manager.push_error(1, ErrorKind::Buffer { stream: StreamId(0) });
        manager.push_error(1, ErrorKind::Request);
        manager.frame_done(1, &Metadata::new(), 1);
        assert!(!manager.has_pending());
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let mut sink = MockResultSink::new();
        sink.expect_on_shutter().times(1).return_const(());
        sink.expect_on_buffer_ready().times(1).return_const(());
        sink.expect_on_final_metadata().times(1).return_const(());

        let manager = manager(sink);
        manager.register_request(preview_request(1)).unwrap();
        manager.expect_frames(1, 1);
        manager.notify_shutter(1, 1);
        manager.notify_shutter(1, 2);
        manager.push_buffer(1, StreamId(0), BufferHandle(10), BufferStatus::Ok);
        manager.push_buffer(1, StreamId(0), BufferHandle(10), BufferStatus::Ok);
        manager.frame_done(1, &Metadata::new(), 1);
        // After the terminal callback the request is gone
        manager.frame_done(1, &Metadata::new(), 1);
    }

    #[test]
    fn test_flush_terminates_everything() {
        let mut sink = MockResultSink::new();
        sink.expect_on_shutter().times(1).return_const(());
        sink.expect_on_buffer_ready()
            .with(always(), always(), always(), eq(BufferStatus::Error))
            .times(3)
            .return_const(());
        sink.expect_on_error()
            .with(eq(1), eq(ErrorKind::Buffer { stream: StreamId(0) }))
            .times(1)
            .return_const(());
        sink.expect_on_error()
            .with(eq(1), eq(ErrorKind::Result))
            .times(1)
            .return_const(());
        sink.expect_on_error()
            .with(function(|n: &u32| *n == 2 || *n == 3), eq(ErrorKind::Request))
            .times(2)
            .return_const(());

        let manager = manager(sink);
        for n in 1..=3 {
            manager.register_request(preview_request(n)).unwrap();
        }
        manager.pop_service();
        manager.expect_frames(1, 1);
        manager.notify_shutter(1, 1);

        assert_eq!(manager.flush_pending(), 3);
        assert!(!manager.has_pending());
        assert_eq!(manager.service_len(), 0);
        // Accepting resumes after flush
        manager.register_request(preview_request(4)).unwrap();
    }

    #[test]
    fn test_result_delay_counter() {
        let mut sink = MockResultSink::new();
        sink.expect_on_shutter().return_const(());
        let manager = manager(sink);
        assert_eq!(manager.bump_result_delay(), None);

        manager.register_request(preview_request(1)).unwrap();
        assert_eq!(manager.bump_result_delay(), Some(1));
        assert_eq!(manager.bump_result_delay(), Some(2));
        manager.expect_frames(1, 1);
        manager.notify_shutter(1, 0);
        assert_eq!(manager.result_delay(), 0);
    }
}
