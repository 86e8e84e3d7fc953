//! Frame completion: turns finished frames into request results.

use super::Core;
use crate::error::CameraError;
use crate::pipeline::factory::FrameListener;
use crate::pipeline::frame::Frame;
use crate::pipeline::id::FrameCount;
use crate::pipeline::monitor::MonitorHooks;
use crate::pipeline::selector::HeldRaw;
use crate::types::{BufferStatus, EntityState, ErrorKind, FrameType, Metadata, StageKind};
use std::sync::atomic::Ordering;
use std::sync::Weak;

/// Metadata keys reported early as partial results
const PARTIAL_PREFIXES: [&str; 2] = ["control.", "stats."];

pub(super) fn partial_metadata(metadata: &Metadata) -> Metadata {
    let mut partial = Metadata::new();
    for (key, value) in metadata.iter() {
        if PARTIAL_PREFIXES.iter().any(|p| key.starts_with(p)) {
            partial.set(key.clone(), value.clone());
        }
    }
    partial
}

pub(super) struct CoreListener(pub(super) Weak<Core>);

impl FrameListener for CoreListener {
    fn stage_done(&self, count: FrameCount, stage: StageKind, ok: bool) {
        if let Some(core) = self.0.upgrade() {
            core.on_stage_done(count, stage, ok);
        }
    }

    fn frame_complete(&self, count: FrameCount) {
        if let Some(core) = self.0.upgrade() {
            core.on_frame_complete(count);
        }
    }
}

pub(super) struct CoreHooks(pub(super) Weak<Core>);

impl MonitorHooks for CoreHooks {
    fn bump_result_delay(&self) -> Option<u32> {
        let core = self.0.upgrade()?;
        if core.flushing.load(Ordering::Acquire) || core.state.current() != super::DeviceState::Run {
            return None;
        }
        core.requests.bump_result_delay()
    }

    fn trip(&self, reason: CameraError) {
        if let Some(core) = self.0.upgrade() {
            core.on_fatal(reason);
        }
    }
}

impl Core {
    /// Early results: shutter after the sensor, 3A after stats.
    fn on_stage_done(&self, count: FrameCount, stage: StageKind, ok: bool) {
        if !ok || !matches!(stage, StageKind::Sensor | StageKind::Stats3a) {
            return;
        }
        let info = self.factory.with_frame(count, |frame| {
            (
                frame.frame_type(),
                frame.request(),
                frame.timestamp_ns(),
                (stage == StageKind::Stats3a).then(|| partial_metadata(frame.metadata())),
            )
        });
        let Ok((FrameType::Client, Some(number), timestamp, partial)) = info else {
            return;
        };

        match stage {
            StageKind::Sensor => {
                let ts = timestamp.unwrap_or_else(|| self.ctx.now_ns());
                self.requests.notify_shutter(number, ts);
            }
            _ => {
                if let Some(partial) = partial {
                    self.requests.push_partial(number, &partial);
                }
            }
        }
    }

    fn on_frame_complete(&self, count: FrameCount) {
        let Some(mut frame) = self.factory.table().remove(count) else {
            tracing::warn!("[{}] completed but not in the table", count);
            return;
        };

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        if frame.has_error() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            if let Some((stage, reason)) = frame.first_fault() {
                tracing::debug!("[{}] {} frame failed at {}: {}", count, frame.frame_type(), stage, reason);
            }
        }

        self.hold_raw(&mut frame);
        let leftover = frame.take_buffers();
        self.ctx.release_buffers(leftover);

        if let Some(number) = frame.request() {
            self.report_frame(&frame, number);
        }
    }

    /// Move a good raw into the hold list for later capture selection.
    fn hold_raw(&self, frame: &mut Frame) {
        if frame.frame_type() == FrameType::Capture
            || frame.state(StageKind::Sensor) != EntityState::Complete
            || !self.reprocessing.load(Ordering::Acquire)
            || self.flushing.load(Ordering::Acquire)
        {
            return;
        }
        let Some(raw) = frame.entity(StageKind::Sensor).dsts().first().copied() else {
            return;
        };
        if !frame.detach_buffer(raw) {
            return;
        }
        let held = HeldRaw {
            frame: frame.count(),
            buffer: raw,
            timestamp_ns: frame.timestamp_ns().unwrap_or_default(),
            metadata: partial_metadata(frame.metadata()),
        };
        let evicted = self.selector.manage_hold_list(held);
        if !evicted.is_empty() {
            tracing::trace!("[{}] held, evicted {:?}", frame.count(), evicted);
        }
    }

    fn report_frame(&self, frame: &Frame, number: u32) {
        let depth = frame.completed_stage_count();
        match frame.frame_type() {
            FrameType::Client => {
                // Stats3a has run or failed by now
                self.requests.settle_partial(number);
                for (out, status) in frame.output_results() {
                    self.requests.push_buffer(number, out.stream, out.handle, status);
                }
                if frame.state(StageKind::Sensor) != EntityState::Complete {
                    self.requests.push_error(number, ErrorKind::Request);
                }
                self.requests.frame_done(number, frame.metadata(), depth);
            }
            FrameType::Capture => {
                let ok = frame.state(StageKind::Reprocessing) == EntityState::Complete;
                let capture_only = frame.capture_target().map_or(true, |t| t.min_frame.is_none());

                if capture_only {
                    match (ok, frame.source()) {
                        (true, Some(source)) => {
                            self.requests.notify_shutter(number, source.timestamp_ns);
                            self.requests.push_partial(number, &source.metadata);
                        }
                        (true, None) => {
                            let ts = frame
                                .capture_target()
                                .map(|t| t.timestamp_ns)
                                .unwrap_or_else(|| self.ctx.now_ns());
                            self.requests.notify_shutter(number, ts);
                            self.requests.settle_partial(number);
                        }
                        (false, _) => self.requests.settle_partial(number),
                    }
                }
                if let Some((stream, handle)) = frame.input() {
                    let status = if ok { BufferStatus::Ok } else { BufferStatus::Error };
                    self.requests.push_buffer(number, stream, handle, status);
                }
                for (out, status) in frame.output_results() {
                    self.requests.push_buffer(number, out.stream, out.handle, status);
                }
                if capture_only && !ok {
                    self.requests.push_error(number, ErrorKind::Request);
                }
                self.requests.frame_done(number, frame.metadata(), depth);
            }
            FrameType::Internal => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_metadata_keeps_3a_keys() {
        let full = Metadata::new()
            .with("control.ae_state", "converged")
            .with("stats.luma", 0.4)
            .with("sensor.timestamp", 10i64)
            .with("jpeg.quality", 95i64);
        let partial = partial_metadata(&full);
        assert_eq!(partial.len(), 2);
        assert!(partial.contains("control.ae_state"));
        assert!(partial.contains("stats.luma"));
        assert!(!partial.contains("sensor.timestamp"));
    }
}
