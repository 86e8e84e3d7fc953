//! Core data types for the camera pipeline
//!
//! This module contains the vocabulary shared by every other module: which
//! pipeline stages exist, what kind of frame is travelling through them, the
//! per-stage state machine, caller-visible error kinds, metadata maps and
//! stream descriptions.
//!
//! # Main Types
//!
//! - [`StageKind`] - Tagged identifier of one processing stage
//! - [`StageSet`] - Compact set of stages (which stages a frame visits)
//! - [`FrameType`] - Client, internal or capture frame
//! - [`EntityState`] - Per-stage state of one frame
//! - [`Metadata`] - Ordered key/value map carried by requests and results
//! - [`StreamConfig`] - A negotiated output or input stream
//! - [`RollingStats`] - Latency statistics over a bounded window

use crate::pipeline::id::StreamId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Size of the rolling window used for stage latency statistics
pub const LATENCY_WINDOW_SIZE: usize = 100;

// ==================== Stages ====================

/// One hardware or software processing step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Sensor readout into a raw (bayer) buffer
    Sensor,
    /// Demosaic front end and 3A statistics
    Stats3a,
    /// Image signal processor
    Isp,
    /// Multi-output scaler producing client stream buffers
    Scaler,
    /// High quality reprocessing of a held raw (capture path)
    Reprocessing,
    /// Ancillary raw duplication for debugging
    Dump,
}

impl StageKind {
    /// Every stage in pipeline order
    pub const ALL: [StageKind; 6] = [
        StageKind::Sensor,
        StageKind::Stats3a,
        StageKind::Isp,
        StageKind::Scaler,
        StageKind::Reprocessing,
        StageKind::Dump,
    ];

    /// Number of stages
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index, usable for per-stage arrays
    #[inline]
    pub fn index(self) -> usize {
        match self {
            StageKind::Sensor => 0,
            StageKind::Stats3a => 1,
            StageKind::Isp => 2,
            StageKind::Scaler => 3,
            StageKind::Reprocessing => 4,
            StageKind::Dump => 5,
        }
    }

    /// Short lowercase name used in logs and configuration
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Sensor => "sensor",
            StageKind::Stats3a => "3aa",
            StageKind::Isp => "isp",
            StageKind::Scaler => "scaler",
            StageKind::Reprocessing => "reprocessing",
            StageKind::Dump => "dump",
        }
    }

    #[inline]
    fn bit(self) -> u8 {
        1 << self.index()
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compact set of stages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StageSet(u8);

impl StageSet {
    /// The empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build a set from a slice of stages
    pub fn of(stages: &[StageKind]) -> Self {
        let mut set = Self::empty();
        for &stage in stages {
            set.insert(stage);
        }
        set
    }

    pub fn insert(&mut self, stage: StageKind) {
        self.0 |= stage.bit();
    }

    pub fn remove(&mut self, stage: StageKind) {
        self.0 &= !stage.bit();
    }

    #[inline]
    pub fn contains(&self, stage: StageKind) -> bool {
        self.0 & stage.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Stages in pipeline order
    pub fn iter(&self) -> impl Iterator<Item = StageKind> + '_ {
        StageKind::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// How two adjacent hardware stages are connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageLink {
    /// Chained on-the-fly: the downstream stage runs inside the upstream one
    Otf,
    /// Memory-to-memory: separate stage with its own queue and buffers
    #[default]
    M2m,
}

// ==================== Frames ====================

/// What a frame is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// Carries a client request through the preview path
    Client,
    /// Keeps sensor cadence, never visible to the caller
    Internal,
    /// Reprocesses a held raw (or a caller input buffer) for still capture
    Capture,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Client => write!(f, "client"),
            FrameType::Internal => write!(f, "internal"),
            FrameType::Capture => write!(f, "capture"),
        }
    }
}

/// State machine of one stage-entity:
/// `NotRequested -> Requested -> Processing -> Complete | Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EntityState {
    #[default]
    NotRequested,
    Requested,
    Processing,
    Complete,
    Error,
}

impl EntityState {
    /// Terminal states
    #[inline]
    pub fn is_done(self) -> bool {
        matches!(self, EntityState::Complete | EntityState::Error)
    }

    /// True once the entity participates in the frame
    #[inline]
    pub fn is_requested(self) -> bool {
        !matches!(self, EntityState::NotRequested)
    }
}

// ==================== Results ====================

/// Caller-visible error notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No output (metadata or buffers) will be produced for the request
    Request,
    /// Result metadata is lost; buffers are still delivered
    Result,
    /// One output buffer failed; metadata and other buffers may be fine
    Buffer { stream: StreamId },
    /// Fatal device error, only close is possible
    Device,
}

/// Status attached to every buffer handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferStatus {
    Ok,
    Error,
}

// ==================== Metadata ====================

/// One metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Int(i64),
    Float(f64),
    Text(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Text(v.to_string())
    }
}

impl From<Vec<i64>> for MetaValue {
    fn from(v: Vec<i64>) -> Self {
        MetaValue::Ints(v)
    }
}

impl From<Vec<f64>> for MetaValue {
    fn from(v: Vec<f64>) -> Self {
        MetaValue::Floats(v)
    }
}

/// Ordered metadata map. Tag translation lives outside this crate, so keys are
/// plain dotted strings (`"sensor.timestamp"`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetaValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(MetaValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(MetaValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Overlay `other` on top of `self`
    pub fn merge(&mut self, other: &Metadata) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.0.iter()
    }
}

// ==================== Streams ====================

/// Role of a negotiated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Produced by the scaler of a client frame
    Preview,
    /// Produced by the scaler of a client frame
    Video,
    /// Produced by the reprocessing stage of a capture frame
    Capture,
    /// Caller-supplied buffer to reprocess
    Input,
}

impl StreamKind {
    /// Output produced on the preview path
    pub fn is_preview_path(self) -> bool {
        matches!(self, StreamKind::Preview | StreamKind::Video)
    }
}

/// Pixel layout of a stream. Vendor format tables are out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    #[default]
    Yuv420,
    Raw10,
    Blob,
}

impl PixelFormat {
    /// Bytes needed for one frame of `width x height`
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Yuv420 => pixels * 3 / 2,
            PixelFormat::Raw10 => pixels * 5 / 4,
            PixelFormat::Blob => pixels,
        }
    }
}

/// A stream negotiated through `configure_streams`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: StreamId,
    pub kind: StreamKind,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Maximum buffers the caller may have in flight on this stream
    pub max_buffers: u32,
}

impl StreamConfig {
    pub fn new(id: u32, kind: StreamKind, width: u32, height: u32) -> Self {
        let format = match kind {
            StreamKind::Capture => PixelFormat::Blob,
            StreamKind::Input => PixelFormat::Raw10,
            _ => PixelFormat::Yuv420,
        };
        Self {
            id: StreamId(id),
            kind,
            width,
            height,
            format,
            max_buffers: 4,
        }
    }

    pub fn with_max_buffers(mut self, max_buffers: u32) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

// ==================== Statistics ====================

/// Latency statistics over a bounded rolling window
#[derive(Debug, Clone)]
pub struct RollingStats {
    /// Total samples ever recorded
    pub count: u64,
    /// Minimum observed (microseconds)
    pub min_us: u64,
    /// Maximum observed (microseconds)
    pub max_us: u64,
    window: VecDeque<u64>,
    window_sum: u64,
}

impl Default for RollingStats {
    fn default() -> Self {
        Self {
            count: 0,
            min_us: u64::MAX,
            max_us: 0,
            window: VecDeque::with_capacity(LATENCY_WINDOW_SIZE),
            window_sum: 0,
        }
    }
}

impl RollingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample
    pub fn push(&mut self, value_us: u64) {
        self.count += 1;
        self.min_us = self.min_us.min(value_us);
        self.max_us = self.max_us.max(value_us);
        if self.window.len() == LATENCY_WINDOW_SIZE {
            if let Some(old) = self.window.pop_front() {
                self.window_sum -= old;
            }
        }
        self.window.push_back(value_us);
        self.window_sum += value_us;
    }

    /// Average over the rolling window
    pub fn average_us(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window_sum as f64 / self.window.len() as f64
        }
    }

    /// (min, max, avg) or zeros when empty
    pub fn as_tuple(&self) -> (u64, u64, f64) {
        if self.count == 0 {
            (0, 0, 0.0)
        } else {
            (self.min_us, self.max_us, self.average_us())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_set_iterates_in_pipeline_order() {
        let set = StageSet::of(&[StageKind::Scaler, StageKind::Sensor, StageKind::Isp]);
        let order: Vec<_> = set.iter().collect();
        assert_eq!(
            order,
            vec![StageKind::Sensor, StageKind::Isp, StageKind::Scaler]
        );
        assert_eq!(set.len(), 3);
        assert!(!set.contains(StageKind::Dump));
    }

    #[test]
    fn test_stage_set_remove() {
        let mut set = StageSet::of(&StageKind::ALL);
        set.remove(StageKind::Dump);
        assert_eq!(set.len(), StageKind::COUNT - 1);
        assert!(!set.contains(StageKind::Dump));
        assert!(StageSet::empty().is_empty());
    }

    #[test]
    fn test_entity_state_predicates() {
        assert!(!EntityState::NotRequested.is_requested());
        assert!(EntityState::Processing.is_requested());
        assert!(EntityState::Error.is_done());
        assert!(!EntityState::Requested.is_done());
    }

    #[test]
    fn test_metadata_merge_overrides() {
        let mut base = Metadata::new()
            .with("control.ae_mode", "on")
            .with("sensor.exposure_time", 10_000i64);
        let update = Metadata::new().with("sensor.exposure_time", 20_000i64);
        base.merge(&update);
        assert_eq!(base.get_int("sensor.exposure_time"), Some(20_000));
        assert_eq!(base.get_text("control.ae_mode"), Some("on"));
        assert_eq!(base.len(), 2);
    }

    #[test]
    fn test_metadata_serializes_as_plain_map() {
        let meta = Metadata::new().with("a", 1i64).with("b", "x");
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"a":1,"b":"x"}"#);
    }

    #[test]
    fn test_pixel_format_sizes() {
        assert_eq!(PixelFormat::Yuv420.frame_size(4, 4), 24);
        assert_eq!(PixelFormat::Raw10.frame_size(4, 4), 20);
        assert_eq!(PixelFormat::Blob.frame_size(4, 4), 16);
    }

    #[test]
    fn test_rolling_stats_window() {
        let mut stats = RollingStats::new();
        assert_eq!(stats.as_tuple(), (0, 0, 0.0));
        for v in 0..(LATENCY_WINDOW_SIZE as u64 + 10) {
            stats.push(v);
        }
        let (min, max, avg) = stats.as_tuple();
        assert_eq!(min, 0);
        assert_eq!(max, LATENCY_WINDOW_SIZE as u64 + 9);
        // Window holds 10..110
        assert!((avg - 59.5).abs() < 1e-9);
    }
}
