//! Configuration module for the camera pipeline
//!
//! This module holds every tunable of the orchestrator:
//! - Sensor cadence and control latency
//! - Per-stage buffer pool sizing and allocation policy
//! - Stage queue sizing, link types between hardware stages and handler names
//! - Capture-path selection (hold depth, retry budget, match policy)
//! - Watchdog monitor limits
//! - Optional raw dump output
//!
//! # Config Location
//!
//! The default configuration file lives in the platform config directory:
//! - **Linux**: `~/.config/camera-pipeline/pipeline.toml`
//! - **macOS**: `~/Library/Application Support/camera-pipeline/pipeline.toml`
//! - **Windows**: `%APPDATA%\camera-pipeline\pipeline.toml`
//!
//! # Example
//!
//! ```ignore
//! use camera_pipeline::config::PipelineConfig;
//!
//! let mut config = PipelineConfig::load_or_default(PipelineConfig::default_path());
//! config.selector.hold_depth = 4;
//! config.validate()?;
//! config.save("pipeline.toml")?;
//! ```

use crate::buffer::PoolKind;
use crate::error::{CameraError, Result};
use crate::types::{StageKind, StageLink};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "camera-pipeline";

/// Config filename
pub const CONFIG_FILE: &str = "pipeline.toml";

/// Default sensor frame duration (30 fps)
pub const DEFAULT_FRAME_DURATION_MS: u64 = 33;

/// Default interval between selector polls
pub const DEFAULT_SELECTOR_INTERVAL_MS: u64 = 200;

/// Default monitor period
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 200;

// ==================== Config Directory ====================

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

// ==================== Pipeline Config ====================

/// Root configuration of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PipelineConfig {
    #[serde(default)]
    pub sensor: SensorConfig,

    #[serde(default)]
    pub pools: PoolsConfig,

    #[serde(default)]
    pub stages: StagesConfig,

    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub dump: DumpConfig,
}

impl PipelineConfig {
    /// `<config_dir>/camera-pipeline/pipeline.toml`, or a relative file when
    /// the platform has no config directory
    pub fn default_path() -> PathBuf {
        config_dir()
            .map(|d| d.join(CONFIG_FILE))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    /// Load a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CameraError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            CameraError::Config(format!("Failed to parse config {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save as TOML, creating the parent directory if needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CameraError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| CameraError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| CameraError::Config(format!("Failed to write config {:?}: {}", path, e)))
    }

    /// Pretty JSON, used for diagnostics dumps
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sensor.frame_duration_ms == 0 {
            return Err(CameraError::Config(
                "sensor.frame_duration_ms must be non-zero".into(),
            ));
        }

        for kind in PoolKind::ALL {
            let pool = self.pools.get(kind);
            if pool.count == 0 {
                return Err(CameraError::Config(format!(
                    "pools.{}.count must be non-zero",
                    kind
                )));
            }
            if pool.max_count < pool.count {
                return Err(CameraError::Config(format!(
                    "pools.{}.max_count ({}) is smaller than count ({})",
                    kind, pool.max_count, pool.count
                )));
            }
            if pool.buffer_size == 0 {
                return Err(CameraError::Config(format!(
                    "pools.{}.buffer_size must be non-zero",
                    kind
                )));
            }
        }

        if self.stages.queue_capacity == 0 {
            return Err(CameraError::Config(
                "stages.queue_capacity must be non-zero".into(),
            ));
        }
        if self.stages.pop_timeout_ms == 0 {
            return Err(CameraError::Config(
                "stages.pop_timeout_ms must be non-zero".into(),
            ));
        }

        if self.selector.hold_depth == 0 {
            return Err(CameraError::Config(
                "selector.hold_depth must be non-zero".into(),
            ));
        }
        // Held raws plus the frames in flight must fit in the raw pool
        if self.pools.raw.max_count as usize <= self.selector.hold_depth {
            return Err(CameraError::Config(format!(
                "pools.raw.max_count ({}) must exceed selector.hold_depth ({})",
                self.pools.raw.max_count, self.selector.hold_depth
            )));
        }

        if self.monitor.interval_ms == 0 {
            return Err(CameraError::Config(
                "monitor.interval_ms must be non-zero".into(),
            ));
        }

        Ok(())
    }
}

// ==================== Sensor ====================

/// Sensor cadence and control latency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorConfig {
    /// Time between two sensor readouts
    #[serde(default = "default_frame_duration_ms")]
    pub frame_duration_ms: u64,

    /// Frames between applying sensor controls and seeing their effect
    #[serde(default = "default_control_delay")]
    pub control_delay: u32,
}

fn default_frame_duration_ms() -> u64 {
    DEFAULT_FRAME_DURATION_MS
}

fn default_control_delay() -> u32 {
    2
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            control_delay: 2,
        }
    }
}

impl SensorConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    /// Frames after start that are always internal
    pub fn warmup_frames(&self) -> u64 {
        if self.control_delay == 0 {
            0
        } else {
            self.control_delay as u64 + 2
        }
    }
}

// ==================== Buffer Pools ====================

/// How a pool obtains its buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocMode {
    /// Allocate every buffer up front
    #[default]
    AtOnce,
    /// Allocate `count` up front, grow inside `acquire` up to `max_count`
    OnDemand,
    /// Like `OnDemand`, but growth happens on a background thread
    Silent,
}

/// Sizing of one buffer pool
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PoolSettings {
    pub count: u32,
    pub max_count: u32,
    #[serde(default)]
    pub mode: AllocMode,
    pub buffer_size: usize,
}

impl PoolSettings {
    pub const fn at_once(count: u32, buffer_size: usize) -> Self {
        Self {
            count,
            max_count: count,
            mode: AllocMode::AtOnce,
            buffer_size,
        }
    }

    pub const fn on_demand(count: u32, max_count: u32, buffer_size: usize) -> Self {
        Self {
            count,
            max_count,
            mode: AllocMode::OnDemand,
            buffer_size,
        }
    }
}

/// Per-pool settings plus the shared acquire budget
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolsConfig {
    /// Sensor output, also the hold-list currency
    #[serde(default = "default_raw_pool")]
    pub raw: PoolSettings,

    /// 3A output when 3A and ISP are separate
    #[serde(default = "default_bayer_pool")]
    pub bayer: PoolSettings,

    /// ISP output when ISP and scaler are separate
    #[serde(default = "default_yuv_pool")]
    pub yuv: PoolSettings,

    /// Dump stage copies
    #[serde(default = "default_dump_pool")]
    pub dump: PoolSettings,

    /// Total time a stage push waits for a free buffer
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_raw_pool() -> PoolSettings {
    PoolSettings::at_once(8, 4096)
}

fn default_bayer_pool() -> PoolSettings {
    PoolSettings::at_once(4, 4096)
}

fn default_yuv_pool() -> PoolSettings {
    PoolSettings::on_demand(4, 6, 4096)
}

fn default_dump_pool() -> PoolSettings {
    PoolSettings::at_once(2, 4096)
}

fn default_acquire_timeout_ms() -> u64 {
    500
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            raw: default_raw_pool(),
            bayer: default_bayer_pool(),
            yuv: default_yuv_pool(),
            dump: default_dump_pool(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl PoolsConfig {
    pub fn get(&self, kind: PoolKind) -> &PoolSettings {
        match kind {
            PoolKind::Raw => &self.raw,
            PoolKind::Bayer => &self.bayer,
            PoolKind::Yuv => &self.yuv,
            PoolKind::Dump => &self.dump,
        }
    }

    pub fn get_mut(&mut self, kind: PoolKind) -> &mut PoolSettings {
        match kind {
            PoolKind::Raw => &mut self.raw,
            PoolKind::Bayer => &mut self.bayer,
            PoolKind::Yuv => &mut self.yuv,
            PoolKind::Dump => &mut self.dump,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

// ==================== Stages ====================

/// Handler name per stage, resolved through the stage registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageHandlers {
    pub sensor: String,
    pub stats3a: String,
    pub isp: String,
    pub scaler: String,
    pub reprocessing: String,
    pub dump: String,
}

impl Default for StageHandlers {
    fn default() -> Self {
        Self {
            sensor: "sim_sensor".into(),
            stats3a: "sim_3aa".into(),
            isp: "sim_isp".into(),
            scaler: "sim_scaler".into(),
            reprocessing: "sim_reprocessing".into(),
            dump: "raw_dump".into(),
        }
    }
}

impl StageHandlers {
    pub fn get(&self, stage: StageKind) -> &str {
        match stage {
            StageKind::Sensor => &self.sensor,
            StageKind::Stats3a => &self.stats3a,
            StageKind::Isp => &self.isp,
            StageKind::Scaler => &self.scaler,
            StageKind::Reprocessing => &self.reprocessing,
            StageKind::Dump => &self.dump,
        }
    }
}

/// Stage queues, links and handlers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagesConfig {
    /// Bound of every stage queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Worker wait before re-checking its stop flag
    #[serde(default = "default_pop_timeout_ms")]
    pub pop_timeout_ms: u64,

    /// Link between sensor and 3A
    #[serde(default)]
    pub sensor_3aa: StageLink,

    /// Link between 3A and ISP
    #[serde(default = "default_otf")]
    pub stats3a_isp: StageLink,

    /// Link between ISP and scaler
    #[serde(default)]
    pub isp_scaler: StageLink,

    #[serde(default)]
    pub handlers: StageHandlers,
}

fn default_queue_capacity() -> usize {
    16
}

fn default_pop_timeout_ms() -> u64 {
    100
}

fn default_otf() -> StageLink {
    StageLink::Otf
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            pop_timeout_ms: default_pop_timeout_ms(),
            sensor_3aa: StageLink::M2m,
            stats3a_isp: StageLink::Otf,
            isp_scaler: StageLink::M2m,
            handlers: StageHandlers::default(),
        }
    }
}

impl StagesConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }
}

// ==================== Selector ====================

/// Which held raw a capture frame takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectorPolicy {
    /// Zero shutter lag: newest eligible raw
    #[default]
    Latest,
    /// The raw with the target frame count, or the next newer one
    FrameCount,
    /// The raw whose sensor timestamp is closest to the target within a window
    TimestampWindow { window_ns: u64 },
}

/// Capture-path selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectorConfig {
    /// Maximum held raws
    #[serde(default = "default_hold_depth")]
    pub hold_depth: usize,

    /// Polls before a selection gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait between polls
    #[serde(default = "default_selector_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default)]
    pub policy: SelectorPolicy,
}

fn default_hold_depth() -> usize {
    3
}

fn default_max_retries() -> u32 {
    10
}

fn default_selector_interval_ms() -> u64 {
    DEFAULT_SELECTOR_INTERVAL_MS
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            hold_depth: default_hold_depth(),
            max_retries: default_max_retries(),
            retry_interval_ms: DEFAULT_SELECTOR_INTERVAL_MS,
            policy: SelectorPolicy::Latest,
        }
    }
}

impl SelectorConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

// ==================== Monitor ====================

/// What a watchdog trip does after the device error is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FatalPolicy {
    /// Park the device in its error state; only close succeeds
    #[default]
    Error,
    /// Abort the process
    Abort,
}

/// Watchdog monitor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,

    /// Monitor periods a worker may go without renewing
    #[serde(default = "default_stall_limit")]
    pub stall_limit: u32,

    /// Monitor periods pending requests may go without any callback
    #[serde(default = "default_result_delay_limit")]
    pub result_delay_limit: u32,

    #[serde(default)]
    pub fatal_policy: FatalPolicy,
}

fn default_true() -> bool {
    true
}

fn default_monitor_interval_ms() -> u64 {
    DEFAULT_MONITOR_INTERVAL_MS
}

fn default_stall_limit() -> u32 {
    25
}

fn default_result_delay_limit() -> u32 {
    50
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            stall_limit: default_stall_limit(),
            result_delay_limit: default_result_delay_limit(),
            fatal_policy: FatalPolicy::Error,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ==================== Dump ====================

/// Raw dump side path
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DumpConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Files are only written when a directory is set
    #[serde(default)]
    pub directory: Option<PathBuf>,
}
