//! Configuration module for the group scheduler
//!
//! This module holds every tunable the scheduler consults at runtime:
//! - Carrier pool sizing and stream/group limits
//! - The shot-quota table constants used by `init` and `start`
//! - Bounded retry policies for stop and cancel
//! - Worker thread scheduling policy
//!
//! # Files
//!
//! Configuration is stored as TOML. The default location is
//! `<config dir>/dev.hxyulin.isp-groups/scheduler.toml`.
//!
//! # Example
//!
//! ```ignore
//! use isp_groups::config::SchedulerConfig;
//!
//! let mut config = SchedulerConfig::load_or_default();
//! config.stop.retries = 50;
//! config.save(SchedulerConfig::default_path().unwrap())?;
//! ```

use crate::error::{GroupError, Result, ResultExt};
use crate::types::ShotQuota;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for configuration directories
pub const APP_ID: &str = "dev.hxyulin.isp-groups";

/// Configuration filename
pub const CONFIG_FILE: &str = "scheduler.toml";

/// Default number of frame carriers per stream
pub const DEFAULT_CARRIER_POOL_SIZE: usize = 32;

/// Default number of concurrently configurable streams
pub const DEFAULT_STREAM_COUNT: usize = 9;

/// Default number of distinct group ids (and therefore worker tasks)
pub const DEFAULT_GROUP_ID_MAX: u32 = 16;

/// Default number of capture nodes a single stage configuration can address
pub const DEFAULT_CAPTURE_NODE_MAX: usize = 12;

/// Minimum shots that may run ahead of the producer
pub const MIN_OF_ASYNC_SHOTS: u32 = 1;

/// Minimum shots that must synchronize with the producer
pub const MIN_OF_SYNC_SHOTS: u32 = 2;

/// Minimum shot resource for a hardware-pipelined group
pub const MIN_OF_SHOT_RSC: u32 = 1;

/// Async shots for decoupled groups above the fast frame-rate threshold
pub const MIN_OF_ASYNC_SHOTS_240FPS: u32 = MIN_OF_ASYNC_SHOTS + 1;

// ==================== Scheduler Configuration ====================

/// Top-level scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Frame carriers allocated per stream
    #[serde(default = "default_carrier_pool_size")]
    pub carrier_pool_size: usize,
    /// Number of streams the manager can host
    #[serde(default = "default_stream_count")]
    pub stream_count: usize,
    /// Exclusive upper bound on group ids
    #[serde(default = "default_group_id_max")]
    pub group_id_max: u32,
    /// Number of capture-node configuration blocks per stage
    #[serde(default = "default_capture_node_max")]
    pub capture_node_max: usize,
    /// Shot quota table constants
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Stop drain policy
    #[serde(default)]
    pub stop: StopPolicy,
    /// Cancel settle policy
    #[serde(default)]
    pub cancel: CancelPolicy,
    /// Worker thread policy
    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_carrier_pool_size() -> usize {
    DEFAULT_CARRIER_POOL_SIZE
}

fn default_stream_count() -> usize {
    DEFAULT_STREAM_COUNT
}

fn default_group_id_max() -> u32 {
    DEFAULT_GROUP_ID_MAX
}

fn default_capture_node_max() -> usize {
    DEFAULT_CAPTURE_NODE_MAX
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            carrier_pool_size: DEFAULT_CARRIER_POOL_SIZE,
            stream_count: DEFAULT_STREAM_COUNT,
            group_id_max: DEFAULT_GROUP_ID_MAX,
            capture_node_max: DEFAULT_CAPTURE_NODE_MAX,
            quota: QuotaConfig::default(),
            stop: StopPolicy::default(),
            cancel: CancelPolicy::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Default configuration file location
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SchedulerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GroupError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load the configuration from the default location, falling back to defaults
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load scheduler config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save the configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| GroupError::Serialization(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            GroupError::Config(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    /// Reject configurations the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.carrier_pool_size == 0 {
            return Err(GroupError::Config("carrier_pool_size must be non-zero".into()));
        }
        if self.stream_count == 0 {
            return Err(GroupError::Config("stream_count must be non-zero".into()));
        }
        if self.group_id_max == 0 {
            return Err(GroupError::Config("group_id_max must be non-zero".into()));
        }
        if self.capture_node_max == 0 || self.capture_node_max > 64 {
            return Err(GroupError::Config(format!(
                "capture_node_max must be within 1..=64, got {}",
                self.capture_node_max
            )));
        }
        Ok(())
    }
}

// ==================== Quota ====================

/// Constants feeding the shot-quota table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_min_async_shots")]
    pub min_async_shots: u32,
    #[serde(default = "default_min_sync_shots")]
    pub min_sync_shots: u32,
    #[serde(default = "default_min_shot_resource")]
    pub min_shot_resource: u32,
    #[serde(default = "default_min_async_shots_240fps")]
    pub min_async_shots_240fps: u32,
    /// Frame rate above which a hardware-pipelined group gets an extra async shot
    #[serde(default = "default_high_fps_threshold")]
    pub high_fps_threshold: u32,
    /// Frame rate above which a decoupled group uses the fast async count
    #[serde(default = "default_m2m_fast_fps_threshold")]
    pub m2m_fast_fps_threshold: u32,
    /// Trade one sync shot for an async one to shorten command latency
    #[serde(default)]
    pub reduce_command_delay: bool,
    /// Replaces the computed quota of hardware-pipelined groups at start
    #[serde(default, rename = "override")]
    pub quota_override: Option<ShotQuota>,
}

fn default_min_async_shots() -> u32 {
    MIN_OF_ASYNC_SHOTS
}

fn default_min_sync_shots() -> u32 {
    MIN_OF_SYNC_SHOTS
}

fn default_min_shot_resource() -> u32 {
    MIN_OF_SHOT_RSC
}

fn default_min_async_shots_240fps() -> u32 {
    MIN_OF_ASYNC_SHOTS_240FPS
}

fn default_high_fps_threshold() -> u32 {
    240
}

fn default_m2m_fast_fps_threshold() -> u32 {
    120
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            min_async_shots: MIN_OF_ASYNC_SHOTS,
            min_sync_shots: MIN_OF_SYNC_SHOTS,
            min_shot_resource: MIN_OF_SHOT_RSC,
            min_async_shots_240fps: MIN_OF_ASYNC_SHOTS_240FPS,
            high_fps_threshold: default_high_fps_threshold(),
            m2m_fast_fps_threshold: default_m2m_fast_fps_threshold(),
            reduce_command_delay: false,
            quota_override: None,
        }
    }
}

// ==================== Retry Policies ====================

/// Bounded polling used by `stop`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopPolicy {
    /// Iterations of each wait loop
    #[serde(default = "default_stop_retries")]
    pub retries: u32,
    /// Sleep between iterations in milliseconds
    #[serde(default = "default_stop_interval_ms")]
    pub interval_ms: u64,
    /// Remaining retries below which a live producer is treated as stalled
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
}

fn default_stop_retries() -> u32 {
    150
}

fn default_stop_interval_ms() -> u64 {
    20
}

fn default_stall_threshold() -> u32 {
    100
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            retries: default_stop_retries(),
            interval_ms: default_stop_interval_ms(),
            stall_threshold: default_stall_threshold(),
        }
    }
}

impl StopPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Bounded polling used by `cancel` while an earlier frame settles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelPolicy {
    #[serde(default = "default_cancel_wait_count")]
    pub wait_count: u32,
    #[serde(default = "default_cancel_interval_us")]
    pub interval_us: u64,
}

fn default_cancel_wait_count() -> u32 {
    300
}

fn default_cancel_interval_us() -> u64 {
    1000
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            wait_count: default_cancel_wait_count(),
            interval_us: default_cancel_interval_us(),
        }
    }
}

impl CancelPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us)
    }
}

// ==================== Worker ====================

/// Worker thread scheduling policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Request SCHED_FIFO for worker threads
    #[serde(default = "default_realtime")]
    pub realtime: bool,
    /// Priority for workers of groups fed on-the-fly by a sensor
    #[serde(default = "default_otf_priority")]
    pub otf_priority: i32,
    /// Priority for workers of memory-fed groups
    #[serde(default = "default_dma_priority")]
    pub dma_priority: i32,
}

fn default_realtime() -> bool {
    true
}

fn default_otf_priority() -> i32 {
    97
}

fn default_dma_priority() -> i32 {
    96
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            realtime: default_realtime(),
            otf_priority: default_otf_priority(),
            dma_priority: default_dma_priority(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.carrier_pool_size, DEFAULT_CARRIER_POOL_SIZE);
        assert_eq!(config.stop.retries, 150);
        assert_eq!(config.stop.interval(), Duration::from_millis(20));
        assert_eq!(config.cancel.wait_count, 300);
        assert!(config.quota.quota_override.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            carrier_pool_size = 8

            [stop]
            retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.carrier_pool_size, 8);
        assert_eq!(config.stop.retries, 5);
        assert_eq!(config.stop.interval_ms, 20);
        assert_eq!(config.quota.min_sync_shots, MIN_OF_SYNC_SHOTS);
    }

    #[test]
    fn test_quota_override_parses() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            [quota.override]
            async_shots = 2
            sync_shots = 1
            skip_shots = 0
            init_shots = 2
            "#,
        )
        .unwrap();
        let quota = config.quota.quota_override.unwrap();
        assert_eq!(quota.async_shots, 2);
        assert_eq!(quota.sync_shots, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(SchedulerConfig::from_toml_str("carrier_pool_size = 0").is_err());
        assert!(SchedulerConfig::from_toml_str("capture_node_max = 65").is_err());
        assert!(SchedulerConfig::from_toml_str("carrier_pool_size = \"many\"").is_err());
    }
}
