//! On-disk configuration for the Navarch control plane binary.
//!
//! One JSON document aggregates the tunables of every component; the
//! binary reads the relevant section when constructing each one.

#![forbid(unsafe_code)]

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: String, #[source] source: serde_json::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: String, #[source] source: std::io::Error },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_seconds: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default)]
    pub enabled_health_checks: Vec<String>,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_seconds: default_health_check_interval(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            enabled_health_checks: vec!["nvml".into()],
            listen_address: default_listen_address(),
        }
    }
}

fn default_health_check_interval() -> u64 {
    30
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_listen_address() -> String {
    "0.0.0.0:7000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolManagerConfig {
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_seconds: u64,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self { evaluation_interval_seconds: default_evaluation_interval() }
    }
}

fn default_evaluation_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTrackerConfig {
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_seconds: u64,
    #[serde(default = "default_stale_check_interval")]
    pub stale_check_interval_seconds: u64,
    #[serde(default = "default_retain_terminated")]
    pub retain_terminated_seconds: u64,
}

impl Default for InstanceTrackerConfig {
    fn default() -> Self {
        Self {
            registration_timeout_seconds: default_registration_timeout(),
            stale_check_interval_seconds: default_stale_check_interval(),
            retain_terminated_seconds: default_retain_terminated(),
        }
    }
}

fn default_registration_timeout() -> u64 {
    10 * 60
}
fn default_stale_check_interval() -> u64 {
    60
}
fn default_retain_terminated() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMonitorConfig {
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    #[serde(default = "default_heartbeat_check_interval")]
    pub check_interval_seconds: u64,
}

impl Default for HeartbeatMonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            check_interval_seconds: default_heartbeat_check_interval(),
        }
    }
}

fn default_heartbeat_timeout() -> u64 {
    2 * 60
}
fn default_heartbeat_check_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureTrackerConfig {
    #[serde(default = "default_base_backoff")]
    pub base_backoff_seconds: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_reset_after")]
    pub reset_after_seconds: u64,
}

impl Default for FailureTrackerConfig {
    fn default() -> Self {
        Self {
            base_backoff_seconds: default_base_backoff(),
            max_backoff_seconds: default_max_backoff(),
            backoff_factor: default_backoff_factor(),
            reset_after_seconds: default_reset_after(),
        }
    }
}

fn default_base_backoff() -> u64 {
    30
}
fn default_max_backoff() -> u64 {
    10 * 60
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_reset_after() -> u64 {
    5 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NavarchConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool_manager: PoolManagerConfig,
    #[serde(default)]
    pub instance_tracker: InstanceTrackerConfig,
    #[serde(default)]
    pub heartbeat_monitor: HeartbeatMonitorConfig,
    #[serde(default)]
    pub failure_tracker: FailureTrackerConfig,
}

impl NavarchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        serde_json::from_str(&data)
            .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| ConfigError::Write { path: path.display().to_string(), source })?;
        }
        let data = serde_json::to_string_pretty(self).expect("NavarchConfig always serializes");
        std::fs::write(path, data)
            .map_err(|source| ConfigError::Write { path: path.display().to_string(), source })
    }
}
