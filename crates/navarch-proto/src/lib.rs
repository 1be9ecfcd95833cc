//! Shared data model for the Navarch control plane.
//!
//! These are the value records every component exchanges with the store and
//! with each other. Nothing here owns a lock or a clock; that belongs to the
//! components built on top (`navarch-store`, `navarch-registry`, ...).

#![forbid(unsafe_code)]

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error {
    use thiserror::Error;

    /// Transport-agnostic error kinds. RPC handlers map every internal
    /// failure onto one of these before it reaches a caller.
    #[derive(Debug, Error)]
    pub enum NavarchError {
        #[error("invalid argument: {0}")]
        InvalidArgument(String),
        #[error("not found: {0}")]
        NotFound(String),
        #[error("already exists: {0}")]
        AlreadyExists(String),
        #[error("internal error: {0}")]
        Internal(String),
    }

    pub type Result<T> = std::result::Result<T, NavarchError>;
}

use error::{NavarchError, Result};

// ─── Node ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Active,
    Cordoned,
    Draining,
    Unhealthy,
    Terminated,
    #[default]
    Unknown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Cordoned => "CORDONED",
            Self::Draining => "DRAINING",
            Self::Unhealthy => "UNHEALTHY",
            Self::Terminated => "TERMINATED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Worst-of ordering: Unhealthy beats Degraded beats Healthy.
    pub fn worse(self, other: Self) -> Self {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            (Healthy, Healthy) => Healthy,
            _ => Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuDescriptor {
    pub index: u32,
    pub model: String,
    pub memory_mb: u64,
}

/// Server-side tunables handed back to a node at registration time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfigSnapshot {
    pub health_check_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub enabled_health_checks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub provider: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub gpus: Vec<GpuDescriptor>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub status: NodeStatus,
    pub health_status: HealthStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub config: NodeConfigSnapshot,
}

impl NodeRecord {
    /// The reserved label key used for pool membership.
    pub const POOL_LABEL: &'static str = "pool";

    pub fn pool_name(&self) -> Option<&str> {
        self.labels.get(Self::POOL_LABEL).map(String::as_str)
    }
}

pub fn validate_node_id(node_id: &str) -> Result<()> {
    if node_id.trim().is_empty() {
        return Err(NavarchError::InvalidArgument("node_id must not be empty".into()));
    }
    Ok(())
}

// ─── Health checks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub check_name: String,
    pub status: HealthStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub results: Vec<HealthCheckResult>,
}

impl HealthCheckRecord {
    /// The single worst status across all results.
    pub fn rollup(&self) -> HealthStatus {
        self.results
            .iter()
            .fold(HealthStatus::Healthy, |acc, r| acc.worse(r.status))
    }
}

// ─── Commands ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Acknowledged,
    Completed,
    Failed,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Acknowledged => "acknowledged",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Command types recognized by IssueCommand. Unknown strings are
/// rejected with InvalidArgument when issuing; delivery via
/// GetNodeCommands is permissive of whatever was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Cordon,
    Uncordon,
    Drain,
    Terminate,
    RunDiagnostic,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cordon => "Cordon",
            Self::Uncordon => "Uncordon",
            Self::Drain => "Drain",
            Self::Terminate => "Terminate",
            Self::RunDiagnostic => "RunDiagnostic",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CommandType {
    type Err = NavarchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Cordon" => Ok(Self::Cordon),
            "Uncordon" => Ok(Self::Uncordon),
            "Drain" => Ok(Self::Drain),
            "Terminate" => Ok(Self::Terminate),
            "RunDiagnostic" => Ok(Self::RunDiagnostic),
            other => Err(NavarchError::InvalidArgument(format!(
                "unknown command type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: Uuid,
    pub node_id: String,
    pub command_type: CommandType,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub issued_at: DateTime<Utc>,
    pub status: CommandStatus,
}

// ─── Metrics ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuUtilizationSample {
    pub gpu_index: u32,
    pub utilization_pct: f64,
    pub memory_used_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub gpu_utilization: Vec<GpuUtilizationSample>,
}

impl MetricsRecord {
    /// Mean utilization across all reported GPUs, used by the pool-manager
    /// metrics adapter.
    pub fn mean_utilization_pct(&self) -> Option<f64> {
        if self.gpu_utilization.is_empty() {
            return None;
        }
        let sum: f64 = self.gpu_utilization.iter().map(|s| s.utilization_pct).sum();
        Some(sum / self.gpu_utilization.len() as f64)
    }
}

/// Per-node bound on retained metrics records.
pub const MAX_METRICS_PER_NODE: usize = 100;

// ─── Instances ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    Provisioning,
    PendingRegistration,
    Running,
    Terminating,
    Terminated,
    Failed,
    #[default]
    Unknown,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "PROVISIONING",
            Self::PendingRegistration => "PENDING_REGISTRATION",
            Self::Running => "RUNNING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub provider: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub state: InstanceState,
    pub pool_name: String,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub node_id: Option<String>,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    if instance_id.trim().is_empty() {
        return Err(NavarchError::InvalidArgument(
            "instance_id must not be empty".into(),
        ));
    }
    Ok(())
}

// ─── Bootstrap logs ────────────────────────────────────────────────────────

/// Per-command stdout/stderr truncation budget.
pub const BOOTSTRAP_OUTPUT_TRUNCATE_BYTES: usize = 64 * 1024;

pub fn truncate_bootstrap_output(s: &str) -> String {
    if s.len() <= BOOTSTRAP_OUTPUT_TRUNCATE_BYTES {
        return s.to_string();
    }
    let mut end = BOOTSTRAP_OUTPUT_TRUNCATE_BYTES;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapCommandEntry {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapLogRecord {
    pub id: Uuid,
    pub node_id: String,
    pub instance_id: String,
    pub pool: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub ssh_wait_time_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub commands: Vec<BootstrapCommandEntry>,
}
