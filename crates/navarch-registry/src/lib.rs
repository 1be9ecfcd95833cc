//! RPC server core. Every public method here is a transport-agnostic
//! operation: the wire encoding is a collaborator's job (spec: "not
//! specified as an on-the-wire encoding — the encoding is delegated to
//! the RPC transport"). `NodeRegistry` only needs to be wrapped by
//! whatever transport the binary wires up.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use navarch_clock::Clock;
use navarch_instance::InstanceTracker;
use navarch_proto::error::{NavarchError, Result};
use navarch_proto::{
    CommandRecord, CommandStatus, CommandType, GpuDescriptor, GpuUtilizationSample,
    HealthCheckRecord, HealthCheckResult, HealthStatus, InstanceRecord, InstanceState,
    MetricsRecord, NodeConfigSnapshot, NodeRecord, NodeStatus,
};
use navarch_store::Store;
use tracing::{info, warn};
use uuid::Uuid;

#[async_trait]
pub trait HealthPolicyEvaluator: Send + Sync {
    async fn evaluate(&self, events: &[serde_json::Value]) -> PolicyResult;
}

#[derive(Debug, Clone)]
pub struct PolicyResult {
    pub status: HealthStatus,
    pub matched_rule: Option<String>,
}

/// Notified at-most-once per transition into Unhealthy. Runs detached
/// from the triggering RPC; must tolerate the request already having
/// completed.
#[async_trait]
pub trait HealthObserver: Send + Sync {
    async fn on_node_unhealthy(&self, node_id: &str);
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub health_check_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub enabled_health_checks: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_seconds: 30,
            heartbeat_interval_seconds: 30,
            enabled_health_checks: vec!["nvml".into()],
        }
    }
}

impl From<&ServerConfig> for NodeConfigSnapshot {
    fn from(config: &ServerConfig) -> Self {
        NodeConfigSnapshot {
            health_check_interval_seconds: config.health_check_interval_seconds,
            heartbeat_interval_seconds: config.heartbeat_interval_seconds,
            enabled_health_checks: config.enabled_health_checks.clone(),
        }
    }
}

// ─── Request/response types ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegisterNodeRequest {
    pub node_id: String,
    pub provider: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub gpus: Vec<GpuDescriptor>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RegisterNodeResponse {
    pub success: bool,
    pub message: String,
    pub config: NodeConfigSnapshot,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsPayload {
    pub gpu_utilization: Vec<GpuUtilizationSample>,
}

#[derive(Debug, Clone)]
pub struct SendHeartbeatRequest {
    pub node_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub metrics: Option<MetricsPayload>,
}

#[derive(Debug, Clone)]
pub struct SendHeartbeatResponse {
    pub acknowledged: bool,
}

#[derive(Debug, Clone)]
pub struct ReportHealthRequest {
    pub node_id: String,
    pub results: Vec<HealthCheckResult>,
    pub events: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone)]
pub struct ReportHealthResponse {
    pub acknowledged: bool,
    pub node_status: NodeStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ListNodesFilter {
    pub provider: Option<String>,
    pub region: Option<String>,
    pub status: Option<NodeStatus>,
}

#[derive(Debug, Clone)]
pub struct IssueCommandRequest {
    pub node_id: String,
    pub command_type: CommandType,
    pub parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct IssueCommandResponse {
    pub command_id: Uuid,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ListInstancesFilter {
    pub provider: Option<String>,
    pub region: Option<String>,
    pub state: Option<InstanceState>,
    pub pool_name: Option<String>,
}

// ─── NodeRegistry ─────────────────────────────────────────────────────────────

pub struct NodeRegistry {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    config: ServerConfig,
    instance_tracker: Option<Arc<InstanceTracker>>,
    policy_evaluator: Option<Arc<dyn HealthPolicyEvaluator>>,
    observer: Option<Arc<dyn HealthObserver>>,
}

impl NodeRegistry {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, config: ServerConfig) -> Self {
        Self {
            store,
            clock,
            config,
            instance_tracker: None,
            policy_evaluator: None,
            observer: None,
        }
    }

    pub fn with_instance_tracker(mut self, tracker: Arc<InstanceTracker>) -> Self {
        self.instance_tracker = Some(tracker);
        self
    }

    pub fn with_policy_evaluator(mut self, evaluator: Arc<dyn HealthPolicyEvaluator>) -> Self {
        self.policy_evaluator = Some(evaluator);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn HealthObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn register_node(&self, request: RegisterNodeRequest) -> Result<RegisterNodeResponse> {
        navarch_proto::validate_node_id(&request.node_id)?;

        let mut labels = request.metadata;
        let record = NodeRecord {
            node_id: request.node_id.clone(),
            provider: request.provider,
            region: request.region,
            zone: request.zone,
            instance_type: request.instance_type,
            gpus: request.gpus,
            labels: std::mem::take(&mut labels),
            status: NodeStatus::Active,
            health_status: HealthStatus::Unknown,
            last_heartbeat: None,
            last_health_check: None,
            registered_at: self.clock.now(),
            config: NodeConfigSnapshot::from(&self.config),
        };
        self.store.register_node(record);

        if let Some(tracker) = &self.instance_tracker {
            if let Err(err) = tracker.track_node_registered(&request.node_id, request.node_id.clone()) {
                warn!(node_id = %request.node_id, error = %err, "instance tracker registration failed");
            }
        }

        info!(node_id = %request.node_id, "node registered");
        Ok(RegisterNodeResponse {
            success: true,
            message: "registered".into(),
            config: NodeConfigSnapshot::from(&self.config),
        })
    }

    pub async fn send_heartbeat(&self, request: SendHeartbeatRequest) -> Result<SendHeartbeatResponse> {
        navarch_proto::validate_node_id(&request.node_id)?;
        self.store.get_node(&request.node_id)?;

        let timestamp = request.timestamp.unwrap_or_else(|| self.clock.now());
        self.store.update_node_heartbeat(&request.node_id, timestamp)?;

        if let Some(metrics) = request.metrics {
            let record = MetricsRecord {
                node_id: request.node_id.clone(),
                timestamp,
                gpu_utilization: metrics.gpu_utilization,
            };
            if let Err(err) = self.store.record_metrics(record) {
                warn!(node_id = %request.node_id, error = %err, "failed to record heartbeat metrics");
            }
        }

        Ok(SendHeartbeatResponse { acknowledged: true })
    }

    pub async fn report_health(&self, request: ReportHealthRequest) -> Result<ReportHealthResponse> {
        navarch_proto::validate_node_id(&request.node_id)?;
        let node = self.store.get_node(&request.node_id)?;
        let was_unhealthy = node.status == NodeStatus::Unhealthy;

        let mut results = request.results;
        if let (Some(events), Some(evaluator)) = (&request.events, &self.policy_evaluator) {
            let policy = evaluator.evaluate(events).await;
            results.push(HealthCheckResult {
                check_name: "cel_policy".into(),
                status: policy.status,
                message: policy.matched_rule.unwrap_or_default(),
            });
        }

        let timestamp = self.clock.now();
        self.store.record_health_check(HealthCheckRecord {
            node_id: request.node_id.clone(),
            timestamp,
            results,
        });

        let updated = self.store.get_node(&request.node_id)?;
        if !was_unhealthy && updated.status == NodeStatus::Unhealthy {
            if let Some(observer) = self.observer.clone() {
                let node_id = request.node_id.clone();
                tokio::spawn(async move {
                    observer.on_node_unhealthy(&node_id).await;
                });
            }
        }

        Ok(ReportHealthResponse {
            acknowledged: true,
            node_status: updated.status,
        })
    }

    /// Returns pending commands as they stood before acknowledgment, then
    /// transitions each to Acknowledged; a failed transition is logged
    /// and does not remove that command from the returned list.
    pub fn get_node_commands(&self, node_id: &str) -> Vec<CommandRecord> {
        let pending = self.store.get_pending_commands(node_id);
        for command in &pending {
            if let Err(err) = self.store.update_command_status(command.command_id, CommandStatus::Acknowledged) {
                warn!(command_id = %command.command_id, error = %err, "failed to acknowledge command");
            }
        }
        pending
    }

    pub fn list_nodes(&self, filter: ListNodesFilter) -> Vec<NodeRecord> {
        self.store
            .list_nodes()
            .into_iter()
            .filter(|n| filter.provider.as_ref().is_none_or(|p| &n.provider == p))
            .filter(|n| filter.region.as_ref().is_none_or(|r| &n.region == r))
            .filter(|n| filter.status.as_ref().is_none_or(|s| &n.status == s))
            .collect()
    }

    pub fn get_node(&self, node_id: &str) -> Result<NodeRecord> {
        self.store.get_node(node_id)
    }

    pub fn issue_command(&self, request: IssueCommandRequest) -> Result<IssueCommandResponse> {
        navarch_proto::validate_node_id(&request.node_id)?;
        self.store.get_node(&request.node_id)?;

        let command_id = Uuid::new_v4();
        let issued_at = self.clock.now();
        self.store.create_command(CommandRecord {
            command_id,
            node_id: request.node_id,
            command_type: request.command_type,
            parameters: request.parameters,
            issued_at,
            status: CommandStatus::Pending,
        });

        Ok(IssueCommandResponse { command_id, issued_at })
    }

    pub fn list_instances(&self, filter: ListInstancesFilter) -> Vec<InstanceRecord> {
        self.store
            .list_instances()
            .into_iter()
            .filter(|i| filter.provider.as_ref().is_none_or(|p| &i.provider == p))
            .filter(|i| filter.region.as_ref().is_none_or(|r| &i.region == r))
            .filter(|i| filter.state.as_ref().is_none_or(|s| &i.state == s))
            .filter(|i| filter.pool_name.as_ref().is_none_or(|p| &i.pool_name == p))
            .collect()
    }

    pub fn get_instance(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.store.get_instance(instance_id)
    }
}
