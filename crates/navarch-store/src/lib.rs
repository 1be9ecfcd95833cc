//! The reference `Store` implementation for the Navarch control plane.
//!
//! A mapping from entity identifier to record, per entity kind, kept
//! in-memory behind one readers/writer lock per kind. Every read returns
//! a deep, independent copy; callers can never mutate store state by
//! mutating a returned record.

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use navarch_clock::Clock;
use navarch_proto::error::{NavarchError, Result};
use navarch_proto::{
    BootstrapLogRecord, CommandRecord, CommandStatus, HealthCheckRecord, HealthStatus,
    InstanceRecord, InstanceState, MetricsRecord, NodeRecord, NodeStatus, MAX_METRICS_PER_NODE,
};
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

struct Tables {
    nodes: HashMap<String, NodeRecord>,
    health_checks: HashMap<String, Vec<HealthCheckRecord>>,
    commands: HashMap<Uuid, CommandRecord>,
    node_command_index: HashMap<String, Vec<Uuid>>,
    metrics: HashMap<String, VecDeque<MetricsRecord>>,
    instances: HashMap<String, InstanceRecord>,
    bootstrap_logs: HashMap<String, Vec<BootstrapLogRecord>>,
}

impl Tables {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            health_checks: HashMap::new(),
            commands: HashMap::new(),
            node_command_index: HashMap::new(),
            metrics: HashMap::new(),
            instances: HashMap::new(),
            bootstrap_logs: HashMap::new(),
        }
    }
}

/// Typed key/value repositories for nodes, health checks, commands,
/// metrics, instances, and bootstrap logs.
pub struct Store {
    clock: Arc<dyn Clock>,
    tables: RwLock<Tables>,
}

impl Store {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tables: RwLock::new(Tables::new()),
        }
    }

    // ─── Nodes ─────────────────────────────────────────────────────────────

    /// Re-registering an existing node_id is an upsert: preserves
    /// `registered_at`, `last_heartbeat`, and `last_health_check` from the
    /// prior record. Never fails for well-formed input.
    pub fn register_node(&self, mut record: NodeRecord) -> NodeRecord {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.nodes.get(&record.node_id) {
            record.registered_at = existing.registered_at;
            record.last_heartbeat = existing.last_heartbeat;
            record.last_health_check = existing.last_health_check;
        } else {
            record.registered_at = self.clock.now();
        }
        if record.status == NodeStatus::Unknown {
            record.status = NodeStatus::Active;
        }
        debug!(node_id = %record.node_id, "node registered");
        tables.nodes.insert(record.node_id.clone(), record.clone());
        record
    }

    pub fn get_node(&self, node_id: &str) -> Result<NodeRecord> {
        self.tables
            .read()
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| NavarchError::NotFound(format!("node {node_id}")))
    }

    pub fn update_node_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        let mut tables = self.tables.write();
        let node = tables
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| NavarchError::NotFound(format!("node {node_id}")))?;
        node.status = status;
        Ok(())
    }

    pub fn update_node_health_status(&self, node_id: &str, health_status: HealthStatus) -> Result<()> {
        let mut tables = self.tables.write();
        let node = tables
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| NavarchError::NotFound(format!("node {node_id}")))?;
        node.health_status = health_status;
        Ok(())
    }

    pub fn update_node_heartbeat(&self, node_id: &str, ts: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write();
        let node = tables
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| NavarchError::NotFound(format!("node {node_id}")))?;
        node.last_heartbeat = Some(ts);
        Ok(())
    }

    pub fn list_nodes(&self) -> Vec<NodeRecord> {
        self.tables.read().nodes.values().cloned().collect()
    }

    /// Idempotent; also deletes associated health checks and the per-node
    /// command index.
    pub fn delete_node(&self, node_id: &str) {
        let mut tables = self.tables.write();
        tables.nodes.remove(node_id);
        tables.health_checks.remove(node_id);
        if let Some(ids) = tables.node_command_index.remove(node_id) {
            for id in ids {
                tables.commands.remove(&id);
            }
        }
    }

    // ─── Health checks ─────────────────────────────────────────────────────

    /// Appends the record. If and only if the node exists, also updates
    /// `last_health_check` and applies the rollup rule. Appending is
    /// allowed even for unknown nodes; the rollup is skipped.
    pub fn record_health_check(&self, record: HealthCheckRecord) {
        let mut tables = self.tables.write();
        let rollup = record.rollup();
        let timestamp = record.timestamp;
        let node_id = record.node_id.clone();

        tables
            .health_checks
            .entry(node_id.clone())
            .or_default()
            .push(record);

        if let Some(node) = tables.nodes.get_mut(&node_id) {
            let was_unhealthy = node.status == NodeStatus::Unhealthy;
            node.health_status = rollup;
            node.last_health_check = Some(timestamp);

            if rollup == HealthStatus::Unhealthy {
                node.status = NodeStatus::Unhealthy;
            } else if was_unhealthy && rollup == HealthStatus::Healthy {
                node.status = NodeStatus::Active;
            }
            // Degraded alone never recovers an Unhealthy node, and never
            // overrides Cordoned/Draining — node.status left unchanged.
        }
    }

    pub fn get_latest_health_check(&self, node_id: &str) -> Result<HealthCheckRecord> {
        self.tables
            .read()
            .health_checks
            .get(node_id)
            .and_then(|records| records.last().cloned())
            .ok_or_else(|| NavarchError::NotFound(format!("health check for node {node_id}")))
    }

    // ─── Commands ──────────────────────────────────────────────────────────

    pub fn create_command(&self, record: CommandRecord) -> CommandRecord {
        let mut tables = self.tables.write();
        tables
            .node_command_index
            .entry(record.node_id.clone())
            .or_default()
            .push(record.command_id);
        tables.commands.insert(record.command_id, record.clone());
        record
    }

    pub fn get_pending_commands(&self, node_id: &str) -> Vec<CommandRecord> {
        let tables = self.tables.read();
        tables
            .node_command_index
            .get(node_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.commands.get(id))
            .filter(|c| c.status == CommandStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn update_command_status(&self, command_id: Uuid, status: CommandStatus) -> Result<()> {
        let mut tables = self.tables.write();
        let command = tables
            .commands
            .get_mut(&command_id)
            .ok_or_else(|| NavarchError::NotFound(format!("command {command_id}")))?;
        command.status = status;
        Ok(())
    }

    // ─── Metrics ───────────────────────────────────────────────────────────

    /// NotFound if the node is absent; append, then retain only the last
    /// `MAX_METRICS_PER_NODE` in arrival order.
    pub fn record_metrics(&self, record: MetricsRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.nodes.contains_key(&record.node_id) {
            return Err(NavarchError::NotFound(format!("node {}", record.node_id)));
        }
        let series = tables.metrics.entry(record.node_id.clone()).or_default();
        series.push_back(record);
        while series.len() > MAX_METRICS_PER_NODE {
            series.pop_front();
        }
        Ok(())
    }

    pub fn get_recent_metrics(&self, node_id: &str, duration: ChronoDuration) -> Result<Vec<MetricsRecord>> {
        let tables = self.tables.read();
        if !tables.nodes.contains_key(node_id) {
            return Err(NavarchError::NotFound(format!("node {node_id}")));
        }
        let cutoff = self.clock.now() - duration;
        Ok(tables
            .metrics
            .get(node_id)
            .into_iter()
            .flatten()
            .filter(|m| m.timestamp > cutoff)
            .cloned()
            .collect())
    }

    // ─── Instances ─────────────────────────────────────────────────────────

    pub fn create_instance(&self, record: InstanceRecord) -> Result<()> {
        navarch_proto::validate_instance_id(&record.instance_id)?;
        let mut tables = self.tables.write();
        if tables.instances.contains_key(&record.instance_id) {
            return Err(NavarchError::AlreadyExists(format!(
                "instance {}",
                record.instance_id
            )));
        }
        tables.instances.insert(record.instance_id.clone(), record);
        Ok(())
    }

    /// If transitioning into Running and `ready_at` is unset, stamps it;
    /// into Terminated and `terminated_at` is unset, stamps it.
    pub fn update_instance_state(&self, instance_id: &str, state: InstanceState, message: String) -> Result<()> {
        let now = self.clock.now();
        let mut tables = self.tables.write();
        let instance = tables
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| NavarchError::NotFound(format!("instance {instance_id}")))?;
        instance.state = state;
        instance.status_message = message;
        if state == InstanceState::Running && instance.ready_at.is_none() {
            instance.ready_at = Some(now);
        }
        if state == InstanceState::Terminated && instance.terminated_at.is_none() {
            instance.terminated_at = Some(now);
        }
        Ok(())
    }

    pub fn update_instance_node_id(&self, instance_id: &str, node_id: String) -> Result<()> {
        let mut tables = self.tables.write();
        let instance = tables
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| NavarchError::NotFound(format!("instance {instance_id}")))?;
        instance.node_id = Some(node_id);
        Ok(())
    }

    pub fn list_instances(&self) -> Vec<InstanceRecord> {
        self.tables.read().instances.values().cloned().collect()
    }

    pub fn list_instances_by_state(&self, state: InstanceState) -> Vec<InstanceRecord> {
        self.tables
            .read()
            .instances
            .values()
            .filter(|i| i.state == state)
            .cloned()
            .collect()
    }

    pub fn list_instances_by_pool(&self, pool: &str) -> Vec<InstanceRecord> {
        self.tables
            .read()
            .instances
            .values()
            .filter(|i| i.pool_name == pool)
            .cloned()
            .collect()
    }

    pub fn delete_instance(&self, instance_id: &str) {
        self.tables.write().instances.remove(instance_id);
    }

    pub fn get_instance(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.tables
            .read()
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| NavarchError::NotFound(format!("instance {instance_id}")))
    }

    // ─── Bootstrap logs ────────────────────────────────────────────────────

    pub fn record_bootstrap_log(&self, record: BootstrapLogRecord) {
        let mut tables = self.tables.write();
        tables
            .bootstrap_logs
            .entry(record.node_id.clone())
            .or_default()
            .push(record);
    }

    pub fn get_bootstrap_logs(&self, node_id: &str) -> Vec<BootstrapLogRecord> {
        self.tables
            .read()
            .bootstrap_logs
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn list_bootstrap_logs_by_pool(&self, pool: &str, limit: usize) -> Vec<BootstrapLogRecord> {
        let tables = self.tables.read();
        let mut matching: Vec<BootstrapLogRecord> = tables
            .bootstrap_logs
            .values()
            .flatten()
            .filter(|log| log.pool == pool)
            .cloned()
            .collect();
        matching.sort_by_key(|log| std::cmp::Reverse(log.started_at));
        matching.truncate(limit);
        matching
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navarch_clock::FakeClock;
    use navarch_proto::{HealthCheckResult, NodeConfigSnapshot};
    use std::time::Duration as StdDuration;

    fn config() -> NodeConfigSnapshot {
        NodeConfigSnapshot {
            health_check_interval_seconds: 30,
            heartbeat_interval_seconds: 30,
            enabled_health_checks: vec!["nvml".into()],
        }
    }

    fn fresh_node(id: &str) -> NodeRecord {
        NodeRecord {
            node_id: id.to_string(),
            provider: "gcp".into(),
            region: "us-central1".into(),
            zone: "us-central1-a".into(),
            instance_type: "a3-highgpu-8g".into(),
            gpus: vec![],
            labels: HashMap::new(),
            status: NodeStatus::Unknown,
            health_status: HealthStatus::Unknown,
            last_heartbeat: None,
            last_health_check: None,
            registered_at: Utc::now(),
            config: config(),
        }
    }

    fn store() -> (Store, FakeClock) {
        let clock = FakeClock::new(Utc::now());
        (Store::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn register_node_unknown_status_becomes_active() {
        let (store, _clock) = store();
        let record = store.register_node(fresh_node("node-1"));
        assert_eq!(record.status, NodeStatus::Active);
    }

    #[test]
    fn register_node_preserves_registered_at_on_reregistration() {
        let (store, clock) = store();
        let first = store.register_node(fresh_node("node-1"));
        clock.advance(StdDuration::from_secs(60));
        let second = store.register_node(fresh_node("node-1"));
        assert_eq!(first.registered_at, second.registered_at);
    }

    #[test]
    fn register_node_preserves_heartbeat_and_health_check_on_reregistration() {
        let (store, clock) = store();
        store.register_node(fresh_node("node-1"));
        let ts = clock.now();
        store.update_node_heartbeat("node-1", ts).unwrap();
        store
            .record_health_check(HealthCheckRecord {
                node_id: "node-1".into(),
                timestamp: ts,
                results: vec![HealthCheckResult {
                    check_name: "nvml".into(),
                    status: HealthStatus::Healthy,
                    message: String::new(),
                }],
            });

        let reregistered = store.register_node(fresh_node("node-1"));
        assert_eq!(reregistered.last_heartbeat, Some(ts));
        assert_eq!(reregistered.last_health_check, Some(ts));
    }

    #[test]
    fn get_node_not_found_for_absent_node() {
        let (store, _clock) = store();
        assert!(matches!(store.get_node("ghost"), Err(NavarchError::NotFound(_))));
    }

    #[test]
    fn record_health_check_unhealthy_sets_node_status_unhealthy() {
        let (store, clock) = store();
        store.register_node(fresh_node("node-1"));
        store.record_health_check(HealthCheckRecord {
            node_id: "node-1".into(),
            timestamp: clock.now(),
            results: vec![HealthCheckResult {
                check_name: "nvml".into(),
                status: HealthStatus::Unhealthy,
                message: "xid error".into(),
            }],
        });
        let node = store.get_node("node-1").unwrap();
        assert_eq!(node.status, NodeStatus::Unhealthy);
        assert_eq!(node.health_status, HealthStatus::Unhealthy);
    }

    #[test]
    fn degraded_report_does_not_recover_unhealthy_node() {
        let (store, clock) = store();
        store.register_node(fresh_node("node-1"));
        store.record_health_check(HealthCheckRecord {
            node_id: "node-1".into(),
            timestamp: clock.now(),
            results: vec![HealthCheckResult { check_name: "nvml".into(), status: HealthStatus::Unhealthy, message: String::new() }],
        });
        store.record_health_check(HealthCheckRecord {
            node_id: "node-1".into(),
            timestamp: clock.now(),
            results: vec![HealthCheckResult { check_name: "nvml".into(), status: HealthStatus::Degraded, message: String::new() }],
        });
        let node = store.get_node("node-1").unwrap();
        assert_eq!(node.status, NodeStatus::Unhealthy);
        assert_eq!(node.health_status, HealthStatus::Degraded);

        store.record_health_check(HealthCheckRecord {
            node_id: "node-1".into(),
            timestamp: clock.now(),
            results: vec![HealthCheckResult { check_name: "nvml".into(), status: HealthStatus::Healthy, message: String::new() }],
        });
        let node = store.get_node("node-1").unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.health_status, HealthStatus::Healthy);
    }

    #[test]
    fn record_health_check_for_unknown_node_is_retained_but_skips_rollup() {
        let (store, clock) = store();
        store.record_health_check(HealthCheckRecord {
            node_id: "ghost".into(),
            timestamp: clock.now(),
            results: vec![],
        });
        assert!(store.get_latest_health_check("ghost").is_ok());
        assert!(matches!(store.get_node("ghost"), Err(NavarchError::NotFound(_))));
    }

    #[test]
    fn cordoned_status_persists_through_healthy_report() {
        let (store, clock) = store();
        store.register_node(fresh_node("node-1"));
        store.update_node_status("node-1", NodeStatus::Cordoned).unwrap();
        store.record_health_check(HealthCheckRecord {
            node_id: "node-1".into(),
            timestamp: clock.now(),
            results: vec![HealthCheckResult { check_name: "nvml".into(), status: HealthStatus::Healthy, message: String::new() }],
        });
        assert_eq!(store.get_node("node-1").unwrap().status, NodeStatus::Cordoned);
    }

    #[test]
    fn record_metrics_retains_only_last_100() {
        let (store, clock) = store();
        store.register_node(fresh_node("node-1"));
        for _ in 0..150 {
            store
                .record_metrics(MetricsRecord {
                    node_id: "node-1".into(),
                    timestamp: clock.now(),
                    gpu_utilization: vec![],
                })
                .unwrap();
        }
        let recent = store.get_recent_metrics("node-1", ChronoDuration::hours(1)).unwrap();
        assert_eq!(recent.len(), MAX_METRICS_PER_NODE);
    }

    #[test]
    fn record_metrics_not_found_for_absent_node() {
        let (store, clock) = store();
        let result = store.record_metrics(MetricsRecord {
            node_id: "ghost".into(),
            timestamp: clock.now(),
            gpu_utilization: vec![],
        });
        assert!(matches!(result, Err(NavarchError::NotFound(_))));
    }

    #[test]
    fn create_instance_rejects_duplicate_id() {
        let (store, clock) = store();
        let instance = InstanceRecord {
            instance_id: "i-1".into(),
            provider: "gcp".into(),
            region: "us-central1".into(),
            zone: "us-central1-a".into(),
            instance_type: "a3-highgpu-8g".into(),
            state: InstanceState::Provisioning,
            pool_name: "pool-a".into(),
            created_at: clock.now(),
            ready_at: None,
            terminated_at: None,
            node_id: None,
            status_message: String::new(),
            labels: HashMap::new(),
        };
        store.create_instance(instance.clone()).unwrap();
        assert!(matches!(
            store.create_instance(instance),
            Err(NavarchError::AlreadyExists(_))
        ));
    }

    #[test]
    fn update_instance_state_stamps_ready_at_once() {
        let (store, clock) = store();
        store
            .create_instance(InstanceRecord {
                instance_id: "i-1".into(),
                provider: "gcp".into(),
                region: "us-central1".into(),
                zone: "us-central1-a".into(),
                instance_type: "a3-highgpu-8g".into(),
                state: InstanceState::Provisioning,
                pool_name: "pool-a".into(),
                created_at: clock.now(),
                ready_at: None,
                terminated_at: None,
                node_id: None,
                status_message: String::new(),
                labels: HashMap::new(),
            })
            .unwrap();

        store
            .update_instance_state("i-1", InstanceState::Running, "up".into())
            .unwrap();
        let first_ready_at = store.get_instance("i-1").unwrap().ready_at.unwrap();

        clock.advance(StdDuration::from_secs(60));
        store
            .update_instance_state("i-1", InstanceState::Running, "still up".into())
            .unwrap();
        let second_ready_at = store.get_instance("i-1").unwrap().ready_at.unwrap();

        assert_eq!(first_ready_at, second_ready_at);
    }

    #[test]
    fn get_pending_commands_excludes_acknowledged() {
        let (store, clock) = store();
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        store.create_command(CommandRecord {
            command_id: id_a,
            node_id: "node-1".into(),
            command_type: navarch_proto::CommandType::Cordon,
            parameters: HashMap::new(),
            issued_at: clock.now(),
            status: CommandStatus::Pending,
        });
        store.create_command(CommandRecord {
            command_id: id_b,
            node_id: "node-1".into(),
            command_type: navarch_proto::CommandType::Drain,
            parameters: HashMap::new(),
            issued_at: clock.now(),
            status: CommandStatus::Pending,
        });
        store.update_command_status(id_a, CommandStatus::Acknowledged).unwrap();

        let pending = store.get_pending_commands("node-1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command_id, id_b);
    }

    #[test]
    fn delete_node_is_idempotent_and_cleans_up_commands() {
        let (store, clock) = store();
        store.register_node(fresh_node("node-1"));
        store.create_command(CommandRecord {
            command_id: Uuid::new_v4(),
            node_id: "node-1".into(),
            command_type: navarch_proto::CommandType::Cordon,
            parameters: HashMap::new(),
            issued_at: clock.now(),
            status: CommandStatus::Pending,
        });
        store.delete_node("node-1");
        store.delete_node("node-1"); // idempotent
        assert!(store.get_node("node-1").is_err());
        assert!(store.get_pending_commands("node-1").is_empty());
    }
}
