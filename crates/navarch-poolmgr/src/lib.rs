//! Drives each pool's autoscaling recommendation on a fixed interval and
//! reacts to unhealthy-node notifications by replacing nodes once a
//! pool's `unhealthy_threshold` is reached.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use navarch_autoscale::{Autoscaler, PoolState};
use navarch_clock::Clock;
use navarch_heartbeat::HeartbeatObserver;
use navarch_instance::InstanceTracker;
use navarch_pool::{Pool, PoolConfig};
use navarch_proto::InstanceRecord;
use navarch_provider::ProviderCandidate;
use navarch_registry::HealthObserver;
use navarch_store::Store;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PoolManagerError {
    #[error("pool already exists: {0}")]
    AlreadyExists(String),
    #[error("pool not found: {0}")]
    NotFound(String),
    #[error("pool error: {0}")]
    Pool(#[from] navarch_pool::PoolError),
}

pub type Result<T> = std::result::Result<T, PoolManagerError>;

#[async_trait]
pub trait PoolMetricsSource: Send + Sync {
    async fn snapshot(&self, pool_name: &str) -> PoolMetricsSnapshot;
}

#[derive(Debug, Clone, Default)]
pub struct PoolMetricsSnapshot {
    pub utilization: f64,
    pub pending_jobs: u32,
    pub queue_depth: u32,
}

#[derive(Debug, Clone)]
pub struct PoolManagerConfig {
    pub evaluation_interval: StdDuration,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self { evaluation_interval: StdDuration::from_secs(30) }
    }
}

const UTILIZATION_HISTORY_LEN: usize = 20;

struct ManagedPoolEntry {
    pool: Arc<Pool>,
    autoscaler: Arc<dyn Autoscaler>,
    min_nodes: u32,
    max_nodes: u32,
    cooldown: StdDuration,
    last_scale_time: DateTime<Utc>,
    utilization_history: Vec<f64>,
}

struct LoopHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

pub struct PoolManager {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    config: PoolManagerConfig,
    instance_tracker: Option<Arc<InstanceTracker>>,
    metrics_source: Option<Arc<dyn PoolMetricsSource>>,
    pools: Mutex<HashMap<String, ManagedPoolEntry>>,
    loop_handle: Mutex<Option<LoopHandle>>,
}

impl PoolManager {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, config: PoolManagerConfig) -> Self {
        Self {
            store,
            clock,
            config,
            instance_tracker: None,
            metrics_source: None,
            pools: Mutex::new(HashMap::new()),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn with_instance_tracker(mut self, tracker: Arc<InstanceTracker>) -> Self {
        self.instance_tracker = Some(tracker);
        self
    }

    pub fn with_metrics_source(mut self, source: Arc<dyn PoolMetricsSource>) -> Self {
        self.metrics_source = Some(source);
        self
    }

    pub async fn add_pool(
        &self,
        config: PoolConfig,
        candidates: Vec<ProviderCandidate>,
        autoscaler: Arc<dyn Autoscaler>,
    ) -> Result<()> {
        let mut pools = self.pools.lock().await;
        if pools.contains_key(&config.name) {
            return Err(PoolManagerError::AlreadyExists(config.name));
        }
        let name = config.name.clone();
        let min_nodes = config.min_nodes;
        let max_nodes = config.max_nodes;
        let cooldown = config.cooldown_period;
        let pool = Pool::new(config, self.clock.clone(), candidates)?;
        pools.insert(
            name,
            ManagedPoolEntry {
                pool: Arc::new(pool),
                autoscaler,
                min_nodes,
                max_nodes,
                cooldown,
                last_scale_time: DateTime::<Utc>::MIN_UTC,
                utilization_history: Vec::new(),
            },
        );
        Ok(())
    }

    pub async fn remove_pool(&self, name: &str) -> Result<()> {
        let mut pools = self.pools.lock().await;
        pools.remove(name).ok_or_else(|| PoolManagerError::NotFound(name.to_string()))?;
        Ok(())
    }

    pub async fn pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.lock().await.get(name).map(|e| e.pool.clone())
    }

    async fn track_new_instance(&self, pool_name: &str, node: &navarch_provider::Node) {
        let Some(tracker) = &self.instance_tracker else { return };
        let record = InstanceRecord {
            instance_id: node.provider_instance_id.clone(),
            provider: node.provider_name.clone(),
            region: node.region.clone(),
            zone: node.zone.clone(),
            instance_type: node.instance_type.clone(),
            state: navarch_proto::InstanceState::Provisioning,
            pool_name: pool_name.to_string(),
            created_at: node.created_at,
            ready_at: None,
            terminated_at: None,
            node_id: None,
            status_message: String::new(),
            labels: HashMap::new(),
        };
        if let Err(err) = tracker.track_provisioning(record) {
            warn!(instance_id = %node.provider_instance_id, error = %err, "failed to register new instance with tracker");
            return;
        }
        if let Err(err) = tracker.track_provisioning_complete(&node.provider_instance_id) {
            warn!(instance_id = %node.provider_instance_id, error = %err, "failed to mark instance pending registration");
        }
    }

    async fn evaluate_pool(&self, name: &str, entry: &mut ManagedPoolEntry) {
        let status = entry.pool.status().await;
        let metrics = match &self.metrics_source {
            Some(source) => source.snapshot(name).await,
            None => PoolMetricsSnapshot::default(),
        };

        entry.utilization_history.push(metrics.utilization);
        if entry.utilization_history.len() > UTILIZATION_HISTORY_LEN {
            entry.utilization_history.remove(0);
        }

        let now = self.clock.now();
        let state = PoolState {
            name: name.to_string(),
            current_nodes: status.total,
            healthy_nodes: status.healthy,
            min: entry.min_nodes,
            max: entry.max_nodes,
            utilization: metrics.utilization,
            pending_jobs: metrics.pending_jobs,
            queue_depth: metrics.queue_depth,
            last_scale_time: entry.last_scale_time,
            cooldown: ChronoDuration::from_std(entry.cooldown).unwrap_or_else(|_| ChronoDuration::zero()),
            utilization_history: entry.utilization_history.clone(),
            time_of_day: now,
            day_of_week: {
                use chrono::Datelike;
                now.weekday()
            },
        };

        let recommendation = entry.autoscaler.recommend(&state);
        if recommendation.target_nodes == status.total {
            return;
        }

        if recommendation.target_nodes > status.total {
            let diff = recommendation.target_nodes - status.total;
            match entry.pool.scale_up(diff).await {
                Ok(nodes) => {
                    entry.last_scale_time = now;
                    for node in &nodes {
                        self.track_new_instance(name, node).await;
                    }
                    info!(pool = name, requested = diff, provisioned = nodes.len(), reason = %recommendation.reason, "scaled up");
                }
                Err(err) => warn!(pool = name, error = %err, "scale up failed"),
            }
        } else {
            let diff = status.total - recommendation.target_nodes;
            let before: Vec<String> = entry.pool.managed_nodes().await.into_iter().map(|n| n.node.provider_instance_id).collect();
            match entry.pool.scale_down(diff).await {
                Ok(()) => {
                    entry.last_scale_time = now;
                    let after: Vec<String> = entry.pool.managed_nodes().await.into_iter().map(|n| n.node.provider_instance_id).collect();
                    if let Some(tracker) = &self.instance_tracker {
                        for id in before.iter().filter(|id| !after.contains(id)) {
                            if let Err(err) = tracker.track_terminating(id) {
                                warn!(instance_id = %id, error = %err, "failed to mark instance terminating");
                            }
                            if let Err(err) = tracker.track_terminated(id) {
                                warn!(instance_id = %id, error = %err, "failed to mark instance terminated");
                            }
                        }
                    }
                    info!(pool = name, requested = diff, reason = %recommendation.reason, "scaled down");
                }
                Err(err) => warn!(pool = name, error = %err, "scale down failed"),
            }
        }
    }

    /// Evaluates every pool in turn, holding the pools table locked for
    /// the duration of each pool's evaluation. Pools are independent, so
    /// one pool's provider RPCs never block another's registration.
    pub async fn evaluate_once(&self) {
        let names: Vec<String> = self.pools.lock().await.keys().cloned().collect();
        for name in names {
            let mut pools = self.pools.lock().await;
            if let Some(entry) = pools.get_mut(&name) {
                self.evaluate_pool(&name, entry).await;
            }
        }
    }

    async fn handle_node_unhealthy(&self, node_id: &str) {
        let node = match self.store.get_node(node_id) {
            Ok(node) => node,
            Err(err) => {
                warn!(node_id, error = %err, "unhealthy notification for unregistered node");
                return;
            }
        };
        let Some(pool_name) = node.pool_name().map(str::to_string) else { return };

        let mut pools = self.pools.lock().await;
        let Some(entry) = pools.get_mut(&pool_name) else { return };
        if !entry.pool.auto_replace() {
            return;
        }

        let Some(instance) = self.store.list_instances_by_pool(&pool_name).into_iter().find(|i| i.node_id.as_deref() == Some(node_id)) else {
            warn!(node_id, pool = %pool_name, "no instance record for unhealthy node, cannot act");
            return;
        };

        let reached_threshold = match entry.pool.record_health_failure(&instance.instance_id).await {
            Ok(reached) => reached,
            Err(err) => {
                warn!(node_id, error = %err, "failed to record health failure on pool");
                return;
            }
        };
        if !reached_threshold {
            return;
        }

        info!(node_id, pool = %pool_name, "unhealthy threshold reached, replacing node");
        match entry.pool.replace_node(&instance.instance_id).await {
            Ok(new_node) => {
                if let Some(tracker) = &self.instance_tracker {
                    let _ = tracker.track_terminating(&instance.instance_id);
                    let _ = tracker.track_terminated(&instance.instance_id);
                }
                drop(pools);
                self.track_new_instance(&pool_name, &new_node).await;
            }
            Err(err) => warn!(node_id, error = %err, "replace_node failed"),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.loop_handle.lock().await;
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_task = stop.clone();
        let manager = Arc::clone(self);
        let mut ticker = self.clock.new_ticker(self.config.evaluation_interval);
        let join = tokio::spawn(async move {
            while !stop_for_task.load(Ordering::SeqCst) {
                match ticker.tick().await {
                    Some(_) => manager.evaluate_once().await,
                    None => break,
                }
            }
        });
        *guard = Some(LoopHandle { stop, join });
    }

    pub async fn stop(&self) {
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            handle.stop.store(true, Ordering::SeqCst);
            handle.join.abort();
            let _ = handle.join.await;
        }
    }
}

#[async_trait]
impl HealthObserver for PoolManager {
    async fn on_node_unhealthy(&self, node_id: &str) {
        self.handle_node_unhealthy(node_id).await;
    }
}

#[async_trait]
impl HeartbeatObserver for PoolManager {
    async fn on_node_unhealthy(&self, node_id: &str) {
        self.handle_node_unhealthy(node_id).await;
    }
}
