//! A scalable group of nodes over one or more providers.
//!
//! Provider RPCs (`Provision`/`Terminate`) are performed while the pool's
//! lock is held, by design: `ScaleUp`, `ScaleDown`, and `ReplaceNode` are
//! meant to serialize per pool so the node set and `last_scale_at`
//! invariants hold between any two observers. The lock is therefore an
//! async `tokio::sync::Mutex`, not a sync lock held across an `.await`.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use navarch_clock::Clock;
use navarch_provider::{FailoverSelector, Node, ProviderCandidate, ProvisionRequest, ZoneDistributor};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidArgument(String),
    #[error("pool is at capacity")]
    AtCapacity,
    #[error("pool is in cooldown")]
    Cooldown,
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("provider failure: {0}")]
    ProviderFailure(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStatus {
    None,
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub instance_type: String,
    pub region: String,
    pub zones: Vec<String>,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub cooldown_period: StdDuration,
    pub unhealthy_threshold: u32,
    pub auto_replace: bool,
    pub labels: HashMap<String, String>,
    pub setup_commands: Vec<String>,
    pub ssh_key_names: Vec<String>,
    pub control_plane_address: String,
}

impl PoolConfig {
    fn validate(&self, candidates: &[ProviderCandidate]) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PoolError::InvalidArgument("name must not be empty".into()));
        }
        if self.max_nodes == 0 {
            return Err(PoolError::InvalidArgument("max_nodes must be > 0".into()));
        }
        if self.max_nodes < self.min_nodes {
            return Err(PoolError::InvalidArgument("max_nodes must be >= min_nodes".into()));
        }
        if candidates.is_empty() {
            return Err(PoolError::InvalidArgument("provider candidate set must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ManagedNode {
    pub node: Node,
    pub pool_name: String,
    pub provider_name: String,
    pub provisioned_at: DateTime<Utc>,
    pub health_failures: u32,
    pub cordoned: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub bootstrap_status: BootstrapStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: u32,
    pub healthy: u32,
    pub unhealthy: u32,
    pub cordoned: u32,
    pub can_scale_up: bool,
    pub can_scale_down: bool,
    pub bootstrap_pending: u32,
    pub bootstrap_failed: u32,
}

struct PoolState {
    nodes: HashMap<String, ManagedNode>,
    last_scale_at: Option<DateTime<Utc>>,
}

pub struct Pool {
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    selector: FailoverSelector,
    zone_distributor: ZoneDistributor,
    providers_by_name: HashMap<String, Arc<dyn navarch_provider::Provider>>,
    state: Mutex<PoolState>,
}

impl Pool {
    pub fn new(
        config: PoolConfig,
        clock: Arc<dyn Clock>,
        candidates: Vec<ProviderCandidate>,
    ) -> Result<Self> {
        config.validate(&candidates)?;
        let providers_by_name = candidates
            .iter()
            .map(|c| (c.name.clone(), c.provider.clone()))
            .collect();
        Ok(Self {
            selector: FailoverSelector::new(candidates),
            zone_distributor: ZoneDistributor::new(),
            providers_by_name,
            config,
            clock,
            state: Mutex::new(PoolState {
                nodes: HashMap::new(),
                last_scale_at: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn auto_replace(&self) -> bool {
        self.config.auto_replace
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let total = state.nodes.len() as u32;
        let cordoned = state.nodes.values().filter(|n| n.cordoned).count() as u32;
        let unhealthy = state
            .nodes
            .values()
            .filter(|n| n.health_failures >= self.config.unhealthy_threshold)
            .count() as u32;
        let healthy = total - unhealthy;
        let bootstrap_pending = state
            .nodes
            .values()
            .filter(|n| n.bootstrap_status == BootstrapStatus::Pending)
            .count() as u32;
        let bootstrap_failed = state
            .nodes
            .values()
            .filter(|n| n.bootstrap_status == BootstrapStatus::Failed)
            .count() as u32;
        PoolStatus {
            total,
            healthy,
            unhealthy,
            cordoned,
            can_scale_up: total < self.config.max_nodes,
            can_scale_down: total > self.config.min_nodes,
            bootstrap_pending,
            bootstrap_failed,
        }
    }

    fn check_cooldown(&self, state: &PoolState, now: DateTime<Utc>) -> Result<()> {
        if let Some(last) = state.last_scale_at {
            let cooldown = chrono::Duration::from_std(self.config.cooldown_period)
                .unwrap_or_else(|_| chrono::Duration::zero());
            if now - last < cooldown {
                return Err(PoolError::Cooldown);
            }
        }
        Ok(())
    }

    fn build_request(&self, name: String, zone: String) -> ProvisionRequest {
        ProvisionRequest {
            name,
            instance_type: self.config.instance_type.clone(),
            region: self.config.region.clone(),
            zone,
            ssh_key_names: self.config.ssh_key_names.clone(),
            labels: self.config.labels.clone(),
            user_data: String::new(),
        }
    }

    /// Clamps `count` to remaining capacity; fails with `AtCapacity` if
    /// none remains, `Cooldown` if the pool scaled too recently. Returns
    /// the nodes actually provisioned, which may be fewer than requested
    /// if the candidate list is exhausted before every slot is filled —
    /// the error then carries the last underlying provider failure.
    pub async fn scale_up(&self, count: u32) -> Result<Vec<Node>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        self.check_cooldown(&state, now)?;

        let available = self.config.max_nodes.saturating_sub(state.nodes.len() as u32);
        if available == 0 {
            return Err(PoolError::AtCapacity);
        }
        let target = count.min(available);
        if target == 0 {
            return Err(PoolError::AtCapacity);
        }

        let mut provisioned = Vec::new();
        let mut last_error: Option<String> = None;

        for slot in 0..target {
            loop {
                let candidate = match self.selector.select(now).await {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        last_error = Some(err.to_string());
                        break;
                    }
                };
                let zone = self
                    .zone_distributor
                    .next_zone(&self.config.zones)
                    .unwrap_or_else(|| self.config.region.clone());
                let name = format!("{}-{}", self.config.name, uuid::Uuid::new_v4());
                let request = self.build_request(name, zone.clone());

                match candidate.provider.provision(&request).await {
                    Ok(node) => {
                        self.selector.record_success(&candidate.name);
                        self.zone_distributor.record_provision(&zone);
                        state.nodes.insert(
                            node.provider_instance_id.clone(),
                            ManagedNode {
                                node: node.clone(),
                                pool_name: self.config.name.clone(),
                                provider_name: candidate.name.clone(),
                                provisioned_at: now,
                                health_failures: 0,
                                cordoned: false,
                                last_health_check: None,
                                bootstrap_status: if self.config.setup_commands.is_empty() {
                                    BootstrapStatus::None
                                } else {
                                    BootstrapStatus::Pending
                                },
                            },
                        );
                        provisioned.push(node);
                        break;
                    }
                    Err(err) => {
                        warn!(provider = %candidate.name, slot, error = %err, "provision attempt failed");
                        self.selector.record_failure(&candidate.name, now);
                        last_error = Some(err.to_string());
                        continue;
                    }
                }
            }
            if provisioned.len() as u32 <= slot && last_error.is_some() {
                // Candidate list exhausted for this slot; stop filling further slots.
                break;
            }
        }

        if !provisioned.is_empty() {
            state.last_scale_at = Some(now);
        }

        if provisioned.len() as u32 == target {
            Ok(provisioned)
        } else if provisioned.is_empty() {
            Err(PoolError::ProviderFailure(
                last_error.unwrap_or_else(|| "no candidates available".into()),
            ))
        } else {
            info!(
                pool = %self.config.name,
                requested = target,
                provisioned = provisioned.len(),
                "scale up returned fewer nodes than requested"
            );
            Ok(provisioned)
        }
    }

    pub async fn scale_down(&self, count: u32) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        self.check_cooldown(&state, now)?;

        let removable = (state.nodes.len() as u32).saturating_sub(self.config.min_nodes);
        let target = count.min(removable);
        if target == 0 {
            return Err(PoolError::AtCapacity);
        }

        let mut victims: Vec<String> = state
            .nodes
            .values()
            .filter(|n| n.cordoned)
            .map(|n| n.node.provider_instance_id.clone())
            .collect();
        if victims.len() < target as usize {
            for id in state.nodes.keys() {
                if !victims.contains(id) {
                    victims.push(id.clone());
                }
                if victims.len() >= target as usize {
                    break;
                }
            }
        }
        victims.truncate(target as usize);

        let mut terminated = 0;
        for id in victims {
            let Some(managed) = state.nodes.get(&id) else { continue };
            let provider = self
                .providers_by_name
                .get(&managed.provider_name)
                .ok_or_else(|| PoolError::ProviderFailure(format!("unknown provider {}", managed.provider_name)))?
                .clone();
            match provider.terminate(&id).await {
                Ok(()) => {
                    self.zone_distributor.record_termination(&managed.node.zone);
                    state.nodes.remove(&id);
                    terminated += 1;
                }
                Err(err) => {
                    warn!(node_id = %id, error = %err, "terminate failed during scale down");
                }
            }
        }

        if terminated > 0 {
            state.last_scale_at = Some(now);
        }
        Ok(())
    }

    /// Removes `node_id`, terminates it via its provider, then provisions
    /// a replacement through the selector. Held under the pool lock so
    /// the node set transitions atomically from the caller's perspective.
    pub async fn replace_node(&self, node_id: &str) -> Result<Node> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let managed = state
            .nodes
            .remove(node_id)
            .ok_or_else(|| PoolError::NotFound(node_id.to_string()))?;

        if let Some(provider) = self.providers_by_name.get(&managed.provider_name) {
            if let Err(err) = provider.terminate(node_id).await {
                warn!(node_id, error = %err, "terminate failed during replace_node, continuing");
            }
        }
        self.zone_distributor.record_termination(&managed.node.zone);

        let candidate = self
            .selector
            .select(now)
            .await
            .map_err(|err| PoolError::ProviderFailure(err.to_string()))?;
        let zone = self
            .zone_distributor
            .next_zone(&self.config.zones)
            .unwrap_or_else(|| self.config.region.clone());
        let name = format!("{}-{}", self.config.name, uuid::Uuid::new_v4());
        let request = self.build_request(name, zone.clone());

        let node = candidate
            .provider
            .provision(&request)
            .await
            .map_err(|err| PoolError::ProviderFailure(err.to_string()))?;
        self.selector.record_success(&candidate.name);
        self.zone_distributor.record_provision(&zone);

        state.nodes.insert(
            node.provider_instance_id.clone(),
            ManagedNode {
                node: node.clone(),
                pool_name: self.config.name.clone(),
                provider_name: candidate.name.clone(),
                provisioned_at: now,
                health_failures: 0,
                cordoned: false,
                last_health_check: None,
                bootstrap_status: BootstrapStatus::None,
            },
        );
        Ok(node)
    }

    pub async fn cordon(&self, node_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PoolError::NotFound(node_id.to_string()))?;
        node.cordoned = true;
        Ok(())
    }

    pub async fn uncordon(&self, node_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PoolError::NotFound(node_id.to_string()))?;
        node.cordoned = false;
        Ok(())
    }

    /// Increments the node's consecutive-failure count. Returns `true`
    /// iff `auto_replace` is enabled and the count has just reached
    /// `unhealthy_threshold`.
    pub async fn record_health_failure(&self, node_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PoolError::NotFound(node_id.to_string()))?;
        node.health_failures += 1;
        node.last_health_check = Some(self.clock.now());
        Ok(self.config.auto_replace && node.health_failures >= self.config.unhealthy_threshold)
    }

    pub async fn record_health_success(&self, node_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PoolError::NotFound(node_id.to_string()))?;
        node.health_failures = 0;
        node.last_health_check = Some(self.clock.now());
        Ok(())
    }

    pub async fn managed_nodes(&self) -> Vec<ManagedNode> {
        self.state.lock().await.nodes.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navarch_clock::FakeClock;
    use navarch_provider::StaticProvider;

    fn candidate(name: &str, priority: u32) -> ProviderCandidate {
        ProviderCandidate {
            provider: Arc::new(StaticProvider::new(name)),
            name: name.to_string(),
            priority,
            weight: 1,
            regions: vec!["us-central1".into()],
            zones: vec!["us-central1-a".into()],
            instance_type: "a3-highgpu-8g".into(),
        }
    }

    fn config(min: u32, max: u32, cooldown: StdDuration) -> PoolConfig {
        PoolConfig {
            name: "pool-a".into(),
            instance_type: "a3-highgpu-8g".into(),
            region: "us-central1".into(),
            zones: vec!["us-central1-a".into()],
            min_nodes: min,
            max_nodes: max,
            cooldown_period: cooldown,
            unhealthy_threshold: 3,
            auto_replace: true,
            labels: HashMap::new(),
            setup_commands: vec![],
            ssh_key_names: vec![],
            control_plane_address: "127.0.0.1:7000".into(),
        }
    }

    #[test]
    fn construction_rejects_empty_name() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let mut cfg = config(0, 5, StdDuration::from_secs(0));
        cfg.name = String::new();
        assert!(Pool::new(cfg, clock, vec![candidate("p", 1)]).is_err());
    }

    #[test]
    fn construction_rejects_max_less_than_min() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let cfg = config(5, 1, StdDuration::from_secs(0));
        assert!(Pool::new(cfg, clock, vec![candidate("p", 1)]).is_err());
    }

    #[test]
    fn construction_rejects_empty_candidates() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let cfg = config(0, 5, StdDuration::from_secs(0));
        assert!(Pool::new(cfg, clock, vec![]).is_err());
    }

    #[tokio::test]
    async fn scale_up_provisions_requested_count() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let cfg = config(0, 5, StdDuration::from_secs(0));
        let pool = Pool::new(cfg, clock, vec![candidate("primary", 1)]).unwrap();
        let nodes = pool.scale_up(2).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(pool.status().await.total, 2);
    }

    #[tokio::test]
    async fn scale_up_clamps_to_capacity() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let cfg = config(0, 2, StdDuration::from_secs(0));
        let pool = Pool::new(cfg, clock, vec![candidate("primary", 1)]).unwrap();
        let nodes = pool.scale_up(10).await.unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[tokio::test]
    async fn scale_up_fails_at_capacity_when_full() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let cfg = config(0, 1, StdDuration::from_secs(0));
        let pool = Pool::new(cfg, clock, vec![candidate("primary", 1)]).unwrap();
        pool.scale_up(1).await.unwrap();
        assert!(matches!(pool.scale_up(1).await, Err(PoolError::AtCapacity)));
    }

    #[tokio::test]
    async fn scale_up_respects_cooldown() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let cfg = config(0, 5, StdDuration::from_secs(300));
        let pool = Pool::new(cfg, clock.clone(), vec![candidate("primary", 1)]).unwrap();
        pool.scale_up(1).await.unwrap();
        clock.advance(StdDuration::from_secs(60));
        assert!(matches!(pool.scale_up(1).await, Err(PoolError::Cooldown)));
    }

    #[tokio::test]
    async fn scale_up_fails_over_to_secondary_provider() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let cfg = config(0, 5, StdDuration::from_secs(0));
        let primary = StaticProvider::new("primary");
        primary.set_fails(true);
        let candidates = vec![
            ProviderCandidate { provider: Arc::new(primary), ..candidate("primary", 1) },
            candidate("secondary", 2),
        ];
        let pool = Pool::new(cfg, clock, candidates).unwrap();
        let nodes = pool.scale_up(1).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].provider_name, "secondary");
    }

    #[tokio::test]
    async fn cordon_then_uncordon_is_a_roundtrip() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let cfg = config(0, 5, StdDuration::from_secs(0));
        let pool = Pool::new(cfg, clock, vec![candidate("primary", 1)]).unwrap();
        let nodes = pool.scale_up(1).await.unwrap();
        let id = &nodes[0].provider_instance_id;
        pool.cordon(id).await.unwrap();
        assert_eq!(pool.status().await.cordoned, 1);
        pool.uncordon(id).await.unwrap();
        assert_eq!(pool.status().await.cordoned, 0);
    }

    #[tokio::test]
    async fn record_health_failure_triggers_replacement_at_threshold() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let mut cfg = config(0, 5, StdDuration::from_secs(0));
        cfg.unhealthy_threshold = 2;
        let pool = Pool::new(cfg, clock, vec![candidate("primary", 1)]).unwrap();
        let nodes = pool.scale_up(1).await.unwrap();
        let id = &nodes[0].provider_instance_id;
        assert!(!pool.record_health_failure(id).await.unwrap());
        assert!(pool.record_health_failure(id).await.unwrap());
    }

    #[tokio::test]
    async fn record_health_success_resets_failure_count() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let mut cfg = config(0, 5, StdDuration::from_secs(0));
        cfg.unhealthy_threshold = 2;
        let pool = Pool::new(cfg, clock, vec![candidate("primary", 1)]).unwrap();
        let nodes = pool.scale_up(1).await.unwrap();
        let id = &nodes[0].provider_instance_id;
        pool.record_health_failure(id).await.unwrap();
        pool.record_health_success(id).await.unwrap();
        assert!(!pool.record_health_failure(id).await.unwrap());
    }
}
