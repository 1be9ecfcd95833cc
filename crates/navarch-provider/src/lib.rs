//! Provider selection: strategy-based candidate choice, failure-driven
//! exclusion, and per-zone load spreading.
//!
//! The concrete cloud-provider drivers (Hetzner, Vultr, ...) are external
//! collaborators (spec: "Interfaces consumed from external collaborators")
//! and live outside this crate; `Provider` here is the trait boundary they
//! must satisfy, plus a `StaticProvider` test double used by this crate's
//! own tests and by `navarch-tests`.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use navarch_failure::{FailureTracker, FailureTrackerConfig};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

pub mod error {
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum SelectError {
        #[error("no candidates configured")]
        NoCandidates,
        #[error("all candidates attempted or excluded: {0}")]
        Exhausted(String),
    }

    pub type Result<T> = std::result::Result<T, SelectError>;
}

// ─── Provider trait ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub name: String,
    pub instance_type: String,
    pub region: String,
    pub zone: String,
    pub ssh_key_names: Vec<String>,
    pub labels: HashMap<String, String>,
    pub user_data: String,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub provider_instance_id: String,
    pub provider_name: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InstanceTypeInfo {
    pub name: String,
    pub available: bool,
    pub price_per_hr: Option<f64>,
}

/// All provider drivers satisfy this trait. `list_instance_types` is an
/// optional capability: the default returns `None`, meaning "unsupported",
/// which the availability and cost strategies treat permissively.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    async fn provision(&self, req: &ProvisionRequest) -> Result<Node>;
    async fn terminate(&self, provider_instance_id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<Node>>;

    async fn list_instance_types(&self) -> Result<Option<Vec<InstanceTypeInfo>>> {
        Ok(None)
    }
}

/// A candidate the selector may choose among.
#[derive(Clone)]
pub struct ProviderCandidate {
    pub provider: Arc<dyn Provider>,
    pub name: String,
    pub priority: u32,
    pub weight: u32,
    pub regions: Vec<String>,
    pub zones: Vec<String>,
    pub instance_type: String,
}

impl std::fmt::Debug for ProviderCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCandidate")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .finish()
    }
}

// ─── Strategy ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Priority,
    RoundRobin,
    Availability,
    Cost,
}

/// Strategy-based candidate choice. A round is a sequence of `select`
/// calls bracketed by a terminal `record_success` or exhaustion; within a
/// round, candidates already attempted are skipped.
pub struct ProviderSelector {
    strategy: Strategy,
    candidates: Vec<ProviderCandidate>,
    attempted: RwLock<HashSet<String>>,
    round_robin_counter: AtomicUsize,
}

impl ProviderSelector {
    pub fn new(strategy: Strategy, candidates: Vec<ProviderCandidate>) -> Self {
        Self {
            strategy,
            candidates,
            attempted: RwLock::new(HashSet::new()),
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    /// Choose the next candidate per the configured strategy, skipping
    /// names already marked attempted this round.
    pub async fn select(&self) -> error::Result<ProviderCandidate> {
        if self.candidates.is_empty() {
            return Err(error::SelectError::NoCandidates);
        }
        match self.strategy {
            Strategy::Priority => self.select_priority(),
            Strategy::RoundRobin => self.select_round_robin(),
            Strategy::Availability => self.select_availability().await,
            Strategy::Cost => self.select_cost().await,
        }
    }

    fn select_priority(&self) -> error::Result<ProviderCandidate> {
        let attempted = self.attempted.read();
        let mut sorted: Vec<&ProviderCandidate> = self.candidates.iter().collect();
        sorted.sort_by_key(|c| c.priority);
        sorted
            .into_iter()
            .find(|c| !attempted.contains(&c.name))
            .cloned()
            .ok_or_else(|| error::SelectError::Exhausted("priority".into()))
    }

    fn select_round_robin(&self) -> error::Result<ProviderCandidate> {
        let mut slots: Vec<&ProviderCandidate> = Vec::new();
        for candidate in &self.candidates {
            let weight = candidate.weight.max(1);
            for _ in 0..weight {
                slots.push(candidate);
            }
        }
        if slots.is_empty() {
            return Err(error::SelectError::NoCandidates);
        }
        let attempted = self.attempted.read();
        let start = self.round_robin_counter.fetch_add(1, Ordering::SeqCst) % slots.len();
        (0..slots.len())
            .map(|offset| slots[(start + offset) % slots.len()])
            .find(|c| !attempted.contains(&c.name))
            .cloned()
            .ok_or_else(|| error::SelectError::Exhausted("round_robin".into()))
    }

    async fn select_availability(&self) -> error::Result<ProviderCandidate> {
        let attempted = self.attempted.read().clone();
        let mut sorted: Vec<ProviderCandidate> = self.candidates.iter().cloned().collect();
        sorted.sort_by_key(|c| c.priority);
        for candidate in sorted {
            if attempted.contains(&candidate.name) {
                continue;
            }
            match candidate.provider.list_instance_types().await {
                Ok(Some(types)) => {
                    let available = types
                        .iter()
                        .any(|t| t.name == candidate.instance_type && t.available);
                    if available {
                        return Ok(candidate);
                    }
                }
                Ok(None) => return Ok(candidate),
                Err(err) => {
                    warn!(candidate = %candidate.name, error = %err, "availability query failed");
                    continue;
                }
            }
        }
        Err(error::SelectError::Exhausted("availability".into()))
    }

    async fn select_cost(&self) -> error::Result<ProviderCandidate> {
        let attempted = self.attempted.read().clone();
        let mut priced: Vec<(Option<f64>, ProviderCandidate)> = Vec::new();
        for candidate in self.candidates.iter().cloned() {
            if attempted.contains(&candidate.name) {
                continue;
            }
            let price = match candidate.provider.list_instance_types().await {
                Ok(Some(types)) => types
                    .iter()
                    .find(|t| t.name == candidate.instance_type && t.available)
                    .and_then(|t| t.price_per_hr),
                _ => None,
            };
            priced.push((price, candidate));
        }
        priced.sort_by(|a, b| match (a.0, b.0) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        priced
            .into_iter()
            .next()
            .map(|(_, candidate)| candidate)
            .ok_or_else(|| error::SelectError::Exhausted("cost".into()))
    }

    pub fn record_failure(&self, name: &str) {
        self.attempted.write().insert(name.to_string());
    }

    pub fn record_success(&self, _name: &str) {
        self.attempted.write().clear();
    }
}

// ─── FailoverSelector ────────────────────────────────────────────────────────

/// Wraps a priority `ProviderSelector` with an embedded `FailureTracker`:
/// candidates in backoff are filtered out before delegating; if every
/// candidate is excluded, the full list is passed through so the inner
/// selector's exhaustion error still propagates.
pub struct FailoverSelector {
    inner: ProviderSelector,
    failures: FailureTracker,
}

impl FailoverSelector {
    pub fn new(candidates: Vec<ProviderCandidate>) -> Self {
        Self::with_config(candidates, FailureTrackerConfig::default())
    }

    pub fn with_config(candidates: Vec<ProviderCandidate>, config: FailureTrackerConfig) -> Self {
        Self {
            inner: ProviderSelector::new(Strategy::Priority, candidates),
            failures: FailureTracker::new(config),
        }
    }

    pub async fn select(&self, now: DateTime<Utc>) -> error::Result<ProviderCandidate> {
        let all_excluded = self
            .inner
            .candidates
            .iter()
            .all(|c| self.failures.is_excluded(&c.name, now));
        if all_excluded {
            debug!("all provider candidates excluded; passing full list through");
        } else {
            for candidate in &self.inner.candidates {
                if self.failures.is_excluded(&candidate.name, now) {
                    self.inner.record_failure(&candidate.name);
                }
            }
        }
        self.inner.select().await
    }

    pub fn record_success(&self, name: &str) {
        self.inner.record_success(name);
    }

    pub fn record_failure(&self, name: &str, now: DateTime<Utc>) {
        self.failures.record_failure(name, now);
        self.inner.record_failure(name);
        info!(provider = name, "recorded provider failure");
    }

    pub fn record_zone_failure(&self, name: &str, zone: &str, now: DateTime<Utc>) {
        self.failures.record_failure(&format!("{name}:{zone}"), now);
        self.inner.record_failure(name);
    }
}

// ─── ZoneDistributor ─────────────────────────────────────────────────────────

/// Tracks per-zone node counts and answers "next zone" with the least
/// loaded zone, ties broken by the order zones are passed in.
pub struct ZoneDistributor {
    counts: RwLock<HashMap<String, u32>>,
}

impl ZoneDistributor {
    pub fn new() -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
        }
    }

    pub fn next_zone(&self, zones: &[String]) -> Option<String> {
        let counts = self.counts.read();
        zones
            .iter()
            .min_by_key(|zone| counts.get(*zone).copied().unwrap_or(0))
            .cloned()
    }

    pub fn record_provision(&self, zone: &str) {
        *self.counts.write().entry(zone.to_string()).or_insert(0) += 1;
    }

    pub fn record_termination(&self, zone: &str) {
        let mut counts = self.counts.write();
        if let Some(count) = counts.get_mut(zone) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Default for ZoneDistributor {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Test double ─────────────────────────────────────────────────────────────

/// A scripted `Provider` for tests: `provision`/`terminate` either succeed
/// or return the configured error, with no network I/O.
#[derive(Debug)]
pub struct StaticProvider {
    name: String,
    fails: std::sync::atomic::AtomicBool,
    instance_types: Vec<InstanceTypeInfo>,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fails: std::sync::atomic::AtomicBool::new(false),
            instance_types: Vec::new(),
        }
    }

    pub fn with_instance_types(mut self, types: Vec<InstanceTypeInfo>) -> Self {
        self.instance_types = types;
        self
    }

    pub fn set_fails(&self, fails: bool) {
        self.fails.store(fails, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn provision(&self, req: &ProvisionRequest) -> Result<Node> {
        if self.fails.load(Ordering::SeqCst) {
            anyhow::bail!("{} provisioning failed", self.name);
        }
        Ok(Node {
            provider_instance_id: format!("{}-{}", self.name, req.name),
            provider_name: self.name.clone(),
            region: req.region.clone(),
            zone: req.zone.clone(),
            instance_type: req.instance_type.clone(),
            ip_address: None,
            created_at: Utc::now(),
        })
    }

    async fn terminate(&self, _provider_instance_id: &str) -> Result<()> {
        if self.fails.load(Ordering::SeqCst) {
            anyhow::bail!("{} teardown failed", self.name);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Node>> {
        Ok(Vec::new())
    }

    async fn list_instance_types(&self) -> Result<Option<Vec<InstanceTypeInfo>>> {
        if self.instance_types.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.instance_types.clone()))
        }
    }
}
