//! Lifecycle state machine for cloud instances, plus the background
//! sweep that fails stale registrations and reaps old terminated records.
//!
//! ```text
//! Provisioning ─► PendingRegistration ─► Running ─► Terminating ─► Terminated
//!            │                       │         │
//!            ▼                       ▼         ▼
//!           Failed                 Failed    Failed
//! ```

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use navarch_clock::Clock;
use navarch_proto::error::{NavarchError, Result};
use navarch_proto::{InstanceRecord, InstanceState};
use navarch_store::Store;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

#[async_trait]
pub trait InstanceObserver: Send + Sync {
    async fn on_stale(&self, instance: InstanceRecord);
    async fn on_failed(&self, instance: InstanceRecord);
}

#[derive(Debug, Clone)]
pub struct InstanceTrackerConfig {
    pub registration_timeout: StdDuration,
    pub stale_check_interval: StdDuration,
    pub retain_terminated_duration: StdDuration,
}

impl Default for InstanceTrackerConfig {
    fn default() -> Self {
        Self {
            registration_timeout: StdDuration::from_secs(10 * 60),
            stale_check_interval: StdDuration::from_secs(60),
            retain_terminated_duration: StdDuration::from_secs(24 * 60 * 60),
        }
    }
}

struct LoopHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

pub struct InstanceTracker {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    config: InstanceTrackerConfig,
    observer: Option<Arc<dyn InstanceObserver>>,
    loop_handle: Mutex<Option<LoopHandle>>,
}

impl InstanceTracker {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, config: InstanceTrackerConfig) -> Self {
        Self {
            store,
            clock,
            config,
            observer: None,
            loop_handle: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn InstanceObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn track_provisioning(&self, record: InstanceRecord) -> Result<InstanceRecord> {
        self.store.create_instance(record.clone())?;
        Ok(record)
    }

    pub fn track_provisioning_complete(&self, instance_id: &str) -> Result<()> {
        self.store
            .update_instance_state(instance_id, InstanceState::PendingRegistration, String::new())
    }

    pub async fn track_provisioning_failed(&self, instance_id: &str, reason: String) -> Result<()> {
        self.store.update_instance_state(instance_id, InstanceState::Failed, reason)?;
        self.notify_failed(instance_id).await;
        Ok(())
    }

    /// Idempotently sets `node_id` then transitions to Running. An
    /// instance provisioned externally (unknown to this tracker) is not
    /// an error — the registration still succeeds at the registry layer.
    pub fn track_node_registered(&self, instance_id: &str, node_id: String) -> Result<()> {
        match self.store.update_instance_node_id(instance_id, node_id) {
            Ok(()) => {}
            Err(NavarchError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        }
        match self
            .store
            .update_instance_state(instance_id, InstanceState::Running, String::new())
        {
            Ok(()) | Err(NavarchError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn track_terminating(&self, instance_id: &str) -> Result<()> {
        self.store
            .update_instance_state(instance_id, InstanceState::Terminating, String::new())
    }

    pub fn track_terminated(&self, instance_id: &str) -> Result<()> {
        self.store
            .update_instance_state(instance_id, InstanceState::Terminated, String::new())
    }

    async fn notify_failed(&self, instance_id: &str) {
        let Some(observer) = self.observer.clone() else { return };
        let Ok(instance) = self.store.get_instance(instance_id) else { return };
        tokio::spawn(async move {
            observer.on_failed(instance).await;
        });
    }

    fn sweep_once(&self) {
        let now = self.clock.now();
        let registration_timeout = chrono::Duration::from_std(self.config.registration_timeout)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let retain_terminated = chrono::Duration::from_std(self.config.retain_terminated_duration)
            .unwrap_or_else(|_| chrono::Duration::zero());

        for instance in self.store.list_instances_by_state(InstanceState::PendingRegistration) {
            if now - instance.created_at > registration_timeout {
                if self
                    .store
                    .update_instance_state(&instance.instance_id, InstanceState::Failed, "registration timeout exceeded".into())
                    .is_ok()
                {
                    if let Ok(updated) = self.store.get_instance(&instance.instance_id) {
                        info!(instance_id = %updated.instance_id, "registration timed out");
                        let tracker_instance = updated.clone();
                        self.spawn_stale_and_failed(tracker_instance);
                    }
                }
            }
        }

        for instance in self.store.list_instances_by_state(InstanceState::Terminated) {
            if let Some(terminated_at) = instance.terminated_at {
                if now - terminated_at > retain_terminated {
                    self.store.delete_instance(&instance.instance_id);
                }
            }
        }
    }

    fn spawn_stale_and_failed(&self, instance: InstanceRecord) {
        let Some(observer) = self.observer.clone() else { return };
        let stale_copy = instance.clone();
        tokio::spawn(async move {
            observer.on_stale(stale_copy).await;
        });
        tokio::spawn(async move {
            observer.on_failed(instance).await;
        });
    }

    /// Idempotent: a second call while already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.loop_handle.lock().await;
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_task = stop.clone();
        let tracker = Arc::clone(self);
        let mut ticker = self.clock.new_ticker(self.config.stale_check_interval);
        let join = tokio::spawn(async move {
            while !stop_for_task.load(Ordering::SeqCst) {
                match ticker.tick().await {
                    Some(_) => tracker.sweep_once(),
                    None => break,
                }
            }
        });
        *guard = Some(LoopHandle { stop, join });
    }

    /// Waits for the sweep to exit. Safe to call again; `start` may be
    /// called again afterward.
    pub async fn stop(&self) {
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            handle.stop.store(true, Ordering::SeqCst);
            handle.join.abort();
            let _ = handle.join.await;
        }
    }

    pub fn stats(&self) -> HashMap<InstanceState, u32> {
        let mut counts = HashMap::new();
        for instance in self.store.list_instances() {
            *counts.entry(instance.state).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navarch_clock::FakeClock;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    fn store_and_clock() -> (Arc<Store>, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        (Arc::new(Store::new(clock.clone())), clock)
    }

    fn instance(id: &str, state: InstanceState, created_at: chrono::DateTime<chrono::Utc>) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.to_string(),
            provider: "gcp".into(),
            region: "us-central1".into(),
            zone: "us-central1-a".into(),
            instance_type: "a3-highgpu-8g".into(),
            state,
            pool_name: "pool-a".into(),
            created_at,
            ready_at: None,
            terminated_at: None,
            node_id: None,
            status_message: String::new(),
            labels: StdHashMap::new(),
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        stale: StdMutex<Vec<String>>,
        failed: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl InstanceObserver for RecordingObserver {
        async fn on_stale(&self, instance: InstanceRecord) {
            self.stale.lock().unwrap().push(instance.instance_id);
        }
        async fn on_failed(&self, instance: InstanceRecord) {
            self.failed.lock().unwrap().push(instance.instance_id);
        }
    }

    #[test]
    fn track_provisioning_rejects_duplicate_id() {
        let (store, clock) = store_and_clock();
        let tracker = InstanceTracker::new(store, clock.clone(), InstanceTrackerConfig::default());
        let record = instance("i-1", InstanceState::Provisioning, clock.now());
        tracker.track_provisioning(record.clone()).unwrap();
        assert!(matches!(
            tracker.track_provisioning(record),
            Err(NavarchError::AlreadyExists(_))
        ));
    }

    #[test]
    fn track_node_registered_on_unknown_id_succeeds() {
        let (store, clock) = store_and_clock();
        let tracker = InstanceTracker::new(store, clock, InstanceTrackerConfig::default());
        assert!(tracker.track_node_registered("ghost", "node-1".into()).is_ok());
    }

    #[test]
    fn track_node_registered_transitions_to_running() {
        let (store, clock) = store_and_clock();
        let tracker = InstanceTracker::new(store.clone(), clock.clone(), InstanceTrackerConfig::default());
        tracker
            .track_provisioning(instance("i-1", InstanceState::Provisioning, clock.now()))
            .unwrap();
        tracker.track_node_registered("i-1", "node-1".into()).unwrap();
        let updated = store.get_instance("i-1").unwrap();
        assert_eq!(updated.state, InstanceState::Running);
        assert_eq!(updated.node_id, Some("node-1".into()));
        assert!(updated.ready_at.is_some());
    }

    #[tokio::test]
    async fn sweep_fails_stale_pending_registration_and_notifies() {
        let (store, clock) = store_and_clock();
        let config = InstanceTrackerConfig {
            registration_timeout: StdDuration::from_millis(100),
            stale_check_interval: StdDuration::from_millis(50),
            retain_terminated_duration: StdDuration::from_secs(60 * 60 * 24),
        };
        let observer = Arc::new(RecordingObserver::default());
        let tracker = InstanceTracker::new(store.clone(), clock.clone(), config).with_observer(observer.clone());

        tracker
            .track_provisioning(instance("i-1", InstanceState::Provisioning, clock.now()))
            .unwrap();
        tracker.track_provisioning_complete("i-1").unwrap();

        tracker.sweep_once();
        assert_eq!(store.get_instance("i-1").unwrap().state, InstanceState::PendingRegistration);

        clock.advance(StdDuration::from_millis(200));
        tracker.sweep_once();
        // allow the detached notify tasks to run
        tokio::task::yield_now().await;

        let updated = store.get_instance("i-1").unwrap();
        assert_eq!(updated.state, InstanceState::Failed);
        assert_eq!(updated.status_message, "registration timeout exceeded");
    }

    #[test]
    fn sweep_deletes_terminated_instances_past_retention() {
        let (store, clock) = store_and_clock();
        let config = InstanceTrackerConfig {
            registration_timeout: StdDuration::from_secs(600),
            stale_check_interval: StdDuration::from_secs(60),
            retain_terminated_duration: StdDuration::from_secs(60),
        };
        let tracker = InstanceTracker::new(store.clone(), clock.clone(), config);
        tracker
            .track_provisioning(instance("i-1", InstanceState::Provisioning, clock.now()))
            .unwrap();
        tracker.track_terminated("i-1").unwrap();

        clock.advance(StdDuration::from_secs(120));
        tracker.sweep_once();
        assert!(store.get_instance("i-1").is_err());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_allows_restart() {
        let (store, clock) = store_and_clock();
        let tracker = Arc::new(InstanceTracker::new(store, clock, InstanceTrackerConfig::default()));
        tracker.start().await;
        tracker.start().await; // no-op
        tracker.stop().await;
        tracker.start().await; // legal restart
        tracker.stop().await;
    }
}
