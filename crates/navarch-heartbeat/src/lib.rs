//! Periodic sweep that demotes nodes which have gone silent past their
//! heartbeat timeout. Mirrors the background-loop shape used by the
//! instance tracker's stale-registration sweep.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use navarch_clock::Clock;
use navarch_proto::NodeStatus;
use navarch_store::Store;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

#[async_trait]
pub trait HeartbeatObserver: Send + Sync {
    async fn on_node_unhealthy(&self, node_id: &str);
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitorConfig {
    pub heartbeat_timeout: StdDuration,
    pub check_interval: StdDuration,
}

impl Default for HeartbeatMonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: StdDuration::from_secs(2 * 60),
            check_interval: StdDuration::from_secs(30),
        }
    }
}

struct LoopHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// A node that has never sent a heartbeat is not considered overdue —
/// there is nothing to time out yet, so it is left for registration or
/// the instance tracker's own timeout to handle.
pub struct HeartbeatMonitor {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    config: HeartbeatMonitorConfig,
    observer: Option<Arc<dyn HeartbeatObserver>>,
    loop_handle: Mutex<Option<LoopHandle>>,
}

impl HeartbeatMonitor {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, config: HeartbeatMonitorConfig) -> Self {
        Self {
            store,
            clock,
            config,
            observer: None,
            loop_handle: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn HeartbeatObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sweep_once(&self) {
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::zero());

        for node in self.store.list_nodes() {
            if matches!(node.status, NodeStatus::Unhealthy | NodeStatus::Terminated) {
                continue;
            }
            let Some(last_heartbeat) = node.last_heartbeat else {
                continue;
            };
            if now - last_heartbeat <= timeout {
                continue;
            }

            if self.store.update_node_status(&node.node_id, NodeStatus::Unhealthy).is_ok() {
                warn!(node_id = %node.node_id, "node heartbeat timed out, marking unhealthy");
                self.notify(&node.node_id);
            }
        }
    }

    fn notify(&self, node_id: &str) {
        let Some(observer) = self.observer.clone() else { return };
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            observer.on_node_unhealthy(&node_id).await;
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
        let monitor = Arc::clone(self);
        let mut ticker = self.clock.new_ticker(self.config.check_interval);
        let join = tokio::spawn(async move {
            while !stop_for_task.load(Ordering::SeqCst) {
                match ticker.tick().await {
                    Some(_) => monitor.sweep_once(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use navarch_clock::FakeClock;
    use navarch_proto::{HealthStatus, NodeConfigSnapshot, NodeRecord};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    fn store_and_clock() -> (Arc<Store>, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        (Arc::new(Store::new(clock.clone())), clock)
    }

    fn node(id: &str, status: NodeStatus, last_heartbeat: Option<chrono::DateTime<chrono::Utc>>) -> NodeRecord {
        NodeRecord {
            node_id: id.to_string(),
            provider: "gcp".into(),
            region: "us-central1".into(),
            zone: "us-central1-a".into(),
            instance_type: "a3-highgpu-8g".into(),
            gpus: vec![],
            labels: HashMap::new(),
            status,
            health_status: HealthStatus::Unknown,
            last_heartbeat,
            last_health_check: None,
            registered_at: chrono::Utc::now(),
            config: NodeConfigSnapshot { health_check_interval_seconds: 30, heartbeat_interval_seconds: 30, enabled_health_checks: vec![] },
        }
    }

    #[test]
    fn sweep_demotes_overdue_node() {
        let (store, clock) = store_and_clock();
        store.register_node(node("n-1", NodeStatus::Active, Some(clock.now())));
        let monitor = HeartbeatMonitor::new(store.clone(), clock.clone(), HeartbeatMonitorConfig {
            heartbeat_timeout: StdDuration::from_secs(60),
            check_interval: StdDuration::from_secs(10),
        });

        clock.advance(StdDuration::from_secs(30));
        monitor.sweep_once();
        assert_eq!(store.get_node("n-1").unwrap().status, NodeStatus::Active);

        clock.advance(StdDuration::from_secs(60));
        monitor.sweep_once();
        assert_eq!(store.get_node("n-1").unwrap().status, NodeStatus::Unhealthy);
    }

    #[test]
    fn sweep_skips_node_with_no_heartbeat_yet() {
        let (store, clock) = store_and_clock();
        store.register_node(node("n-1", NodeStatus::Active, None));
        let monitor = HeartbeatMonitor::new(store.clone(), clock, HeartbeatMonitorConfig {
            heartbeat_timeout: StdDuration::from_secs(60),
            check_interval: StdDuration::from_secs(10),
        });
        monitor.sweep_once();
        assert_eq!(store.get_node("n-1").unwrap().status, NodeStatus::Active);
    }

    #[test]
    fn sweep_skips_already_unhealthy_and_terminated() {
        let (store, clock) = store_and_clock();
        store.register_node(node("n-1", NodeStatus::Unhealthy, Some(clock.now())));
        store.register_node(node("n-2", NodeStatus::Terminated, Some(clock.now())));
        let monitor = HeartbeatMonitor::new(store.clone(), clock.clone(), HeartbeatMonitorConfig {
            heartbeat_timeout: StdDuration::from_secs(10),
            check_interval: StdDuration::from_secs(10),
        });
        clock.advance(StdDuration::from_secs(100));
        monitor.sweep_once();
        assert_eq!(store.get_node("n-1").unwrap().status, NodeStatus::Unhealthy);
        assert_eq!(store.get_node("n-2").unwrap().status, NodeStatus::Terminated);
    }

    struct RecordingObserver {
        calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl HeartbeatObserver for RecordingObserver {
        async fn on_node_unhealthy(&self, node_id: &str) {
            self.calls.lock().unwrap().push(node_id.to_string());
        }
    }

    #[tokio::test]
    async fn notifies_observer_on_demotion() {
        let (store, clock) = store_and_clock();
        store.register_node(node("n-1", NodeStatus::Active, Some(clock.now())));
        let observer = Arc::new(RecordingObserver { calls: StdMutex::new(Vec::new()) });
        let monitor = HeartbeatMonitor::new(store, clock.clone(), HeartbeatMonitorConfig {
            heartbeat_timeout: StdDuration::from_secs(10),
            check_interval: StdDuration::from_secs(10),
        })
        .with_observer(observer.clone());

        clock.advance(StdDuration::from_secs(100));
        monitor.sweep_once();
        tokio::task::yield_now().await;
        assert_eq!(observer.calls.lock().unwrap().as_slice(), ["n-1"]);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_allows_restart() {
        let (store, clock) = store_and_clock();
        let monitor = Arc::new(HeartbeatMonitor::new(store, clock, HeartbeatMonitorConfig::default()));
        monitor.start().await;
        monitor.start().await;
        monitor.stop().await;
        monitor.start().await;
        monitor.stop().await;
    }
}
