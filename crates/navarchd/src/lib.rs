//! Wires the registry, heartbeat monitor, and pool manager into one
//! running control plane. Each component owns its own background loop;
//! this module only decides construction order and start/stop order.

#![forbid(unsafe_code)]

use std::sync::Arc;

use navarch_clock::{Clock, SystemClock};
use navarch_config::NavarchConfig;
use navarch_heartbeat::{HeartbeatMonitor, HeartbeatMonitorConfig, HeartbeatObserver};
use navarch_instance::{InstanceTracker, InstanceTrackerConfig};
use navarch_poolmgr::{PoolManager, PoolManagerConfig};
use navarch_registry::{HealthObserver, NodeRegistry, ServerConfig};
use navarch_store::Store;
use std::time::Duration as StdDuration;

/// Everything needed to run a Navarch control plane process.
///
/// Construction order matters: the pool manager must exist before the
/// registry and heartbeat monitor are built, since both observe it for
/// unhealthy-node notifications.
pub struct ControlPlane {
    pub store: Arc<Store>,
    pub clock: Arc<dyn Clock>,
    pub instance_tracker: Arc<InstanceTracker>,
    pub pool_manager: Arc<PoolManager>,
    pub heartbeat_monitor: Arc<HeartbeatMonitor>,
    pub registry: Arc<NodeRegistry>,
}

impl ControlPlane {
    pub fn new(config: &NavarchConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(Store::new(clock.clone()));

        let instance_tracker = Arc::new(InstanceTracker::new(
            store.clone(),
            clock.clone(),
            InstanceTrackerConfig {
                registration_timeout: StdDuration::from_secs(config.instance_tracker.registration_timeout_seconds),
                stale_check_interval: StdDuration::from_secs(config.instance_tracker.stale_check_interval_seconds),
                retain_terminated_duration: StdDuration::from_secs(config.instance_tracker.retain_terminated_seconds),
            },
        ));

        let pool_manager = Arc::new(
            PoolManager::new(
                store.clone(),
                clock.clone(),
                PoolManagerConfig {
                    evaluation_interval: StdDuration::from_secs(config.pool_manager.evaluation_interval_seconds),
                },
            )
            .with_instance_tracker(instance_tracker.clone()),
        );

        let heartbeat_monitor = Arc::new(
            HeartbeatMonitor::new(
                store.clone(),
                clock.clone(),
                HeartbeatMonitorConfig {
                    heartbeat_timeout: StdDuration::from_secs(config.heartbeat_monitor.heartbeat_timeout_seconds),
                    check_interval: StdDuration::from_secs(config.heartbeat_monitor.check_interval_seconds),
                },
            )
            .with_observer(pool_manager.clone() as Arc<dyn HeartbeatObserver>),
        );

        let registry = Arc::new(
            NodeRegistry::new(
                store.clone(),
                clock.clone(),
                ServerConfig {
                    health_check_interval_seconds: config.server.health_check_interval_seconds,
                    heartbeat_interval_seconds: config.server.heartbeat_interval_seconds,
                    enabled_health_checks: config.server.enabled_health_checks.clone(),
                },
            )
            .with_instance_tracker(instance_tracker.clone())
            .with_observer(pool_manager.clone() as Arc<dyn HealthObserver>),
        );

        Self {
            store,
            clock,
            instance_tracker,
            pool_manager,
            heartbeat_monitor,
            registry,
        }
    }

    /// Starts every component's background loop. Idempotent per component.
    pub async fn start(&self) {
        self.instance_tracker.start().await;
        self.pool_manager.start().await;
        self.heartbeat_monitor.start().await;
    }

    /// Stops every component's background loop in reverse start order.
    pub async fn stop(&self) {
        self.heartbeat_monitor.stop().await;
        self.pool_manager.stop().await;
        self.instance_tracker.stop().await;
    }
}
