use crate::bus::MessageBus;
use crate::registry::Component;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{LivenessConfig, UnregisterReason};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Periodically evicts components that stopped sending heartbeats.
///
/// The staleness threshold lives on the registry; the monitor only decides how
/// often to check. Each evicted component is announced as a
/// `ComponentUnregistered` broadcast with reason `liveness_timeout`.
pub struct LivenessMonitor {
    bus: Arc<MessageBus>,
    check_interval: Duration,
}

impl LivenessMonitor {
    pub fn new(bus: Arc<MessageBus>, check_interval: Duration) -> Self {
        Self {
            bus,
            check_interval,
        }
    }

    pub fn from_config(bus: Arc<MessageBus>, config: &LivenessConfig) -> Self {
        Self::new(bus, config.check_interval())
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run one sweep and return the evicted components.
    pub async fn check_once(&self) -> Vec<Component> {
        let evicted = self.bus.registry().evict_stale().await;
        for component in &evicted {
            warn!(
                component_id = %component.id,
                component_type = %component.component_type,
                last_seen = %component.last_seen,
                "Component missed its liveness deadline, evicting"
            );
            self.bus
                .release_component(component, UnregisterReason::LivenessTimeout)
                .await;
        }
        evicted
    }

    /// Start the background sweep loop.
    ///
    /// The loop exits when `shutdown` flips to `true` or its sender is dropped.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.check_interval.as_secs_f64(),
                timeout_secs = self.bus.registry().liveness_timeout().as_secs_f64(),
                "Liveness monitor started"
            );
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Liveness monitor stopped");
        })
    }
}
