use crate::hub::BrainHub;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::LearningConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Periodic learning cycle.
///
/// Every interval the loop calls [`BrainHub::run_learning_cycle`], the same
/// entry point external callers use.
#[derive(Debug, Clone)]
pub struct LearningLoop {
    interval: Duration,
}

impl LearningLoop {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_config(config: &LearningConfig) -> Self {
        Self::new(config.interval())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the background loop.
    ///
    /// The first cycle runs one full interval after start. The loop exits when
    /// `shutdown` flips to `true` or its sender is dropped.
    pub fn start(self, hub: Arc<BrainHub>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs_f64(),
                "Learning loop started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = hub.run_learning_cycle().await {
                            warn!(error = %e, "Learning cycle failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Learning loop stopped");
        })
    }
}
