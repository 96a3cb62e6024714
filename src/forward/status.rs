//! Periodic node status reports

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::ForwardCounter;
use crate::remote::NodeRegistry;

/// Reports `<label>:<count>` to one broker's node registry on a fixed period
pub struct StatusReporter {
    registry: Arc<dyn NodeRegistry>,
    counter: ForwardCounter,
    label: &'static str,
    interval: Duration,
}

impl StatusReporter {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        counter: ForwardCounter,
        label: &'static str,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            counter,
            label,
            interval,
        }
    }

    /// Send one status update; failures are logged and ignored
    pub async fn report(&self) {
        let count = self.counter.get();
        let status = format!("{}:{}", self.label, count);
        match self.registry.set_node_status(count, &status).await {
            Ok(()) => debug!("Node '{}' status {}", self.registry.node_name(), status),
            Err(e) => debug!(
                "Node '{}' status update failed: {}",
                self.registry.node_name(),
                e
            ),
        }
    }

    /// Report immediately, then every interval until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                result = shutdown.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => break,
                    }
                }
                _ = ticker.tick() => {
                    self.report().await;
                }
            }
        }
    }
}
