//! Forwarding Core
//!
//! Wires the source subscription, the record processor, the destination
//! publisher and the two status reporters together. Every long-running
//! piece is a tokio task listening on one broadcast shutdown channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::filter::FilterSet;
use crate::remote::{NodeRegistry, RemoteConnector, RemoteLink};

mod publisher;
mod reconnect;
mod status;
mod subscription;

pub use publisher::{PublishError, Publisher};
pub use reconnect::{Reconnector, SharedLink};
pub use status::StatusReporter;
pub use subscription::{LoopState, Outcome, RecordProcessor, StreamError, SubscriptionLoop};

#[cfg(test)]
mod tests;

/// Number of records published to the destination, shared by the
/// processor and both status reporters
#[derive(Debug, Clone, Default)]
pub struct ForwardCounter(Arc<AtomicU64>);

impl ForwardCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one forwarded record, returning the new total
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Timing and buffering knobs of the forwarding tasks
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    /// Fixed wait before each reconnect attempt
    pub reconnect_interval: Duration,
    /// Period of the registry status reports
    pub status_interval: Duration,
    /// Capacity of the inbound payload channel
    pub channel_capacity: usize,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(3),
            channel_capacity: 1024,
        }
    }
}

/// Everything the forwarder needs from startup
pub struct ForwarderParts {
    /// Source link cell, pre-populated with the initial connection
    pub source: SharedLink,
    /// Data address of the source broker, used for reconnects
    pub source_address: String,
    pub source_connector: Arc<dyn RemoteConnector>,
    /// Initial destination link, replaced through `destination_connector`
    /// once lost
    pub destination: Arc<dyn RemoteLink>,
    pub destination_address: String,
    pub destination_connector: Arc<dyn RemoteConnector>,
    pub filters: Arc<FilterSet>,
    pub source_registry: Arc<dyn NodeRegistry>,
    pub destination_registry: Arc<dyn NodeRegistry>,
}

/// Handle to the running forwarding tasks
pub struct Forwarder {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    counter: ForwardCounter,
    state: watch::Receiver<LoopState>,
    destination: SharedLink,
}

impl Forwarder {
    /// Spawn the subscription loop, the record consumer and both status
    /// reporters
    pub fn start(parts: ForwarderParts, settings: ForwardSettings) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(settings.channel_capacity.max(1));
        let counter = ForwardCounter::new();

        let reconnector = Arc::new(Reconnector::new(
            parts.source.clone(),
            parts.source_connector,
            parts.source_address,
            settings.reconnect_interval,
        ));
        let subscription = SubscriptionLoop::new(parts.source, reconnector, inbound_tx);
        let state = subscription.state();

        let processor = Arc::new(RecordProcessor::new(
            parts.filters,
            Publisher::new(parts.destination).with_redial(
                parts.destination_connector,
                parts.destination_address,
                settings.reconnect_interval,
            ),
            counter.clone(),
        ));

        let destination = processor.publisher().link().clone();

        let reporters = [
            StatusReporter::new(
                parts.source_registry,
                counter.clone(),
                "recv",
                settings.status_interval,
            ),
            StatusReporter::new(
                parts.destination_registry,
                counter.clone(),
                "sent",
                settings.status_interval,
            ),
        ];

        let mut tasks = Vec::with_capacity(4);
        tasks.push(tokio::spawn(subscription.run(shutdown_tx.subscribe())));
        tasks.push(tokio::spawn(processor.run(inbound_rx, shutdown_tx.subscribe())));
        for reporter in reporters {
            tasks.push(tokio::spawn(reporter.run(shutdown_tx.subscribe())));
        }

        info!("Forwarder started");

        Self {
            shutdown_tx,
            tasks,
            counter,
            state,
            destination,
        }
    }

    pub fn counter(&self) -> &ForwardCounter {
        &self.counter
    }

    /// Cell holding the live destination link
    pub fn destination(&self) -> &SharedLink {
        &self.destination
    }

    /// Current state of the subscription loop
    pub fn loop_state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Signal every task to stop and wait for them to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Forwarder stopped after {} records", self.counter.get());
    }
}
