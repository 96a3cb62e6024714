//! Source subscription loop and record processing
//!
//! The loop keeps one subscription open on the current source link and
//! pushes inbound payloads into an mpsc channel. A separate consumer task
//! drains the channel through [`RecordProcessor`], so a slow destination
//! never blocks the source connection's I/O task beyond the channel bound.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::{ForwardCounter, Publisher, Reconnector, SharedLink};
use crate::event;
use crate::filter::FilterSet;
use crate::remote::RemoteError;
use crate::transform::transform;

/// Subscription loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// A link is installed, about to subscribe
    Connected,
    /// Blocked on the subscription stream
    AwaitingStream,
    /// Stream ended or no link installed; waiting on the reconnector
    Reconnecting,
    /// Shutdown received
    Terminated,
}

/// Why a subscription stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Stream closed without an error
    Closed,
    /// Stream failed
    Failed(RemoteError),
    /// No source link installed
    NotConnected,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Closed => write!(f, "Subscription closed"),
            StreamError::Failed(e) => write!(f, "Subscription failed: {}", e),
            StreamError::NotConnected => write!(f, "Source not connected"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Subscribe, wait for the stream to end, reconnect, repeat
pub struct SubscriptionLoop {
    link: SharedLink,
    reconnector: Arc<Reconnector>,
    sink: mpsc::Sender<Bytes>,
    state: watch::Sender<LoopState>,
}

impl SubscriptionLoop {
    pub fn new(link: SharedLink, reconnector: Arc<Reconnector>, sink: mpsc::Sender<Bytes>) -> Self {
        let (state, _) = watch::channel(LoopState::Connected);
        Self {
            link,
            reconnector,
            sink,
            state,
        }
    }

    /// Watch the loop state
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    /// Run until shutdown. Subscription waits and reconnect backoffs are
    /// both cancelled by the shutdown signal.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let ended = tokio::select! {
                biased;

                _ = shutdown.recv() => break,
                ended = self.await_stream() => ended,
            };
            warn!("Source subscription terminated: {}", ended);

            self.set_state(LoopState::Reconnecting);
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,
                _ = self.reconnector.reconnect() => {}
            }

            // A failed reconnect leaves the cell empty; stay in Reconnecting
            if self.link.current().await.is_some() {
                self.set_state(LoopState::Connected);
            }
        }

        self.set_state(LoopState::Terminated);
        info!("Source subscription loop stopped");
    }

    /// Subscribe on the current link and wait for the stream to end
    async fn await_stream(&self) -> StreamError {
        let Some(link) = self.link.current().await else {
            return StreamError::NotConnected;
        };

        self.set_state(LoopState::AwaitingStream);
        debug!("Subscribing on source {}", link.address());
        match link.subscribe(self.sink.clone()).await {
            Ok(()) => StreamError::Closed,
            Err(e) => StreamError::Failed(e),
        }
    }
}

/// Result of processing one inbound payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Payload did not decode; dropped
    Malformed,
    /// Reduced record published
    Forwarded { kept: usize, dropped: usize },
    /// Destination publish failed; record lost
    PublishFailed,
}

/// Decode, filter and forward single payloads
pub struct RecordProcessor {
    filters: Arc<FilterSet>,
    publisher: Publisher,
    counter: ForwardCounter,
}

impl RecordProcessor {
    pub fn new(filters: Arc<FilterSet>, publisher: Publisher, counter: ForwardCounter) -> Self {
        Self {
            filters,
            publisher,
            counter,
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub async fn process(&self, payload: &[u8]) -> Outcome {
        let record = match event::decode(payload) {
            Ok(record) => record,
            Err(e) => {
                trace!("Dropping undecodable payload: {}", e);
                return Outcome::Malformed;
            }
        };

        let reduced = transform(&record, &self.filters);
        let kept = reduced.data.len();
        let dropped = record.data.len() - kept;

        match self.publisher.publish(&reduced).await {
            Ok(()) => {
                let total = self.counter.increment();
                debug!(
                    "Forwarded record from {} ({} kept, {} dropped, {} total)",
                    record.device_id, kept, dropped, total
                );
                Outcome::Forwarded { kept, dropped }
            }
            Err(e) => {
                warn!("Failed to forward record from {}: {}", record.device_id, e);
                Outcome::PublishFailed
            }
        }
    }

    /// Drain `inbound` until shutdown or until every sender is gone
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Bytes>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,
                payload = inbound.recv() => match payload {
                    Some(payload) => {
                        self.process(&payload).await;
                    }
                    None => break,
                },
            }
        }
        debug!("Record consumer stopped");
    }
}
