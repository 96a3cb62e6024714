//! Destination publisher

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::SharedLink;
use crate::event::{self, EncodeError, Record};
use crate::remote::{RemoteConnector, RemoteError, RemoteLink, RemoteLinkStatus};

/// Publishing a record failed
#[derive(Debug)]
pub enum PublishError {
    /// Record could not be serialized
    Encode(EncodeError),
    /// Destination link refused or lost the message
    Transport(RemoteError),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Encode(e) => write!(f, "Encode error: {}", e),
            PublishError::Transport(e) => write!(f, "Transport error: {}", e),
        }
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PublishError::Encode(e) => Some(e),
            PublishError::Transport(e) => Some(e),
        }
    }
}

impl From<EncodeError> for PublishError {
    fn from(e: EncodeError) -> Self {
        PublishError::Encode(e)
    }
}

impl From<RemoteError> for PublishError {
    fn from(e: RemoteError) -> Self {
        PublishError::Transport(e)
    }
}

/// Re-dials the destination when its link has gone away
struct Redial {
    connector: Arc<dyn RemoteConnector>,
    address: String,
    interval: Duration,
    last_attempt: parking_lot::Mutex<Option<Instant>>,
}

impl Redial {
    /// At most one connect attempt per interval
    fn due(&self) -> bool {
        let mut last = self.last_attempt.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Sends reduced records to the destination channel.
///
/// A failed record is never retried or queued. A lost link is replaced
/// lazily by the next publish when a redial is configured.
pub struct Publisher {
    link: SharedLink,
    redial: Option<Redial>,
}

impl Publisher {
    pub fn new(link: Arc<dyn RemoteLink>) -> Self {
        Self {
            link: SharedLink::new(link),
            redial: None,
        }
    }

    /// Reconnect through `connector` once the current link is lost, no
    /// more often than every `interval`
    pub fn with_redial(
        mut self,
        connector: Arc<dyn RemoteConnector>,
        address: impl Into<String>,
        interval: Duration,
    ) -> Self {
        self.redial = Some(Redial {
            connector,
            address: address.into(),
            interval,
            last_attempt: parking_lot::Mutex::new(None),
        });
        self
    }

    pub fn link(&self) -> &SharedLink {
        &self.link
    }

    pub async fn publish(&self, record: &Record) -> Result<(), PublishError> {
        let payload = event::encode(record)?;
        let link = self.usable_link().await?;
        if let Err(e) = link.publish(payload).await {
            if matches!(e, RemoteError::ConnectionLost(_)) && self.link.discard(&link).await {
                info!("Destination client reset ({})", link.address());
                link.close().await;
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn usable_link(&self) -> Result<Arc<dyn RemoteLink>, RemoteError> {
        let mut guard = self.link.lock().await;
        let Some(redial) = &self.redial else {
            return guard
                .clone()
                .ok_or_else(|| RemoteError::ConnectionLost("destination not connected".into()));
        };

        if let Some(link) = guard.as_ref() {
            if link.status() != RemoteLinkStatus::Disconnected {
                return Ok(link.clone());
            }
        }
        if let Some(old) = guard.take() {
            info!("Destination client reset ({})", old.address());
            old.close().await;
        }

        if !redial.due() {
            return Err(RemoteError::ConnectionLost(
                "destination reconnect pending".into(),
            ));
        }
        match redial.connector.connect(&redial.address).await {
            Ok(link) => {
                info!("Reconnected to destination {}", redial.address);
                *guard = Some(link.clone());
                Ok(link)
            }
            Err(e) => {
                warn!("Reconnect to destination {} failed: {}", redial.address, e);
                Err(e)
            }
        }
    }
}
