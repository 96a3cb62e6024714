//! Source link ownership and reconnection

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::remote::{RemoteConnector, RemoteLink};

/// Cell holding the current source link, or nothing between a reset and a
/// successful reconnect
#[derive(Clone, Default)]
pub struct SharedLink(Arc<Mutex<Option<Arc<dyn RemoteLink>>>>);

impl SharedLink {
    pub fn new(link: Arc<dyn RemoteLink>) -> Self {
        Self(Arc::new(Mutex::new(Some(link))))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot of the current link
    pub async fn current(&self) -> Option<Arc<dyn RemoteLink>> {
        self.0.lock().await.clone()
    }

    pub async fn take(&self) -> Option<Arc<dyn RemoteLink>> {
        self.0.lock().await.take()
    }

    /// Install `link`, returning the one it replaced
    pub async fn install(&self, link: Arc<dyn RemoteLink>) -> Option<Arc<dyn RemoteLink>> {
        self.0.lock().await.replace(link)
    }

    /// Empty the cell if it still holds `link`
    pub async fn discard(&self, link: &Arc<dyn RemoteLink>) -> bool {
        let mut guard = self.0.lock().await;
        if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, link)) {
            *guard = None;
            true
        } else {
            false
        }
    }

    pub(super) async fn lock(&self) -> MutexGuard<'_, Option<Arc<dyn RemoteLink>>> {
        self.0.lock().await
    }
}

/// Replaces a failed source link with a fresh one.
///
/// Retries use a fixed interval and never give up; the forwarder has no
/// other way to make progress while the source broker is away.
pub struct Reconnector {
    link: SharedLink,
    connector: Arc<dyn RemoteConnector>,
    address: String,
    backoff: Duration,
    attempts: AtomicU64,
}

impl Reconnector {
    pub fn new(
        link: SharedLink,
        connector: Arc<dyn RemoteConnector>,
        address: impl Into<String>,
        backoff: Duration,
    ) -> Self {
        Self {
            link,
            connector,
            address: address.into(),
            backoff,
            attempts: AtomicU64::new(0),
        }
    }

    /// Number of `reconnect` calls so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Drop the current link, wait the backoff, then connect unless
    /// another caller already installed a link. Never fails: on error the
    /// cell stays empty and the next subscribe attempt fails fast.
    pub async fn reconnect(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        if let Some(old) = self.link.take().await {
            info!("Source client reset ({})", old.address());
            old.close().await;
        }

        tokio::time::sleep(self.backoff).await;

        // Held across connect so concurrent callers connect at most once
        let mut guard = self.link.lock().await;
        if let Some(existing) = guard.as_ref() {
            info!("Reusing source link to {}", existing.address());
            return;
        }

        match self.connector.connect(&self.address).await {
            Ok(link) => {
                info!("Reconnected to source {}", self.address);
                *guard = Some(link);
            }
            Err(e) if e.is_transient() => {
                warn!("Reconnect to source {} failed: {}", self.address, e);
            }
            Err(e) => {
                // Retried anyway, but unlikely to clear up on its own
                error!("Reconnect to source {} refused: {}", self.address, e);
            }
        }
    }
}
