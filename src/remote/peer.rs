//! Remote Link Abstraction
//!
//! Trait for a live connection to a broker channel. Implemented by the
//! MQTT client and by in-memory doubles in tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Failure talking to a broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Socket error, broker hung up, or the link was already closed
    ConnectionLost(String),
    /// CONNACK or SUBACK refused the request
    Rejected(String),
    Timeout,
    /// Topic, filter or address the client refuses to send
    InvalidConfig(String),
    Other(String),
}

impl RemoteError {
    /// Whether a fresh connection could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Timeout)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(cause) => write!(f, "connection lost: {}", cause),
            Self::Rejected(reason) => write!(f, "rejected by broker: {}", reason),
            Self::Timeout => f.write_str("timed out"),
            Self::InvalidConfig(what) => write!(f, "invalid request: {}", what),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        Self::ConnectionLost(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteLinkStatus {
    Connecting,
    Connected,
    /// Terminal; a new link has to be connected
    Disconnected,
}

/// A live link to one broker channel
#[async_trait]
pub trait RemoteLink: Send + Sync {
    /// Address of the broker this link talks to
    fn address(&self) -> &str;

    /// Current connection status
    fn status(&self) -> RemoteLinkStatus;

    /// Subscribe to the channel and push every inbound payload into `sink`.
    ///
    /// Resolves only when the stream ends: `Ok(())` on a clean close,
    /// `Err` with the cause otherwise. There is no timeout.
    async fn subscribe(&self, sink: mpsc::Sender<Bytes>) -> Result<(), RemoteError>;

    /// Publish one payload on the channel
    async fn publish(&self, payload: Bytes) -> Result<(), RemoteError>;

    /// Close the link
    async fn close(&self);
}

/// Establishes links to a broker address
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn RemoteLink>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::ConnectionLost("reset".into()).is_transient());
        assert!(!RemoteError::Rejected("not authorized".into()).is_transient());
        assert_eq!(
            RemoteError::Rejected("not authorized".into()).to_string(),
            "rejected by broker: not authorized"
        );
    }
}
