//! Node Registry Abstraction
//!
//! Each broker keeps a registry of attached nodes. The forwarder registers
//! on both sides at startup, reports its forwarded-message count as a
//! liveness signal, and unregisters on shutdown.

use std::fmt;

use async_trait::async_trait;

use super::RemoteError;

/// Registration with a broker's node registry failed
#[derive(Debug)]
pub struct RegistrationError {
    /// Registry (node server) address
    pub server: String,
    /// Node name that was being registered
    pub node_name: String,
    pub source: RemoteError,
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "can't register node '{}' at {}: {}",
            self.node_name, self.server, self.source
        )
    }
}

impl std::error::Error for RegistrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// A broker's node registry
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Node name used for registration
    fn node_name(&self) -> &str;

    /// Announce this node; returns the broker address to use for data traffic
    async fn register(&self) -> Result<String, RegistrationError>;

    /// Publish a liveness/throughput status for this node
    async fn set_node_status(&self, count: u64, status: &str) -> Result<(), RemoteError>;

    /// Withdraw the registration
    async fn unregister(&self) -> Result<(), RemoteError>;
}
