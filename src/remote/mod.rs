//! Remote Broker Communication
//!
//! Abstractions the forwarding core uses to talk to the two brokers: a
//! link bound to one channel that can subscribe and publish, a connector
//! that establishes such links, and the node registry each broker exposes
//! for registration and liveness status.

mod peer;
mod registry;

pub use peer::{RemoteConnector, RemoteError, RemoteLink, RemoteLinkStatus};
pub use registry::{NodeRegistry, RegistrationError};
