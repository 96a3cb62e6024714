//! PCForward - filtering people-counter event forwarder
//!
//! Subscribes to people-counter event batches on a source MQTT broker,
//! keeps only the sub-events whose category filter matches the device id,
//! and republishes the reduced batches on a destination broker.

pub mod client;
pub mod codec;
pub mod config;
pub mod event;
pub mod filter;
pub mod forward;
pub mod protocol;
pub mod remote;
pub mod topic;
pub mod transform;

pub use client::{ClientOptions, MqttConnection, MqttConnector, MqttLink, MqttNodeRegistry};
pub use config::Config;
pub use event::{Record, SubEvent};
pub use filter::{Category, FilterSet};
pub use forward::{ForwardCounter, ForwardSettings, Forwarder, ForwarderParts};
pub use protocol::QoS;
pub use remote::{NodeRegistry, RemoteConnector, RemoteError, RemoteLink, RemoteLinkStatus};
pub use transform::transform;
