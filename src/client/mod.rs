//! MQTT Client
//!
//! Client-side MQTT v3.1.1 connections used for both brokers. A
//! [`MqttConnection`] owns the socket in a spawned task and is driven over
//! a command channel; [`MqttLink`] binds a connection to one channel topic
//! for the forwarding core, and [`MqttNodeRegistry`] implements the node
//! registry on top of retained messages.

use std::time::Duration;

use crate::protocol::Will;

mod connection;
mod link;
mod registry;

pub use connection::MqttConnection;
pub use link::{MqttConnector, MqttLink};
pub use registry::{MqttNodeRegistry, RegistryOptions};

/// Connection parameters shared by every connection to one broker
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Client identifier sent in CONNECT
    pub client_id: String,
    /// Keep-alive interval in seconds (0 disables PINGREQ)
    pub keepalive: u16,
    /// Clean session flag
    pub clean_session: bool,
    /// Username for authentication
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<String>,
    /// Timeout for TCP connect plus CONNACK
    pub connect_timeout: Duration,
    /// Timeout waiting for a QoS 1 PUBACK
    pub ack_timeout: Duration,
    /// Will message registered with the broker
    pub will: Option<Will>,
    /// Capacity of the command channel into the connection task
    pub command_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: format!("pcforward-{}", std::process::id()),
            keepalive: 60,
            clean_session: true,
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            will: None,
            command_capacity: 1000,
        }
    }
}
