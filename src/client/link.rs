//! Channel-bound MQTT links for the forwarding core

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ClientOptions, MqttConnection};
use crate::protocol::QoS;
use crate::remote::{RemoteConnector, RemoteError, RemoteLink, RemoteLinkStatus};

/// An [`MqttConnection`] bound to one channel topic
pub struct MqttLink {
    connection: MqttConnection,
    topic: String,
    qos: QoS,
}

impl MqttLink {
    pub fn new(connection: MqttConnection, topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            connection,
            topic: topic.into(),
            qos,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl RemoteLink for MqttLink {
    fn address(&self) -> &str {
        self.connection.address()
    }

    fn status(&self) -> RemoteLinkStatus {
        self.connection.status()
    }

    async fn subscribe(&self, sink: mpsc::Sender<Bytes>) -> Result<(), RemoteError> {
        self.connection.subscribe(&self.topic, self.qos, sink).await
    }

    async fn publish(&self, payload: Bytes) -> Result<(), RemoteError> {
        self.connection
            .publish(&self.topic, payload, self.qos, false)
            .await
    }

    async fn close(&self) {
        debug!("Closing link to {} ({})", self.address(), self.topic);
        self.connection.disconnect().await;
    }
}

/// Opens [`MqttLink`]s with fixed client options, topic and QoS
#[derive(Debug, Clone)]
pub struct MqttConnector {
    options: ClientOptions,
    topic: String,
    qos: QoS,
}

impl MqttConnector {
    pub fn new(options: ClientOptions, topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            options,
            topic: topic.into(),
            qos,
        }
    }
}

#[async_trait]
impl RemoteConnector for MqttConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn RemoteLink>, RemoteError> {
        let connection = MqttConnection::connect(address, &self.options).await?;
        Ok(Arc::new(MqttLink::new(
            connection,
            self.topic.clone(),
            self.qos,
        )))
    }
}
