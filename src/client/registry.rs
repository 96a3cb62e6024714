//! Node registry on retained MQTT messages
//!
//! Registration is a retained JSON document on `<prefix>/<node>/info`,
//! liveness a retained document on `<prefix>/<node>/status`. The broker's
//! will message flips the status to offline if the process dies without
//! unregistering.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ClientOptions, MqttConnection};
use crate::protocol::{QoS, Will};
use crate::remote::{NodeRegistry, RegistrationError, RemoteError, RemoteLinkStatus};

/// Settings for one broker's node registry
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Node server (broker) address
    pub server: String,
    /// Name this node registers under
    pub node_name: String,
    /// Channel the node serves, advertised in the registration
    pub channel: String,
    /// Topic prefix of the registry
    pub topic_prefix: String,
    /// Data address returned from `register` instead of `server`
    pub local: Option<String>,
    pub client: ClientOptions,
}

impl RegistryOptions {
    pub fn info_topic(&self) -> String {
        format!("{}/{}/info", self.topic_prefix, self.node_name)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/{}/status", self.topic_prefix, self.node_name)
    }
}

/// [`NodeRegistry`] backed by a dedicated MQTT connection to the node server
pub struct MqttNodeRegistry {
    options: RegistryOptions,
    connection: Mutex<Option<MqttConnection>>,
}

impl MqttNodeRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            options,
            connection: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    fn client_options(&self) -> ClientOptions {
        let mut client = self.options.client.clone();
        client.client_id = format!("{}-registry", self.options.node_name);
        client.will = Some(Will {
            topic: self.options.status_topic(),
            payload: status_document(0, "offline", false),
            qos: QoS::AtLeastOnce,
            retain: true,
        });
        client
    }

    /// Current connection, reconnecting if the previous one ended
    async fn connection(&self) -> Result<MqttConnection, RemoteError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.status() == RemoteLinkStatus::Connected {
                return Ok(conn.clone());
            }
            debug!(
                "Registry connection for '{}' lost, reconnecting",
                self.options.node_name
            );
        }

        let conn = MqttConnection::connect(&self.options.server, &self.client_options()).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn info_document(&self) -> Bytes {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let doc = json!({
            "node_name": self.options.node_name,
            "channel": self.options.channel,
            "hostname": hostname,
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
        });
        Bytes::from(doc.to_string())
    }
}

fn status_document(count: u64, status: &str, online: bool) -> Bytes {
    let doc = json!({
        "count": count,
        "status": status,
        "online": online,
    });
    Bytes::from(doc.to_string())
}

#[async_trait]
impl NodeRegistry for MqttNodeRegistry {
    fn node_name(&self) -> &str {
        &self.options.node_name
    }

    async fn register(&self) -> Result<String, RegistrationError> {
        let registration_error = |source| RegistrationError {
            server: self.options.server.clone(),
            node_name: self.options.node_name.clone(),
            source,
        };

        let conn = self.connection().await.map_err(registration_error)?;
        conn.publish(
            &self.options.info_topic(),
            self.info_document(),
            QoS::AtLeastOnce,
            true,
        )
        .await
        .map_err(registration_error)?;

        let address = self
            .options
            .local
            .clone()
            .unwrap_or_else(|| self.options.server.clone());
        info!(
            "Registered node '{}' at {} (data address {})",
            self.options.node_name, self.options.server, address
        );
        Ok(address)
    }

    async fn set_node_status(&self, count: u64, status: &str) -> Result<(), RemoteError> {
        let conn = self.connection().await?;
        conn.publish(
            &self.options.status_topic(),
            status_document(count, status, true),
            QoS::AtMostOnce,
            true,
        )
        .await
    }

    async fn unregister(&self) -> Result<(), RemoteError> {
        let conn = match self.connection.lock().await.take() {
            Some(conn) if conn.status() == RemoteLinkStatus::Connected => conn,
            _ => MqttConnection::connect(&self.options.server, &self.client_options()).await?,
        };

        // Empty retained payloads clear the topics
        let result = async {
            conn.publish(&self.options.status_topic(), Bytes::new(), QoS::AtLeastOnce, true)
                .await?;
            conn.publish(&self.options.info_topic(), Bytes::new(), QoS::AtLeastOnce, true)
                .await
        }
        .await;

        conn.disconnect().await;
        if result.is_ok() {
            info!(
                "Unregistered node '{}' from {}",
                self.options.node_name, self.options.server
            );
        }
        result
    }
}
