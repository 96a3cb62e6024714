//! MQTT Connection
//!
//! Connects to a broker, completes the CONNECT/CONNACK handshake, then
//! hands the socket to a spawned task. The task multiplexes commands from
//! [`MqttConnection`] handles, inbound packets and the keepalive timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::ClientOptions;
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    Connect, EncodeError, Packet, PubAck, Publish, QoS, SubAckReturnCode, Subscribe,
    Subscription,
};
use crate::remote::{RemoteError, RemoteLinkStatus};
use crate::topic::{topic_matches_filter, validate_topic_filter, validate_topic_name};

/// Operation sent to the connection task
#[derive(Debug)]
enum Command {
    /// Publish a message; `ack` resolves on write (QoS 0) or PUBACK (QoS 1)
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        ack: oneshot::Sender<Result<(), RemoteError>>,
    },
    /// Subscribe; matching payloads go to `sink`, `ended` resolves when the
    /// stream stops
    Subscribe {
        filter: String,
        qos: QoS,
        sink: mpsc::Sender<Bytes>,
        ended: oneshot::Sender<Result<(), RemoteError>>,
    },
    /// Send DISCONNECT and close the socket
    Disconnect,
}

/// Handle to a live MQTT connection
///
/// Cheap to clone. The connection closes when the broker goes away, on
/// [`disconnect`](Self::disconnect), or once every handle is dropped.
#[derive(Clone)]
pub struct MqttConnection {
    address: Arc<str>,
    client_id: Arc<str>,
    command_tx: mpsc::Sender<Command>,
    status: Arc<RwLock<RemoteLinkStatus>>,
    ack_timeout: Duration,
}

impl MqttConnection {
    /// Connect to `address` and spawn the connection task
    pub async fn connect(address: &str, options: &ClientOptions) -> Result<Self, RemoteError> {
        debug!("MQTT '{}': Connecting to {}", options.client_id, address);

        let stream = timeout(options.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| RemoteError::Timeout)??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut io = PacketIo::new(read_half, write_half);

        let connect = Packet::Connect(Box::new(Connect {
            client_id: options.client_id.clone(),
            clean_session: options.clean_session,
            keep_alive: options.keepalive,
            username: options.username.clone(),
            password: options.password.as_ref().map(|p| Bytes::from(p.clone())),
            will: options.will.clone(),
        }));
        io.write_packet(&connect).await?;

        let packet = timeout(options.connect_timeout, io.read_packet())
            .await
            .map_err(|_| RemoteError::Timeout)??;

        match packet {
            Packet::ConnAck(connack) if connack.return_code.is_accepted() => {
                info!(
                    "MQTT '{}': Connected to {} (session_present={})",
                    options.client_id, address, connack.session_present
                );
            }
            Packet::ConnAck(connack) => {
                return Err(RemoteError::Rejected(format!(
                    "CONNACK failed: {}",
                    connack.return_code
                )));
            }
            other => {
                return Err(RemoteError::Other(format!(
                    "Expected CONNACK, got {:?}",
                    other.packet_type()
                )));
            }
        }

        let (command_tx, command_rx) = mpsc::channel(options.command_capacity);
        let status = Arc::new(RwLock::new(RemoteLinkStatus::Connected));

        let task = ConnectionTask {
            client_id: options.client_id.clone(),
            io,
            command_rx,
            keepalive: options.keepalive,
            awaiting_pingresp: false,
            next_packet_id: 0,
            pending_acks: HashMap::new(),
            subscriptions: Vec::new(),
        };
        tokio::spawn(task.run_to_completion(status.clone()));

        Ok(Self {
            address: Arc::from(address),
            client_id: Arc::from(options.client_id.as_str()),
            command_tx,
            status,
            ack_timeout: options.ack_timeout,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn status(&self) -> RemoteLinkStatus {
        *self.status.read()
    }

    /// Publish a message and wait for it to be written (QoS 0) or
    /// acknowledged (QoS 1). QoS 2 is downgraded to QoS 1.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RemoteError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Publish {
                topic: topic.to_string(),
                payload,
                qos: qos.min(QoS::AtLeastOnce),
                retain,
                ack: ack_tx,
            })
            .await
            .map_err(|_| command_channel_closed())?;

        match timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(command_channel_closed()),
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    /// Subscribe to `filter` and forward every matching payload to `sink`.
    ///
    /// Resolves when the subscription stream ends: `Ok(())` when the
    /// connection is closed cleanly or `sink` is dropped, `Err` when the
    /// broker refuses the subscription or the connection fails.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        sink: mpsc::Sender<Bytes>,
    ) -> Result<(), RemoteError> {
        let (ended_tx, ended_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Subscribe {
                filter: filter.to_string(),
                qos: qos.min(QoS::AtLeastOnce),
                sink,
                ended: ended_tx,
            })
            .await
            .map_err(|_| command_channel_closed())?;

        ended_rx
            .await
            .unwrap_or_else(|_| Err(command_channel_closed()))
    }

    /// Send DISCONNECT and close the connection
    pub async fn disconnect(&self) {
        let _ = self.command_tx.send(Command::Disconnect).await;
    }
}

fn command_channel_closed() -> RemoteError {
    RemoteError::ConnectionLost("Connection task closed".to_string())
}

fn packet_ids_exhausted() -> RemoteError {
    RemoteError::Other("No free packet id, too many unacknowledged publishes".to_string())
}

type AckSender = oneshot::Sender<Result<(), RemoteError>>;

/// Advance `last` to the next id not awaiting a PUBACK.
///
/// Entries whose publisher stopped waiting (ack timeout) are dropped
/// first; `None` only when every id is still awaited.
fn allocate_packet_id(last: &mut u16, pending: &mut HashMap<u16, AckSender>) -> Option<u16> {
    pending.retain(|_, ack| !ack.is_closed());
    for _ in 0..=u16::MAX {
        *last = last.wrapping_add(1);
        if *last != 0 && !pending.contains_key(last) {
            return Some(*last);
        }
    }
    None
}

/// Framed packet reader/writer over a split TCP stream
struct PacketIo {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    decoder: Decoder,
    encoder: Encoder,
}

impl PacketIo {
    fn new(reader: OwnedReadHalf, writer: OwnedWriteHalf) -> Self {
        Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(1024),
            decoder: Decoder::new().with_max_packet_size(DEFAULT_MAX_PACKET_SIZE),
            encoder: Encoder::new(),
        }
    }

    /// Read the next complete packet. Cancel safe: bytes already read stay
    /// buffered for the next call.
    async fn read_packet(&mut self) -> Result<Packet, RemoteError> {
        loop {
            if let Some((packet, consumed)) = self
                .decoder
                .decode(&self.read_buf)
                .map_err(|e| RemoteError::Other(format!("Decode error: {}", e)))?
            {
                self.read_buf.advance(consumed);
                return Ok(packet);
            }

            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(RemoteError::ConnectionLost("Connection closed".to_string()));
            }
        }
    }

    fn encode(&mut self, packet: &Packet) -> Result<(), EncodeError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)
    }

    async fn flush(&mut self) -> Result<(), RemoteError> {
        self.writer.write_all(&self.write_buf).await?;
        Ok(())
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), RemoteError> {
        self.encode(packet)
            .map_err(|e| RemoteError::Other(format!("Encode error: {}", e)))?;
        self.flush().await
    }
}

struct SubscriptionEntry {
    filter: String,
    packet_id: u16,
    sink: mpsc::Sender<Bytes>,
    ended: oneshot::Sender<Result<(), RemoteError>>,
}

struct ConnectionTask {
    client_id: String,
    io: PacketIo,
    command_rx: mpsc::Receiver<Command>,
    keepalive: u16,
    awaiting_pingresp: bool,
    next_packet_id: u16,
    /// QoS 1 publishes waiting for PUBACK
    pending_acks: HashMap<u16, AckSender>,
    subscriptions: Vec<SubscriptionEntry>,
}

impl ConnectionTask {
    async fn run_to_completion(mut self, status: Arc<RwLock<RemoteLinkStatus>>) {
        let result = self.run().await;
        *status.write() = RemoteLinkStatus::Disconnected;

        match &result {
            Ok(()) => info!("MQTT '{}': Disconnected", self.client_id),
            Err(e) => warn!("MQTT '{}': Connection ended: {}", self.client_id, e),
        }

        for (_, ack) in self.pending_acks.drain() {
            let _ = ack.send(Err(RemoteError::ConnectionLost(
                "Connection closed before PUBACK".to_string(),
            )));
        }
        for sub in self.subscriptions.drain(..) {
            let _ = sub.ended.send(result.clone());
        }
    }

    async fn run(&mut self) -> Result<(), RemoteError> {
        let keepalive_enabled = self.keepalive > 0;
        let period = Duration::from_secs(u64::from(self.keepalive.max(1)));
        let mut keepalive_timer = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await? {
                                return Ok(());
                            }
                        }
                        None => {
                            // Every handle dropped
                            let _ = self.io.write_packet(&Packet::Disconnect).await;
                            return Ok(());
                        }
                    }
                }

                packet = self.io.read_packet() => {
                    self.handle_packet(packet?).await?;
                }

                _ = keepalive_timer.tick(), if keepalive_enabled => {
                    if self.awaiting_pingresp {
                        return Err(RemoteError::ConnectionLost("Keepalive timeout".to_string()));
                    }
                    self.io.write_packet(&Packet::PingReq).await?;
                    self.awaiting_pingresp = true;
                }
            }
        }
    }

    fn next_packet_id(&mut self) -> Option<u16> {
        allocate_packet_id(&mut self.next_packet_id, &mut self.pending_acks)
    }

    /// Returns `Ok(true)` when the connection should close cleanly
    async fn handle_command(&mut self, cmd: Command) -> Result<bool, RemoteError> {
        match cmd {
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                ack,
            } => {
                if let Err(reason) = validate_topic_name(&topic) {
                    let _ = ack.send(Err(RemoteError::InvalidConfig(reason.to_string())));
                    return Ok(false);
                }

                let packet_id = match qos {
                    QoS::AtMostOnce => None,
                    _ => match self.next_packet_id() {
                        Some(id) => Some(id),
                        None => {
                            let _ = ack.send(Err(packet_ids_exhausted()));
                            return Ok(false);
                        }
                    },
                };
                let publish = Packet::Publish(Publish {
                    dup: false,
                    qos,
                    retain,
                    topic,
                    packet_id,
                    payload,
                });

                if let Err(e) = self.io.encode(&publish) {
                    let _ = ack.send(Err(RemoteError::Other(format!("Encode error: {}", e))));
                    return Ok(false);
                }
                if let Err(e) = self.io.flush().await {
                    let _ = ack.send(Err(e.clone()));
                    return Err(e);
                }

                match packet_id {
                    Some(id) => {
                        self.pending_acks.insert(id, ack);
                    }
                    None => {
                        let _ = ack.send(Ok(()));
                    }
                }
            }
            Command::Subscribe {
                filter,
                qos,
                sink,
                ended,
            } => {
                if let Err(reason) = validate_topic_filter(&filter) {
                    let _ = ended.send(Err(RemoteError::InvalidConfig(reason.to_string())));
                    return Ok(false);
                }

                let Some(packet_id) = self.next_packet_id() else {
                    let _ = ended.send(Err(packet_ids_exhausted()));
                    return Ok(false);
                };
                let subscribe = Packet::Subscribe(Subscribe {
                    packet_id,
                    subscriptions: vec![Subscription {
                        filter: filter.clone(),
                        qos,
                    }],
                });
                self.io.write_packet(&subscribe).await?;

                debug!(
                    "MQTT '{}': SUBSCRIBE {} (qos={}, id={})",
                    self.client_id, filter, qos, packet_id
                );
                self.subscriptions.push(SubscriptionEntry {
                    filter,
                    packet_id,
                    sink,
                    ended,
                });
            }
            Command::Disconnect => {
                self.io.write_packet(&Packet::Disconnect).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), RemoteError> {
        match packet {
            Packet::Publish(publish) => {
                match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => {
                        self.io
                            .write_packet(&Packet::PubAck(PubAck { packet_id }))
                            .await?;
                    }
                    (QoS::ExactlyOnce, _) => {
                        warn!(
                            "MQTT '{}': Dropping QoS 2 PUBLISH on {}",
                            self.client_id, publish.topic
                        );
                        return Ok(());
                    }
                    _ => {}
                }
                self.route(&publish.topic, publish.payload).await;
            }
            Packet::PubAck(puback) => {
                if let Some(ack) = self.pending_acks.remove(&puback.packet_id) {
                    let _ = ack.send(Ok(()));
                }
            }
            Packet::SubAck(suback) => {
                let refused = suback.return_codes.contains(&SubAckReturnCode::Failure);
                if let Some(pos) = self
                    .subscriptions
                    .iter()
                    .position(|s| s.packet_id == suback.packet_id)
                {
                    if refused {
                        let sub = self.subscriptions.swap_remove(pos);
                        warn!(
                            "MQTT '{}': Subscription to {} refused",
                            self.client_id, sub.filter
                        );
                        let _ = sub.ended.send(Err(RemoteError::Rejected(format!(
                            "SUBACK failure for {}",
                            sub.filter
                        ))));
                    } else {
                        debug!("MQTT '{}': SUBACK received", self.client_id);
                    }
                }
            }
            Packet::PingResp => {
                self.awaiting_pingresp = false;
            }
            Packet::Disconnect => {
                return Err(RemoteError::ConnectionLost(
                    "Remote disconnected".to_string(),
                ));
            }
            other => {
                debug!(
                    "MQTT '{}': Ignoring unexpected {:?}",
                    self.client_id,
                    other.packet_type()
                );
            }
        }
        Ok(())
    }

    /// Deliver an inbound payload to every matching subscription
    async fn route(&mut self, topic: &str, payload: Bytes) {
        let mut i = 0;
        while i < self.subscriptions.len() {
            let sub = &self.subscriptions[i];
            if sub.ended.is_closed() {
                // Subscriber stopped waiting
                self.subscriptions.swap_remove(i);
                continue;
            }
            if topic_matches_filter(topic, &sub.filter)
                && sub.sink.send(payload.clone()).await.is_err()
            {
                let sub = self.subscriptions.swap_remove(i);
                let _ = sub.ended.send(Ok(()));
                continue;
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_id_skips_zero_and_pending() {
        let (ack, _rx) = oneshot::channel();
        let mut pending = HashMap::from([(1, ack)]);
        let mut last = u16::MAX;

        assert_eq!(allocate_packet_id(&mut last, &mut pending), Some(2));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_packet_id_reclaims_abandoned_acks() {
        // Every id taken by a publisher that already timed out
        let mut pending: HashMap<u16, AckSender> = (1..=u16::MAX)
            .map(|id| {
                let (ack, rx) = oneshot::channel();
                drop(rx);
                (id, ack)
            })
            .collect();
        let mut last = 0;

        assert_eq!(allocate_packet_id(&mut last, &mut pending), Some(1));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_packet_id_exhausted_when_all_awaited() {
        let mut receivers = Vec::new();
        let mut pending: HashMap<u16, AckSender> = (1..=u16::MAX)
            .map(|id| {
                let (ack, rx) = oneshot::channel();
                receivers.push(rx);
                (id, ack)
            })
            .collect();
        let mut last = 7;

        assert_eq!(allocate_packet_id(&mut last, &mut pending), None);
        assert_eq!(pending.len(), usize::from(u16::MAX));
    }
}
