//! MQTT Packet Encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    Connect, EncodeError, Packet, Publish, QoS, Subscribe, PROTOCOL_LEVEL,
};

/// Serializes MQTT v3.1.1 packets.
///
/// Each body is written to a scratch buffer first so the remaining-length
/// prefix always agrees with what was actually written.
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Append `packet` to `buf`. Nothing is appended on error.
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        let header = match packet {
            Packet::Connect(p) => {
                connect_body(p, &mut body)?;
                0x10
            }
            Packet::ConnAck(p) => {
                body.put_u8(u8::from(p.session_present));
                body.put_u8(p.return_code as u8);
                0x20
            }
            Packet::Publish(p) => publish_body(p, &mut body)?,
            Packet::PubAck(p) => {
                body.put_u16(p.packet_id);
                0x40
            }
            Packet::Subscribe(p) => {
                subscribe_body(p, &mut body)?;
                0x82
            }
            Packet::SubAck(p) => {
                body.put_u16(p.packet_id);
                body.extend(p.return_codes.iter().map(|code| code.to_u8()));
                0x90
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        };

        let body_len = u32::try_from(body.len()).map_err(|_| EncodeError::PacketTooLarge)?;
        let mut frame = BytesMut::with_capacity(body.len() + 5);
        frame.put_u8(header);
        write_variable_int(&mut frame, body_len)?;
        frame.extend_from_slice(&body);

        buf.extend_from_slice(&frame);
        Ok(())
    }
}

fn connect_body(p: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
    let mut flags = 0u8;
    if p.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &p.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if p.password.is_some() {
        flags |= 0x40;
    }
    if p.username.is_some() {
        flags |= 0x80;
    }

    write_string(body, "MQTT")?;
    body.put_u8(PROTOCOL_LEVEL);
    body.put_u8(flags);
    body.put_u16(p.keep_alive);
    write_string(body, &p.client_id)?;

    if let Some(will) = &p.will {
        write_string(body, &will.topic)?;
        write_binary(body, &will.payload)?;
    }
    if let Some(username) = &p.username {
        write_string(body, username)?;
    }
    if let Some(password) = &p.password {
        write_binary(body, password)?;
    }
    Ok(())
}

/// Writes the PUBLISH body and returns its fixed header byte
fn publish_body(p: &Publish, body: &mut BytesMut) -> Result<u8, EncodeError> {
    if p.topic.is_empty() || p.topic.contains(['+', '#']) {
        return Err(EncodeError::InvalidTopicName);
    }

    write_string(body, &p.topic)?;
    match (p.qos, p.packet_id) {
        (QoS::AtMostOnce, _) => {}
        (_, Some(id)) => body.put_u16(id),
        (_, None) => return Err(EncodeError::MissingPacketId),
    }
    body.extend_from_slice(&p.payload);

    let mut header = 0x30 | ((p.qos as u8) << 1);
    if p.dup {
        header |= 0x08;
    }
    if p.retain {
        header |= 0x01;
    }
    Ok(header)
}

fn subscribe_body(p: &Subscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
    if p.subscriptions.is_empty() {
        return Err(EncodeError::InvalidTopicFilter);
    }
    body.put_u16(p.packet_id);
    for sub in &p.subscriptions {
        write_string(body, &sub.filter)?;
        body.put_u8(sub.qos as u8);
    }
    Ok(())
}
