//! MQTT Packet Decoder

use bytes::Bytes;

use super::{read_variable_int, Reader, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, PubAck, Publish, QoS,
    SubAck, SubAckReturnCode, Subscribe, Subscription, Will, PROTOCOL_LEVEL,
};

/// Frames and parses MQTT v3.1.1 packets
#[derive(Debug, Clone)]
pub struct Decoder {
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    /// Reject packets whose remaining length exceeds `size`
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode the first packet in `buf`.
    ///
    /// `Ok(None)` means the packet is not complete yet; otherwise returns
    /// the packet and the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some((&header, rest)) = buf.split_first() else {
            return Ok(None);
        };

        let (body_len, len_bytes) = match read_variable_int(rest) {
            Ok(decoded) => decoded,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body_len = body_len as usize;
        if body_len > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let frame_len = 1 + len_bytes + body_len;
        let Some(body) = buf.get(1 + len_bytes..frame_len) else {
            return Ok(None);
        };

        let type_bits = header >> 4;
        let flags = header & 0x0F;
        let packet_type =
            PacketType::from_u8(type_bits).ok_or(DecodeError::InvalidPacketType(type_bits))?;

        // PUBLISH carries its own flags, SUBSCRIBE has them fixed at 0010
        let expected_flags = match packet_type {
            PacketType::Publish => flags,
            PacketType::Subscribe => 0x02,
            _ => 0,
        };
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }

        let mut reader = Reader::new(body);
        let packet = decode_body(packet_type, flags, &mut reader).map_err(|e| match e {
            DecodeError::InsufficientData => DecodeError::MalformedPacket("packet body truncated"),
            e => e,
        })?;

        if !reader.is_empty() {
            return Err(DecodeError::MalformedPacket("unexpected trailing bytes"));
        }

        Ok(Some((packet, frame_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_body(
    packet_type: PacketType,
    flags: u8,
    r: &mut Reader<'_>,
) -> Result<Packet, DecodeError> {
    Ok(match packet_type {
        PacketType::Connect => decode_connect(r)?,
        PacketType::ConnAck => decode_connack(r)?,
        PacketType::Publish => decode_publish(flags, r)?,
        PacketType::PubAck => Packet::PubAck(PubAck {
            packet_id: r.u16()?,
        }),
        PacketType::Subscribe => decode_subscribe(r)?,
        PacketType::SubAck => decode_suback(r)?,
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    })
}

fn decode_connect(r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    if r.string()? != "MQTT" {
        return Err(DecodeError::InvalidProtocolName);
    }
    let level = r.u8()?;
    if level != PROTOCOL_LEVEL {
        return Err(DecodeError::InvalidProtocolVersion(level));
    }

    let flags = r.u8()?;
    let keep_alive = r.u16()?;

    if flags & 0x01 != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let has_will = flags & 0x04 != 0;
    let will_qos_bits = (flags >> 3) & 0x03;
    let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;
    let will_retain = flags & 0x20 != 0;
    if !has_will && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    let client_id = r.string()?.to_string();

    let will = if has_will {
        Some(Will {
            topic: r.string()?.to_string(),
            payload: Bytes::copy_from_slice(r.binary()?),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if flags & 0x80 != 0 {
        Some(r.string()?.to_string())
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(Bytes::copy_from_slice(r.binary()?))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        client_id,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let ack_flags = r.u8()?;
    if ack_flags & 0xFE != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let code = r.u8()?;
    let return_code = ConnectReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let qos_bits = (flags >> 1) & 0x03;
    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
    let dup = flags & 0x08 != 0;
    if dup && qos == QoS::AtMostOnce {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let topic = r.string()?;
    if topic.contains(['+', '#']) {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }

    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => match r.u16()? {
            0 => return Err(DecodeError::MalformedPacket("packet id cannot be 0")),
            id => Some(id),
        },
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain: flags & 0x01 != 0,
        topic: topic.to_string(),
        packet_id,
        payload: Bytes::copy_from_slice(r.rest()),
    }))
}

fn decode_subscribe(r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let packet_id = r.u16()?;

    let mut subscriptions = Vec::new();
    while !r.is_empty() {
        let filter = r.string()?.to_string();
        let options = r.u8()?;
        if options & 0xFC != 0 {
            return Err(DecodeError::MalformedPacket("reserved subscription bits set"));
        }
        let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;
        subscriptions.push(Subscription { filter, qos });
    }

    if subscriptions.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBSCRIBE without filters"));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let packet_id = r.u16()?;
    let return_codes = r
        .rest()
        .iter()
        .map(|&b| SubAckReturnCode::from_u8(b).ok_or(DecodeError::InvalidReturnCode(b)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}
