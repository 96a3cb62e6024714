//! Codec errors

use std::fmt;

/// Why a byte sequence is not a valid packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Ran out of bytes; at frame level this only means "wait for more"
    InsufficientData,
    InvalidPacketType(u8),
    /// More than four remaining-length bytes
    InvalidRemainingLength,
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    /// Reserved or inconsistent flag bits
    InvalidFlags,
    InvalidReturnCode(u8),
    MalformedPacket(&'static str),
    /// Exceeds the decoder's configured limit
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (what, value) = match self {
            Self::InsufficientData => ("truncated input", None),
            Self::InvalidPacketType(t) => ("unsupported packet type", Some(*t)),
            Self::InvalidRemainingLength => ("remaining length longer than 4 bytes", None),
            Self::InvalidProtocolName => ("protocol name is not MQTT", None),
            Self::InvalidProtocolVersion(v) => ("unsupported protocol level", Some(*v)),
            Self::InvalidQoS(q) => ("QoS out of range", Some(*q)),
            Self::InvalidUtf8 => ("string is not UTF-8", None),
            Self::InvalidFlags => ("reserved flag bits set", None),
            Self::InvalidReturnCode(r) => ("unknown return code", Some(*r)),
            Self::MalformedPacket(msg) => return write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => ("packet exceeds size limit", None),
        };
        match value {
            Some(v) => write!(f, "{} ({})", what, v),
            None => f.write_str(what),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Why a packet could not be serialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    PacketTooLarge,
    /// String or binary field above 65535 bytes
    StringTooLong,
    /// Empty or wildcard PUBLISH topic
    InvalidTopicName,
    /// SUBSCRIBE without filters
    InvalidTopicFilter,
    MissingPacketId,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PacketTooLarge => "packet exceeds maximum remaining length",
            Self::StringTooLong => "field longer than 65535 bytes",
            Self::InvalidTopicName => "topic name empty or contains wildcards",
            Self::InvalidTopicFilter => "no topic filter given",
            Self::MissingPacketId => "QoS 1 or 2 publish without packet id",
        })
    }
}

impl std::error::Error for EncodeError {}
