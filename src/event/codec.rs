//! JSON wire encoding for [`Record`]

use std::fmt;

use bytes::Bytes;

use super::Record;

/// Inbound payload could not be decoded into a [`Record`]
#[derive(Debug)]
pub struct DecodeError(serde_json::Error);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record decode error: {}", self.0)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// A [`Record`] could not be serialized
#[derive(Debug)]
pub struct EncodeError(serde_json::Error);

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record encode error: {}", self.0)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Decode a wire payload into a [`Record`]
pub fn decode(payload: &[u8]) -> Result<Record, DecodeError> {
    serde_json::from_slice(payload).map_err(DecodeError)
}

/// Encode a [`Record`] for the destination broker
pub fn encode(record: &Record) -> Result<Bytes, EncodeError> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(EncodeError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SubEvent;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_decode_keeps_metadata_and_fields() {
        let payload = br#"{
            "device_id": "gate-7",
            "ts": 1700000000,
            "data": [
                {"typ": "counter", "id": "line-1", "dir": "in", "count": 3},
                {"typ": "fillLevel", "fill": 42}
            ]
        }"#;

        let record = decode(payload).unwrap();
        assert_eq!(record.device_id, "gate-7");
        assert_eq!(record.metadata.get("ts"), Some(&json!(1700000000)));
        assert_eq!(record.data.len(), 2);
        assert_eq!(record.data[0].typ, "counter");
        assert_eq!(record.data[0].fields.get("count"), Some(&json!(3)));
        assert_eq!(record.data[1].fields.get("fill"), Some(&json!(42)));
    }

    #[test]
    fn test_missing_data_decodes_as_empty() {
        let record = decode(br#"{"device_id": "d"}"#).unwrap();
        assert!(record.data.is_empty());
    }

    #[test]
    fn test_encode_then_decode_preserves_record() {
        let mut record = Record::new(
            "d-1",
            vec![SubEvent::new("dwellTime").with_field("dwell", 12.5)],
        );
        record.metadata.insert("seq".to_string(), json!(9));

        let bytes = encode(&record).unwrap();
        assert_eq!(decode(&bytes).unwrap(), record);
    }

    #[test_case(b"" ; "empty payload")]
    #[test_case(b"not json" ; "garbage")]
    #[test_case(br#"[1, 2]"# ; "array root")]
    #[test_case(br#"{"data": []}"# ; "missing device id")]
    #[test_case(br#"{"device_id": 5}"# ; "numeric device id")]
    #[test_case(br#"{"device_id": "d", "data": {}}"# ; "object data")]
    #[test_case(br#"{"device_id": "d", "data": [{"fill": 1}]}"# ; "sub event without typ")]
    fn test_malformed_payload_is_rejected(payload: &[u8]) {
        assert!(decode(payload).is_err());
    }
}
