//! People-counter event model
//!
//! A [`Record`] is one decoded event batch from a single device. Only the
//! fields the forwarder routes on are typed: the device identifier used as
//! the association key and each sub-event's category tag. Everything else
//! is carried verbatim so a reduced record re-encodes with the same
//! metadata and payload fields it arrived with.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod codec;

pub use codec::{decode, encode, DecodeError, EncodeError};

/// A decoded event batch tied to one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Association key matched against the filter patterns
    pub device_id: String,
    /// Ordered sub-events
    #[serde(default)]
    pub data: Vec<SubEvent>,
    /// Remaining top-level fields (timestamps, sequence numbers, ...)
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Record {
    pub fn new(device_id: impl Into<String>, data: Vec<SubEvent>) -> Self {
        Self {
            device_id: device_id.into(),
            data,
            metadata: Map::new(),
        }
    }

    /// Copy of this record's key and metadata with a different event list
    pub fn with_data(&self, data: Vec<SubEvent>) -> Self {
        Self {
            device_id: self.device_id.clone(),
            data,
            metadata: self.metadata.clone(),
        }
    }
}

/// One typed measurement within a [`Record`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubEvent {
    /// Category tag ("counter", "fillLevel", "dwellTime", or unrecognized)
    pub typ: String,
    /// Category-specific payload fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl SubEvent {
    pub fn new(typ: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style helper for attaching a payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}
