//! Messages and their transport-level envelope.
//!
//! A `Message` is a tagged JSON record: an object carrying a string `type`
//! discriminator beside opaque payload fields. An `Envelope` wraps a message
//! for transmission with identity, headers, timestamp, and an optional
//! partition key. The envelope's `type` always mirrors the payload's.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Message type reserved for saga-level timeout expiry notifications.
///
/// Emitted by the runtime; user code must never publish it.
pub const SAGA_TIMEOUT_EXPIRED: &str = "SagaTimeoutExpired";

/// Result type for envelope operations.
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Errors from message/envelope construction and decoding.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("message payload must be a JSON object")]
    NotAnObject,

    #[error("message payload is missing a string 'type' discriminator")]
    MissingType,

    #[error("envelope type '{envelope}' does not match payload type '{payload}'")]
    TypeMismatch { envelope: String, payload: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A tagged message record.
///
/// The inner value is guaranteed to be a JSON object containing a string
/// `type` field. All other fields are opaque domain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Message {
    payload: Value,
}

impl Message {
    /// Build a message from a discriminator and payload fields.
    ///
    /// `fields` must be a JSON object (or `null` for an empty payload).
    /// A `type` field inside `fields` is overwritten by `message_type`.
    pub fn new(message_type: impl Into<String>, fields: Value) -> Result<Self> {
        let mut map = match fields {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            _ => return Err(EnvelopeError::NotAnObject),
        };
        map.insert("type".to_string(), Value::String(message_type.into()));
        Ok(Self {
            payload: Value::Object(map),
        })
    }

    /// Wrap an already-tagged JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Object(map) => match map.get("type") {
                Some(Value::String(_)) => Ok(Self { payload: value }),
                _ => Err(EnvelopeError::MissingType),
            },
            _ => Err(EnvelopeError::NotAnObject),
        }
    }

    /// The `type` discriminator.
    pub fn message_type(&self) -> &str {
        self.payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The full tagged payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Look up a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Look up a string payload field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Look up an integer payload field.
    pub fn field_u64(&self, name: &str) -> Option<u64> {
        self.field(name).and_then(Value::as_u64)
    }
}

impl TryFrom<Value> for Message {
    type Error = EnvelopeError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Value {
        message.payload
    }
}

/// Transport-level wrapper around a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Globally unique message identifier, for dedupe and logging.
    pub id: Uuid,
    /// The tagged message record.
    pub message: Message,
    /// String headers, propagated verbatim by transports.
    pub headers: HashMap<String, String>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Optional ordering hint for partitioned transports.
    pub partition_key: Option<String>,
}

impl Envelope {
    /// Wrap a message with a fresh id and the current timestamp.
    pub fn new(message: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            headers: HashMap::new(),
            timestamp: Utc::now(),
            partition_key: None,
        }
    }

    /// Attach a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Replace all headers.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Set the partition key.
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// The message's `type` discriminator.
    pub fn message_type(&self) -> &str {
        self.message.message_type()
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&Wire::from(self))?)
    }

    /// Decode from the JSON wire form, validating the type mirror.
    pub fn decode(raw: &str) -> Result<Self> {
        let wire: Wire = serde_json::from_str(raw)?;
        wire.try_into()
    }
}

/// JSON wire representation: `{ id, type, payload, headers, timestamp,
/// partitionKey? }` with an RFC-3339 UTC timestamp.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Wire {
    id: Uuid,
    #[serde(rename = "type")]
    message_type: String,
    payload: Value,
    headers: HashMap<String, String>,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_key: Option<String>,
}

impl From<&Envelope> for Wire {
    fn from(envelope: &Envelope) -> Self {
        Self {
            id: envelope.id,
            message_type: envelope.message_type().to_string(),
            payload: envelope.message.payload().clone(),
            headers: envelope.headers.clone(),
            timestamp: envelope.timestamp,
            partition_key: envelope.partition_key.clone(),
        }
    }
}

impl TryFrom<Wire> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: Wire) -> Result<Self> {
        let message = Message::from_value(wire.payload)?;
        if message.message_type() != wire.message_type {
            return Err(EnvelopeError::TypeMismatch {
                envelope: wire.message_type,
                payload: message.message_type().to_string(),
            });
        }
        Ok(Self {
            id: wire.id,
            message,
            headers: wire.headers,
            timestamp: wire.timestamp,
            partition_key: wire.partition_key,
        })
    }
}
