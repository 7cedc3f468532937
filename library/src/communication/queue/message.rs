use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;

/// Opaque identifier assigned to a message by the queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a new identifier from its textual representation
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Textual representation of the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credential that allows deleting exactly one delivery of a message
///
/// Every delivery attempt carries its own token. Once a message has been redelivered,
/// tokens handed out for earlier deliveries are no longer accepted by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(String);

impl AckToken {
    /// Wraps a transport specific receipt handle
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw receipt handle
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message as it is handed out by a transport, before the body has been interpreted
#[derive(Debug, Clone)]
pub struct RawQueueMessage {
    /// Identifier assigned by the queue
    pub id: MessageId,
    /// Unparsed message body
    pub body: String,
    /// Handle for this specific delivery
    pub ack_token: AckToken,
    /// Attributes assigned by the queue system
    pub attributes: HashMap<String, String>,
    /// Attributes assigned by the producer
    pub custom_attributes: HashMap<String, String>,
}

/// Message received from a queue with a structured body
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    /// Identifier assigned by the queue
    pub id: MessageId,
    /// Structured body, unparsable payloads are wrapped as `{"raw": <text>}`
    pub body: Value,
    /// Handle for this specific delivery
    pub ack_token: AckToken,
    /// Attributes assigned by the queue system
    pub attributes: HashMap<String, String>,
    /// Attributes assigned by the producer
    pub custom_attributes: HashMap<String, String>,
}

impl QueueMessage {
    /// Interprets the body of a raw message, falling back to wrapping it if it is not valid JSON
    pub fn from_raw(raw: RawQueueMessage) -> Self {
        let body = match serde_json::from_str(&raw.body) {
            Ok(body) => body,
            Err(_) => json!({ "raw": raw.body }),
        };

        Self {
            id: raw.id,
            body,
            ack_token: raw.ack_token,
            attributes: raw.attributes,
            custom_attributes: raw.custom_attributes,
        }
    }
}
