use chrono::{DateTime, Utc};
use library::communication::queue::QueueMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Record value published for every relayed queue message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedMessage {
    /// Identifier assigned by the source queue, doubles as the record key
    pub message_id: String,
    /// Tag identifying the connector which produced the record
    pub source: String,
    /// Moment the message has been transformed
    pub timestamp: DateTime<Utc>,
    /// Original message body
    pub data: Value,
    /// System attributes of the queue message, only present when forwarding is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, String>>,
    /// Producer attributes of the queue message, only present when forwarding is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_attributes: Option<HashMap<String, String>>,
}

impl EnrichedMessage {
    /// Wraps the body of a received message
    pub fn new(message: &QueueMessage, source: &str, forward_attributes: bool) -> Self {
        let (attributes, custom_attributes) = if forward_attributes {
            (
                Some(message.attributes.clone()),
                Some(message.custom_attributes.clone()),
            )
        } else {
            (None, None)
        };

        Self {
            message_id: message.id.to_string(),
            source: source.to_owned(),
            timestamp: Utc::now(),
            data: message.body.clone(),
            attributes,
            custom_attributes,
        }
    }
}
