use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Messages whose encoded form exceeds this many bytes raise the `large_payload` alert
pub const LARGE_PAYLOAD_BYTES: usize = 10_000;

/// Number of characters of a message kept in an [`AlertRecord`]
const SNIPPET_LENGTH: usize = 100;

/// Named predicate over a relayed message
#[derive(Clone, Copy)]
pub struct AlertThreshold {
    /// Name reported when the predicate matches
    pub name: &'static str,
    predicate: fn(&Value, usize) -> bool,
}

impl AlertThreshold {
    /// Creates a threshold from a predicate receiving the message and its encoded length
    pub fn new(name: &'static str, predicate: fn(&Value, usize) -> bool) -> Self {
        Self { name, predicate }
    }

    /// Evaluates the threshold
    pub fn matches(&self, message: &Value, encoded_len: usize) -> bool {
        (self.predicate)(message, encoded_len)
    }

    /// Thresholds evaluated by default
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("high_priority", |message, _| {
                message
                    .get("data")
                    .and_then(|data| data.get("priority"))
                    .and_then(Value::as_str)
                    == Some("high")
            }),
            Self::new("error_message", |message, _| {
                message
                    .get("data")
                    .map(|data| data.to_string().to_lowercase().contains("error"))
                    .unwrap_or(false)
            }),
            Self::new("large_payload", |_, encoded_len| {
                encoded_len > LARGE_PAYLOAD_BYTES
            }),
        ]
    }
}

/// Entry of the alert history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertRecord {
    /// Name of the threshold which matched
    pub alert_name: String,
    /// Identifier of the message, `unknown` if it does not carry one
    pub message_id: String,
    /// Moment the alert has been raised
    pub timestamp: DateTime<Utc>,
    /// Beginning of the serialized message
    pub message_snippet: String,
}

impl AlertRecord {
    /// Records that a threshold matched for the given message
    pub fn new(alert_name: &str, message: &Value) -> Self {
        Self {
            alert_name: alert_name.to_owned(),
            message_id: message_id(message),
            timestamp: Utc::now(),
            message_snippet: snippet(message),
        }
    }
}

/// Identifier of a relayed message
pub fn message_id(message: &Value) -> String {
    message
        .get("message_id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned()
}

fn snippet(message: &Value) -> String {
    let text = message.to_string();

    if text.chars().count() > SNIPPET_LENGTH {
        let mut snippet: String = text.chars().take(SNIPPET_LENGTH).collect();
        snippet.push_str("...");
        snippet
    } else {
        text
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn triggered(message: &Value) -> Vec<&'static str> {
        let encoded_len = message.to_string().len();

        AlertThreshold::defaults()
            .iter()
            .filter(|threshold| threshold.matches(message, encoded_len))
            .map(|threshold| threshold.name)
            .collect()
    }

    #[test]
    fn flag_high_priority() {
        let message = json!({ "data": { "priority": "high" } });
        assert_eq!(triggered(&message), vec!["high_priority"]);
    }

    #[test]
    fn ignore_other_priorities() {
        let message = json!({ "data": { "priority": "HIGH" } });
        assert!(triggered(&message).is_empty());
    }

    #[test]
    fn flag_errors_case_insensitively() {
        let message = json!({ "data": { "status": "Upstream ERROR" } });
        assert_eq!(triggered(&message), vec!["error_message"]);
    }

    #[test]
    fn search_keys_for_errors() {
        let message = json!({ "data": { "error_code": 12 } });
        assert_eq!(triggered(&message), vec!["error_message"]);
    }

    #[test]
    fn flag_large_payloads() {
        let message = json!({ "data": { "blob": "x".repeat(LARGE_PAYLOAD_BYTES) } });
        assert_eq!(triggered(&message), vec!["large_payload"]);
    }

    #[test]
    fn combine_alerts() {
        let message = json!({ "data": { "priority": "high", "kind": "error" } });
        assert_eq!(triggered(&message), vec!["high_priority", "error_message"]);
    }

    #[test]
    fn truncate_snippets() {
        let message = json!({ "message_id": "m-1", "data": { "text": "y".repeat(200) } });
        let record = AlertRecord::new("large_payload", &message);

        assert_eq!(record.message_id, "m-1");
        assert_eq!(record.message_snippet.chars().count(), SNIPPET_LENGTH + 3);
        assert!(record.message_snippet.ends_with("..."));
    }

    #[test]
    fn keep_short_snippets_intact() {
        let message = json!({ "data": {} });
        let record = AlertRecord::new("error_message", &message);

        assert_eq!(record.message_id, "unknown");
        assert_eq!(record.message_snippet, r#"{"data":{}}"#);
    }
}
