//! Message envelope types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A caller-supplied message body.
///
/// The canonical field is `textMessage`; any extra fields supplied by the
/// client are preserved so application-level payloads survive the round
/// trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessagePayload {
    /// A plain text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text_message: Some(text.into()),
            extra: Map::new(),
        }
    }
}

/// A message as delivered to clients: the caller's payload plus the
/// server-assigned `timestamp`, `author`, and (for room messages) `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredMessage {
    /// Room-scoped monotonic id. Absent for direct messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub author: String,
    /// Milliseconds since the Unix epoch, assigned by the server.
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extra_fields_round_trip() {
        let raw = json!({"textMessage": "hi", "kind": "sticker"});
        let payload: MessagePayload = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(payload.text_message.as_deref(), Some("hi"));
        assert_eq!(serde_json::to_value(&payload).unwrap(), raw);
    }

    #[test]
    fn delivered_message_carries_server_fields() {
        let msg = DeliveredMessage {
            id: Some(7),
            author: "alice".into(),
            timestamp: 1700000000000,
            payload: MessagePayload::text("hello"),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["author"], "alice");
        assert_eq!(v["textMessage"], "hello");
    }
}
