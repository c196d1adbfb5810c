//! Server-push envelope: `{type, data, timestamp}`.

use serde::Serialize;
use serde_json::{json, Value};

use crate::translate::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Connected,
    Heartbeat,
    NewMessage,
    Typing,
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::Heartbeat => "heartbeat",
            EventType::NewMessage => "new_message",
            EventType::Typing => "typing",
            EventType::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Value,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl PushEvent {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn connected(connection_id: &str) -> Self {
        Self::new(EventType::Connected, json!({ "connectionId": connection_id }))
    }

    pub fn heartbeat() -> Self {
        Self::new(EventType::Heartbeat, Value::Null)
    }

    pub fn typing(conversation_id: &str, user_id: &str) -> Self {
        Self::new(
            EventType::Typing,
            json!({ "conversationId": conversation_id, "userId": user_id }),
        )
    }

    pub fn new_message(payload: &NewMessagePayload) -> Self {
        let data = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self::new(EventType::NewMessage, data)
    }

    /// Sent next to a fallback rendering when the failure is a configuration
    /// fault the recipient should see, such as rejected credentials.
    pub fn translation_error(message_id: &str, kind: ErrorKind, target_language: &str) -> Self {
        Self::new(
            EventType::Error,
            json!({
                "messageId": message_id,
                "kind": kind,
                "targetLanguage": target_language,
            }),
        )
    }

    /// One `text/event-stream` frame.
    pub fn to_sse_frame(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".into());
        format!("event: {}\ndata: {}\n\n", self.event_type.as_str(), body)
    }
}

/// `new_message` body. The translation fields are omitted for untranslated
/// renderings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub id: String,
    pub conversation_id: String,
    /// What the recipient should display.
    pub content: String,
    pub original_content: String,
    pub sender_id: String,
    pub sender_name: String,
    pub timestamp: i64,
    pub original_language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    pub is_translated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Set when a translation was wanted but could not be used.
    pub translation_unavailable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation_error: Option<ErrorKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> NewMessagePayload {
        NewMessagePayload {
            id: "m1".into(),
            conversation_id: "c1".into(),
            content: "Hola".into(),
            original_content: "Hello".into(),
            sender_id: "alice".into(),
            sender_name: "Alice".into(),
            timestamp: 1_700_000_000_000,
            original_language: "en".into(),
            translated_content: Some("Hola".into()),
            target_language: Some("es".into()),
            is_translated: true,
            confidence: Some(0.85),
            translation_unavailable: false,
            translation_error: None,
        }
    }

    #[test]
    fn envelope_uses_type_key_and_camel_case_payload() {
        let event = PushEvent::new_message(&payload());
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "new_message");
        assert_eq!(v["data"]["conversationId"], "c1");
        assert_eq!(v["data"]["translatedContent"], "Hola");
        assert_eq!(v["data"]["isTranslated"], true);
        assert!(v["data"].get("translationError").is_none());
        assert!(v["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn untranslated_payload_omits_translation_fields() {
        let mut p = payload();
        p.content = "Hello".into();
        p.translated_content = None;
        p.target_language = None;
        p.confidence = None;
        p.is_translated = false;
        let v = serde_json::to_value(&p).unwrap();
        assert!(v.get("translatedContent").is_none());
        assert!(v.get("confidence").is_none());
    }

    #[test]
    fn translation_error_event_carries_kind() {
        let event = PushEvent::translation_error("m1", ErrorKind::InvalidCredentials, "de");
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["data"]["messageId"], "m1");
        assert_eq!(v["data"]["kind"], "invalid_credentials");
        assert_eq!(v["data"]["targetLanguage"], "de");
    }

    #[test]
    fn sse_frame_format() {
        let frame = PushEvent::connected("conn-1").to_sse_frame();
        assert!(frame.starts_with("event: connected\ndata: {"));
        assert!(frame.contains("\"connectionId\":\"conn-1\""));
        assert!(frame.ends_with("\n\n"));
    }
}
