use std::collections::HashMap;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// One inbound event for a conversation.
///
/// `chat_id` is the conversation key: every piece of continuation state in the
/// core is scoped to it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Update {
    pub id: String,                       // Unique ID (UUID or transport-provided)
    pub chat_id: String,                  // Conversation the update belongs to
    pub timestamp: DateTime<Utc>,         // When it was received
    pub from: Participant,                // Sender info
    pub content: UpdateContent,           // What the user did
    #[serde(default)]
    pub metadata: HashMap<String, Value>, // Transport-specific or custom data
}

impl Update {
    pub fn new(chat_id: &str, from: Participant, content: UpdateContent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            timestamp: Utc::now(),
            from,
            content,
            metadata: HashMap::new(),
        }
    }

    pub fn text(chat_id: &str, text: &str) -> Self {
        Self::new(chat_id, Participant::anonymous(chat_id), UpdateContent::Text(text.to_string()))
    }

    pub fn callback(chat_id: &str, data: &str) -> Self {
        Self::new(chat_id, Participant::anonymous(chat_id), UpdateContent::Callback { data: data.to_string() })
    }

    /// The text body, if this update carries one.
    pub fn text_body(&self) -> Option<&str> {
        match &self.content {
            UpdateContent::Text(text) => Some(text),
            UpdateContent::Command { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn callback_data(&self) -> Option<&str> {
        match &self.content {
            UpdateContent::Callback { data } => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct Participant {
    pub id: String,                          // Internal or platform-specific ID
    pub display_name: Option<String>,        // Optional for anonymous senders
    pub language: Option<String>,            // IETF tag reported by the transport
}

impl Participant {
    pub fn new(id: String, display_name: Option<String>, language: Option<String>) -> Self {
        Self { id, display_name, language }
    }

    pub fn anonymous(id: &str) -> Self {
        Self { id: id.to_string(), display_name: None, language: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateContent {
    Text(String),
    Command { name: String, args: Vec<String> },
    Callback { data: String },
    Event { event_type: String, payload: Option<Value> },
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_text_update() {
        let update = Update::text("chat-1", "hello");
        assert_eq!(update.chat_id, "chat-1");
        assert_eq!(update.text_body(), Some("hello"));
        assert_eq!(update.callback_data(), None);
    }

    #[test]
    fn test_callback_update_roundtrips_through_json() {
        let update = Update::callback("chat-2", "accept");
        let json = serde_json::to_string(&update).unwrap();
        let back: Update = serde_json::from_str(&json).unwrap();
        assert_eq!(back.callback_data(), Some("accept"));
        assert_eq!(back.id, update.id);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::from_str("DEBUG").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::Critical.as_filter(), "error");
        assert!(LogLevel::from_str("loud").is_err());
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }
}
