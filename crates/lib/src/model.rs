//! Conversation and message rows as stored in the hosted database.
//!
//! Field names match the `chat_sessions` / `chat_messages` tables the automation
//! service reads and writes, so they are serialized as-is (snake_case).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Title given to a conversation before its first user message arrives.
pub const DEFAULT_TITLE: &str = "New conversation";

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Any role this console does not render specially (e.g. rows written by other tools).
    #[serde(other)]
    Other,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other => "other",
        }
    }
}

/// A titled thread of messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Advance `updated_at`. Older timestamps are ignored so the field never moves backwards.
    pub fn touch(&mut self, at: DateTime<Utc>) -> bool {
        if at > self.updated_at {
            self.updated_at = at;
            true
        } else {
            false
        }
    }

    pub fn has_default_title(&self) -> bool {
        self.title.trim().is_empty() || self.title == DEFAULT_TITLE
    }
}

/// A persisted message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    /// Structured payload returned by the automation call, when one was stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Insert body for a message. `created_at` is left to the store unless given.
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            role: Role::User,
            content: content.into(),
            payload: None,
            created_at: None,
        }
    }

    pub fn assistant(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            role: Role::Assistant,
            content: content.into(),
            payload: None,
            created_at: None,
        }
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Title derived from the first user message: first line, whitespace collapsed,
/// cut to `max_chars` characters with a trailing `...` when shortened.
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn conversation() -> Conversation {
        let now = Utc::now();
        Conversation {
            id: "c1".to_string(),
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut c = conversation();
        let start = c.updated_at;
        assert!(!c.touch(start - Duration::seconds(5)));
        assert_eq!(c.updated_at, start);
        assert!(c.touch(start + Duration::seconds(5)));
        assert_eq!(c.updated_at, start + Duration::seconds(5));
    }

    #[test]
    fn derive_title_truncates_long_messages() {
        let title = derive_title("check holding area for every part in the warehouse please", 20);
        assert_eq!(title, "check holding area f...");
        assert_eq!(derive_title("  check   do \nsecond line", 50), "check do");
        assert_eq!(derive_title("   ", 50), DEFAULT_TITLE);
    }

    #[test]
    fn role_round_trips_wire_names() {
        let row = serde_json::json!({
            "id": "m1",
            "session_id": "c1",
            "role": "assistant",
            "content": "hi",
            "created_at": "2025-01-02T03:04:05Z"
        });
        let m: Message = serde_json::from_value(row).unwrap();
        assert_eq!(m.role, Role::Assistant);
        assert!(m.payload.is_none());

        let unknown: Role = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(unknown, Role::Other);
    }
}
