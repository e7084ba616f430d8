//! Automation webhook client.
//!
//! The webhook starts the automation run; the real answer is written to the message
//! store later. Whatever the HTTP response carries is decoded into [`WebhookReply`]
//! for logging and diagnostics only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Body posted to the automation webhook. Field names are fixed by the automation flow.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookRequest {
    pub session_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub context: Value,
}

/// Fields an automation response may carry its text in, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyField {
    Output,
    Message,
    Content,
    Text,
    Response,
}

impl ReplyField {
    pub const PRIORITY: [ReplyField; 5] = [
        ReplyField::Output,
        ReplyField::Message,
        ReplyField::Content,
        ReplyField::Text,
        ReplyField::Response,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            ReplyField::Output => "output",
            ReplyField::Message => "message",
            ReplyField::Content => "content",
            ReplyField::Text => "text",
            ReplyField::Response => "response",
        }
    }
}

/// Synchronous webhook response, decoded in a fixed order:
/// object field by [`ReplyField::PRIORITY`] (arrays are read at their first item),
/// then a bare JSON string, then empty body, then anything else stringified.
/// Bodies that are not JSON at all are kept as [`WebhookReply::Raw`].
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookReply {
    Field { field: ReplyField, text: String },
    Plain(String),
    Raw(String),
    Empty,
    Unrecognized(String),
}

impl WebhookReply {
    pub fn from_body(body: &str) -> Self {
        if body.trim().is_empty() {
            return WebhookReply::Empty;
        }
        match serde_json::from_str::<Value>(body) {
            Ok(value) => Self::from_value(&value),
            Err(_) => WebhookReply::Raw(body.to_string()),
        }
    }

    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => WebhookReply::Empty,
            Value::String(s) => WebhookReply::Plain(s.clone()),
            Value::Array(items) => match items.first() {
                Some(first) => match Self::from_value(first) {
                    WebhookReply::Unrecognized(_) => WebhookReply::Unrecognized(value.to_string()),
                    other => other,
                },
                None => WebhookReply::Empty,
            },
            Value::Object(map) => {
                for field in ReplyField::PRIORITY {
                    if let Some(Value::String(text)) = map.get(field.key()) {
                        return WebhookReply::Field {
                            field,
                            text: text.clone(),
                        };
                    }
                }
                WebhookReply::Unrecognized(value.to_string())
            }
            other => WebhookReply::Unrecognized(other.to_string()),
        }
    }

    /// Displayable text, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            WebhookReply::Field { text, .. } => Some(text),
            WebhookReply::Plain(s) | WebhookReply::Raw(s) | WebhookReply::Unrecognized(s) => {
                Some(s)
            }
            WebhookReply::Empty => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook url not configured")]
    NotConfigured,
    #[error("webhook request timed out")]
    Timeout,
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl WebhookError {
    /// A timeout means the automation may still be running and may still write its
    /// reply; every other error means the run was never started.
    pub fn is_send_failure(&self) -> bool {
        !matches!(self, WebhookError::Timeout)
    }
}

/// Starts an automation run for a user message.
#[async_trait]
pub trait Automation: Send + Sync {
    async fn dispatch(&self, request: &WebhookRequest) -> Result<WebhookReply, WebhookError>;
}

/// HTTP client for the automation webhook.
#[derive(Clone)]
pub struct WebhookClient {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookClient {
    pub fn new(url: Option<String>, timeout: Option<Duration>) -> Self {
        let timeout = timeout.unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty()),
            client,
        }
    }

    /// POST the request as JSON.
    pub async fn post(&self, request: &WebhookRequest) -> Result<WebhookReply, WebhookError> {
        let url = self.url.as_ref().ok_or(WebhookError::NotConfigured)?;
        let res = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(classify)?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(WebhookError::Status { status, body });
        }
        let body = res.text().await.map_err(classify)?;
        Ok(WebhookReply::from_body(&body))
    }
}

fn classify(e: reqwest::Error) -> WebhookError {
    if e.is_timeout() {
        WebhookError::Timeout
    } else {
        WebhookError::Request(e)
    }
}

#[async_trait]
impl Automation for WebhookClient {
    async fn dispatch(&self, request: &WebhookRequest) -> Result<WebhookReply, WebhookError> {
        self.post(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_priority_prefers_output() {
        let reply = WebhookReply::from_value(&json!({
            "text": "low",
            "output": "high",
            "message": "mid"
        }));
        assert_eq!(
            reply,
            WebhookReply::Field {
                field: ReplyField::Output,
                text: "high".to_string()
            }
        );
    }

    #[test]
    fn non_string_fields_are_skipped() {
        let reply = WebhookReply::from_value(&json!({ "output": { "rows": 3 }, "response": "ok" }));
        assert_eq!(reply.text(), Some("ok"));
    }

    #[test]
    fn arrays_use_first_item() {
        let reply = WebhookReply::from_body(r#"[{"content":"first"},{"content":"second"}]"#);
        assert_eq!(
            reply,
            WebhookReply::Field {
                field: ReplyField::Content,
                text: "first".to_string()
            }
        );
    }

    #[test]
    fn other_shapes() {
        assert_eq!(WebhookReply::from_body("  "), WebhookReply::Empty);
        assert_eq!(WebhookReply::from_body("[]"), WebhookReply::Empty);
        assert_eq!(
            WebhookReply::from_body("\"Workflow was started\""),
            WebhookReply::Plain("Workflow was started".to_string())
        );
        assert_eq!(
            WebhookReply::from_body("Accepted"),
            WebhookReply::Raw("Accepted".to_string())
        );
        assert_eq!(
            WebhookReply::from_body(r#"{"status":"queued"}"#),
            WebhookReply::Unrecognized(r#"{"status":"queued"}"#.to_string())
        );
        assert_eq!(
            WebhookReply::from_body("42"),
            WebhookReply::Unrecognized("42".to_string())
        );
    }

    #[test]
    fn timeout_is_not_a_send_failure() {
        assert!(!WebhookError::Timeout.is_send_failure());
        assert!(WebhookError::NotConfigured.is_send_failure());
        assert!(WebhookError::Status {
            status: 500,
            body: String::new()
        }
        .is_send_failure());
    }

    #[test]
    fn request_uses_wire_field_names() {
        let request = WebhookRequest {
            session_id: "c1".to_string(),
            message: "check do".to_string(),
            timestamp: "2025-01-02T03:04:05Z".parse().unwrap(),
            context: json!({}),
        };
        let v = serde_json::to_value(&request).unwrap();
        assert_eq!(v["session_id"], "c1");
        assert_eq!(v["message"], "check do");
        assert_eq!(v["timestamp"], "2025-01-02T03:04:05Z");
        assert!(v["context"].is_object());
    }
}
