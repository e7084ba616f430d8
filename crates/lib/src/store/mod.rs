//! Message and conversation stores.
//!
//! The message store is append-only apart from content edits. It is shared by the
//! push path, the poll path and history loads, so every read here is an idempotent
//! re-read and no locking across calls is needed.

mod memory;
mod realtime;
mod rest;

pub use memory::MemoryStore;
pub use realtime::{parse_insert, RealtimeClient};
pub use rest::{RestStore, RestStoreConfig};

use crate::model::{Conversation, Message, NewMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store api error: {0}")]
    Api(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("subscription failed: {0}")]
    Subscribe(String),
    #[error("store returned malformed data: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Live feed of rows inserted into one conversation. Dropping it releases the
/// underlying connection.
pub struct Subscription {
    rx: mpsc::Receiver<Message>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Message>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Next inserted row; None when the feed has closed and should be reopened.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a row and return it as stored (id and created_at filled in).
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// All messages of a conversation, oldest first.
    async fn list(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;

    /// Oldest assistant message of the conversation with `created_at >= since`,
    /// skipping ids in `exclude`.
    async fn reply_after(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
        exclude: &[String],
    ) -> Result<Option<Message>, StoreError>;

    /// Replace the content of a message.
    async fn update_content(&self, id: &str, content: &str) -> Result<Message, StoreError>;

    /// Open an insert feed scoped to one conversation.
    async fn subscribe(&self, session_id: &str) -> Result<Subscription, StoreError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// All conversations, most recently updated first.
    async fn list(&self) -> Result<Vec<Conversation>, StoreError>;

    async fn get(&self, id: &str) -> Result<Conversation, StoreError>;

    async fn create(&self, title: &str) -> Result<Conversation, StoreError>;

    /// Persist title and updated_at.
    async fn update(&self, conversation: &Conversation) -> Result<(), StoreError>;
}
