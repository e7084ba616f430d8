//! In-process store. Backs tests and local runs; inserts are fanned out to
//! subscribers over a broadcast channel.

use super::{ConversationStore, MessageStore, StoreError, Subscription};
use crate::model::{Conversation, Message, NewMessage, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc, RwLock};

const FEED_CAPACITY: usize = 256;

pub struct MemoryStore {
    messages: RwLock<Vec<Message>>,
    conversations: RwLock<HashMap<String, Conversation>>,
    inserts: broadcast::Sender<Message>,
    failing_subscribes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (inserts, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            messages: RwLock::new(Vec::new()),
            conversations: RwLock::new(HashMap::new()),
            inserts,
            failing_subscribes: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` subscribe calls fail, as if the realtime endpoint were down.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// Number of live insert feeds.
    pub fn subscriber_count(&self) -> usize {
        self.inserts.receiver_count()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError> {
        let row = Message {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: message.session_id,
            role: message.role,
            content: message.content,
            payload: message.payload,
            created_at: message.created_at.unwrap_or_else(Utc::now),
        };
        self.messages.write().await.push(row.clone());
        // No receivers is fine: nobody is watching this conversation.
        let _ = self.inserts.send(row.clone());
        Ok(row)
    }

    async fn list(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut rows: Vec<Message> = self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }

    async fn reply_after(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
        exclude: &[String],
    ) -> Result<Option<Message>, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| {
                m.session_id == session_id
                    && m.role == Role::Assistant
                    && m.created_at >= since
                    && !exclude.contains(&m.id)
            })
            .min_by_key(|m| m.created_at)
            .cloned())
    }

    async fn update_content(&self, id: &str, content: &str) -> Result<Message, StoreError> {
        let mut g = self.messages.write().await;
        let row = g
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;
        row.content = content.to_string();
        Ok(row.clone())
    }

    async fn subscribe(&self, session_id: &str) -> Result<Subscription, StoreError> {
        let remaining = self.failing_subscribes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_subscribes.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Subscribe("realtime endpoint unavailable".to_string()));
        }
        let mut feed = self.inserts.subscribe();
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let session_id = session_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(row) if row.session_id == session_id => {
                        if tx.send(row).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("memory store: subscriber lagged by {} rows", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(Subscription::new(rx, task))
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn list(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut all: Vec<Conversation> = self.conversations.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    async fn get(&self, id: &str) -> Result<Conversation, StoreError> {
        self.conversations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))
    }

    async fn create(&self, title: &str) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn update(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut g = self.conversations.write().await;
        let existing = g
            .get_mut(&conversation.id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation.id)))?;
        existing.title = conversation.title.clone();
        existing.touch(conversation.updated_at);
        Ok(())
    }
}
