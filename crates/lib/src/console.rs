//! Console controller: the open conversation, its timeline, and its watch session.
//!
//! Sending persists the user message, shows a placeholder, starts watching for the
//! reply and fires the webhook in the background. Replies come back as watch events
//! through [`Console::next_update`]. Only one reply can be pending at a time:
//! [`Console::send`] refuses while a placeholder is unresolved.

use crate::config::Config;
use crate::model::{derive_title, Conversation, Message, NewMessage, Role, DEFAULT_TITLE};
use crate::store::{ConversationStore, MessageStore, StoreError};
use crate::watch::{
    Outcome, PendingReply, PlaceholderId, Timeline, WatchEvent, WatchSession, WatchSettings,
    WatchUpdate,
};
use crate::webhook::{Automation, WebhookRequest};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shown in place of a reply that never arrived.
pub const TIMEOUT_TEXT: &str = "No reply received in time. Please try again.";

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("no conversation is open")]
    NoConversation,
    #[error("message is empty")]
    EmptyMessage,
    #[error("a reply is still pending")]
    ReplyPending,
    #[error("could not save message: {0}")]
    Persist(#[source] StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Console tuning, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ConsoleSettings {
    pub watch: WatchSettings,
    pub title_max_chars: usize,
    pub context_messages: usize,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            watch: WatchSettings::default(),
            title_max_chars: 50,
            context_messages: 10,
        }
    }
}

impl From<&Config> for ConsoleSettings {
    fn from(config: &Config) -> Self {
        Self {
            watch: config.watch.settings(),
            title_max_chars: config.console.title_max_chars,
            context_messages: config.webhook.context_messages,
        }
    }
}

/// A change the view should render.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleUpdate {
    ReplyArrived {
        placeholder: PlaceholderId,
        message: Message,
    },
    ReplyFailed {
        placeholder: PlaceholderId,
        reason: String,
    },
    MessageAppended(Message),
}

struct Active {
    conversation: Conversation,
    timeline: Timeline,
    session: WatchSession,
}

/// Store work left over after an event has been applied to the timeline.
enum Followup {
    SaveConversation(Conversation),
    Forget(PlaceholderId),
}

pub struct Console {
    messages: Arc<dyn MessageStore>,
    conversations: Arc<dyn ConversationStore>,
    automation: Arc<dyn Automation>,
    settings: ConsoleSettings,
    active: Option<Active>,
    events_tx: mpsc::UnboundedSender<WatchUpdate>,
    events_rx: mpsc::UnboundedReceiver<WatchUpdate>,
    /// Changes already applied to the timeline but not yet returned to the caller.
    unreported: VecDeque<ConsoleUpdate>,
}

impl Console {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        conversations: Arc<dyn ConversationStore>,
        automation: Arc<dyn Automation>,
        settings: ConsoleSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            messages,
            conversations,
            automation,
            settings,
            active: None,
            events_tx,
            events_rx,
            unreported: VecDeque::new(),
        }
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().map(|a| &a.conversation)
    }

    pub fn timeline(&self) -> Option<&Timeline> {
        self.active.as_ref().map(|a| &a.timeline)
    }

    /// Conversations for the sidebar, most recent first.
    pub async fn conversations(&self) -> Result<Vec<Conversation>, ConsoleError> {
        Ok(self.conversations.list().await?)
    }

    /// Show a conversation: stop watching the previous one, load history, start watching.
    pub async fn open(&mut self, conversation_id: &str) -> Result<&Timeline, ConsoleError> {
        self.close();
        let conversation = self.conversations.get(conversation_id).await?;
        let history = self.messages.list(conversation_id).await?;
        let session = WatchSession::start(
            self.messages.clone(),
            conversation_id,
            self.settings.watch,
            self.events_tx.clone(),
        );
        session.mark_seen(&history).await;
        log::info!(
            "console: opened {} ({} messages)",
            conversation.id,
            history.len()
        );
        let active = self.active.insert(Active {
            conversation,
            timeline: Timeline::from_messages(history),
            session,
        });
        Ok(&active.timeline)
    }

    /// Create an empty conversation and open it.
    pub async fn new_conversation(&mut self) -> Result<Conversation, ConsoleError> {
        let conversation = self.conversations.create(DEFAULT_TITLE).await?;
        self.open(&conversation.id).await?;
        Ok(conversation)
    }

    /// Stop watching the open conversation and clear it.
    pub fn close(&mut self) {
        self.unreported.clear();
        if let Some(mut active) = self.active.take() {
            active.session.stop();
            log::debug!("console: closed {}", active.conversation.id);
        }
    }

    /// Send a user message. Returns the placeholder that will hold the reply.
    pub async fn send(&mut self, text: &str) -> Result<PlaceholderId, ConsoleError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ConsoleError::EmptyMessage);
        }
        let active = self.active.as_mut().ok_or(ConsoleError::NoConversation)?;
        if active.timeline.has_pending() {
            return Err(ConsoleError::ReplyPending);
        }
        let conversation_id = active.conversation.id.clone();

        let first_message = !active.timeline.has_user_message();
        let message = match self
            .messages
            .insert(NewMessage::user(&conversation_id, text))
            .await
        {
            Ok(m) => m,
            Err(e) => {
                log::warn!("console: saving message in {} failed: {}", conversation_id, e);
                active
                    .timeline
                    .push_failure(chrono::Utc::now(), format!("Message not sent: {}", e));
                return Err(ConsoleError::Persist(e));
            }
        };
        active.timeline.append(message.clone());
        active.session.mark_seen([&message]).await;

        active.conversation.touch(message.created_at);
        if first_message && active.conversation.has_default_title() {
            active.conversation.title = derive_title(text, self.settings.title_max_chars);
        }
        if let Err(e) = self.conversations.update(&active.conversation).await {
            log::warn!("console: updating conversation {} failed: {}", conversation_id, e);
        }

        let placeholder = active.timeline.push_placeholder(message.created_at);
        active
            .session
            .track(PendingReply {
                conversation_id: conversation_id.clone(),
                placeholder,
                sent_at: message.created_at,
            })
            .await;

        let request = WebhookRequest {
            session_id: conversation_id.clone(),
            message: text.to_string(),
            timestamp: message.created_at,
            context: request_context(&active.timeline, self.settings.context_messages),
        };
        let automation = self.automation.clone();
        let events = self.events_tx.clone();
        let epoch = active.session.epoch();
        // Not cancelled on conversation switch: the run may still complete server-side.
        tokio::spawn(async move {
            match automation.dispatch(&request).await {
                Ok(reply) => {
                    log::debug!(
                        "console: webhook accepted {} ({:?})",
                        placeholder,
                        reply.text().map(|t| t.chars().take(80).collect::<String>())
                    );
                }
                Err(e) if !e.is_send_failure() => {
                    log::warn!("console: webhook for {} did not answer: {}; still watching", placeholder, e);
                }
                Err(e) => {
                    log::warn!("console: webhook for {} failed: {}", placeholder, e);
                    let _ = events.send(WatchUpdate {
                        epoch,
                        conversation_id: request.session_id,
                        event: WatchEvent::DispatchFailed {
                            placeholder,
                            error: e.to_string(),
                        },
                    });
                }
            }
        });

        Ok(placeholder)
    }

    /// Edit the content of a message (e.g. add notes to a reply).
    pub async fn edit_message(&mut self, id: &str, content: &str) -> Result<Message, ConsoleError> {
        let updated = self.messages.update_content(id, content).await?;
        if let Some(active) = self.active.as_mut() {
            active.timeline.edit(&updated);
        }
        Ok(updated)
    }

    /// Wait for the next change to the open conversation. Events from closed
    /// sessions and duplicate observations are skipped.
    ///
    /// Cancel-safe: if the future is dropped after an event reached the timeline,
    /// the change is returned by the next call.
    pub async fn next_update(&mut self) -> Option<ConsoleUpdate> {
        loop {
            if let Some(change) = self.unreported.pop_front() {
                return Some(change);
            }
            let update = self.events_rx.recv().await?;
            if let Some(change) = self.apply(update).await {
                return Some(change);
            }
        }
    }

    /// Apply one watch event to the open conversation.
    pub async fn apply(&mut self, update: WatchUpdate) -> Option<ConsoleUpdate> {
        let (change, followup) = self.apply_to_timeline(update);
        let queued = change.is_some();
        if let Some(change) = change {
            self.unreported.push_back(change);
        }
        match followup {
            Some(Followup::SaveConversation(conversation)) => {
                // Detached so a dropped caller cannot lose the write.
                let conversations = self.conversations.clone();
                tokio::spawn(async move {
                    if let Err(e) = conversations.update(&conversation).await {
                        log::warn!("console: updating conversation {} failed: {}", conversation.id, e);
                    }
                });
            }
            Some(Followup::Forget(placeholder)) => {
                if let Some(active) = self.active.as_ref() {
                    active.session.forget(placeholder).await;
                }
            }
            None => {}
        }
        if queued {
            self.unreported.pop_back()
        } else {
            None
        }
    }

    fn apply_to_timeline(&mut self, update: WatchUpdate) -> (Option<ConsoleUpdate>, Option<Followup>) {
        let Some(active) = self.active.as_mut() else {
            log::debug!("console: dropping event for {}, nothing open", update.conversation_id);
            return (None, None);
        };
        if update.epoch != active.session.epoch() || update.conversation_id != active.conversation.id {
            log::debug!(
                "console: dropping stale event for {} (session {})",
                update.conversation_id,
                update.epoch
            );
            return (None, None);
        }
        match update.event {
            WatchEvent::Resolved {
                placeholder,
                message,
            } => match active.timeline.resolve(placeholder, message.clone()) {
                Outcome::Applied => {
                    let save = active
                        .conversation
                        .touch(message.created_at)
                        .then(|| Followup::SaveConversation(active.conversation.clone()));
                    (
                        Some(ConsoleUpdate::ReplyArrived {
                            placeholder,
                            message,
                        }),
                        save,
                    )
                }
                other => {
                    log::debug!("console: reply for {} not applied: {:?}", placeholder, other);
                    (None, None)
                }
            },
            WatchEvent::TimedOut { placeholder } => {
                (Self::fail(active, placeholder, TIMEOUT_TEXT.to_string()), None)
            }
            WatchEvent::DispatchFailed { placeholder, error } => (
                Self::fail(
                    active,
                    placeholder,
                    format!("The automation could not be reached: {}", error),
                ),
                Some(Followup::Forget(placeholder)),
            ),
            WatchEvent::Appended(message) => {
                let change = active
                    .timeline
                    .append(message.clone())
                    .then_some(ConsoleUpdate::MessageAppended(message));
                (change, None)
            }
        }
    }

    fn fail(active: &mut Active, placeholder: PlaceholderId, reason: String) -> Option<ConsoleUpdate> {
        match active.timeline.fail(placeholder, reason.clone()) {
            Outcome::Applied => Some(ConsoleUpdate::ReplyFailed {
                placeholder,
                reason,
            }),
            _ => None,
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.close();
    }
}

/// Recent history sent along with a message, oldest first.
fn request_context(timeline: &Timeline, limit: usize) -> serde_json::Value {
    let mut recent: Vec<serde_json::Value> = timeline
        .entries()
        .iter()
        .rev()
        .filter_map(|e| match e {
            crate::watch::Entry::Message(m) => Some(m),
            crate::watch::Entry::Placeholder {
                slot: crate::watch::Slot::Resolved(m),
                ..
            } => Some(m),
            _ => None,
        })
        .filter(|m| m.role != Role::Other)
        .take(limit)
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();
    recent.reverse();
    json!({ "source": "console", "history": recent })
}
