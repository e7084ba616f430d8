//! What the console shows for the open conversation: stored messages plus reply
//! placeholders, each placeholder keyed by its own [`PlaceholderId`].

use crate::model::{Message, Role};
use chrono::{DateTime, Utc};
use std::fmt;

/// Stable identity of one reply placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaceholderId(uuid::Uuid);

impl PlaceholderId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for PlaceholderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlaceholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ph-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Pending,
    Resolved(Message),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Message(Message),
    Placeholder {
        id: PlaceholderId,
        sent_at: DateTime<Utc>,
        slot: Slot,
    },
}

impl Entry {
    fn at(&self) -> DateTime<Utc> {
        match self {
            Entry::Message(m) => m.created_at,
            Entry::Placeholder { sent_at, .. } => *sent_at,
        }
    }

    fn message(&self) -> Option<&Message> {
        match self {
            Entry::Message(m) => Some(m),
            Entry::Placeholder {
                slot: Slot::Resolved(m),
                ..
            } => Some(m),
            _ => None,
        }
    }
}

/// Result of trying to settle a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The placeholder already holds a reply or a failure.
    AlreadyFinal,
    /// The reply predates the message that created the placeholder.
    Stale,
    /// The message is already shown elsewhere in the timeline.
    Duplicate,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<Entry>,
}

impl Timeline {
    pub fn from_messages(mut messages: Vec<Message>) -> Self {
        messages.sort_by_key(|m| m.created_at);
        Self {
            entries: messages.into_iter().map(Entry::Message).collect(),
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn contains_message(&self, id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.message().is_some_and(|m| m.id == id))
    }

    pub fn has_user_message(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.message().is_some_and(|m| m.role == Role::User))
    }

    pub fn pending(&self) -> Vec<PlaceholderId> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Entry::Placeholder {
                    id,
                    slot: Slot::Pending,
                    ..
                } => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending().is_empty()
    }

    pub fn slot(&self, placeholder: PlaceholderId) -> Option<&Slot> {
        self.entries.iter().find_map(|e| match e {
            Entry::Placeholder { id, slot, .. } if *id == placeholder => Some(slot),
            _ => None,
        })
    }

    /// Insert a message in created_at order. Returns false if it is already shown.
    pub fn append(&mut self, message: Message) -> bool {
        if self.contains_message(&message.id) {
            return false;
        }
        let pos = self
            .entries
            .iter()
            .rposition(|e| e.at() <= message.created_at)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.entries.insert(pos, Entry::Message(message));
        true
    }

    /// Add a pending placeholder for a message sent at `sent_at`.
    pub fn push_placeholder(&mut self, sent_at: DateTime<Utc>) -> PlaceholderId {
        let id = PlaceholderId::new();
        self.entries.push(Entry::Placeholder {
            id,
            sent_at,
            slot: Slot::Pending,
        });
        id
    }

    /// Add a placeholder that is already failed (send errors).
    pub fn push_failure(&mut self, sent_at: DateTime<Utc>, reason: impl Into<String>) -> PlaceholderId {
        let id = PlaceholderId::new();
        self.entries.push(Entry::Placeholder {
            id,
            sent_at,
            slot: Slot::Failed(reason.into()),
        });
        id
    }

    pub fn resolve(&mut self, placeholder: PlaceholderId, message: Message) -> Outcome {
        if self.contains_message(&message.id) {
            return Outcome::Duplicate;
        }
        let Some(Entry::Placeholder { sent_at, slot, .. }) = self.find_mut(placeholder) else {
            return Outcome::Unknown;
        };
        if *slot != Slot::Pending {
            return Outcome::AlreadyFinal;
        }
        if message.created_at < *sent_at {
            return Outcome::Stale;
        }
        *slot = Slot::Resolved(message);
        Outcome::Applied
    }

    pub fn fail(&mut self, placeholder: PlaceholderId, reason: impl Into<String>) -> Outcome {
        let Some(Entry::Placeholder { slot, .. }) = self.find_mut(placeholder) else {
            return Outcome::Unknown;
        };
        if *slot != Slot::Pending {
            return Outcome::AlreadyFinal;
        }
        *slot = Slot::Failed(reason.into());
        Outcome::Applied
    }

    /// Replace the content of a shown message. Returns false if it is not shown.
    pub fn edit(&mut self, updated: &Message) -> bool {
        for entry in &mut self.entries {
            let shown = match entry {
                Entry::Message(m) => m,
                Entry::Placeholder {
                    slot: Slot::Resolved(m),
                    ..
                } => m,
                _ => continue,
            };
            if shown.id == updated.id {
                shown.content = updated.content.clone();
                return true;
            }
        }
        false
    }

    fn find_mut(&mut self, placeholder: PlaceholderId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| match e {
            Entry::Placeholder { id, .. } => *id == placeholder,
            _ => false,
        })
    }
}
