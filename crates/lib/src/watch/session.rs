//! Watch session: detects reply rows for one conversation.
//!
//! A session owns one push task (insert subscription, reopened after a fixed delay
//! when it fails or drops) and one poll task per tracked marker. Both paths report
//! rows through [`Shared::observe`], which hands each row to at most one marker, so
//! a reply seen by both paths resolves its placeholder once.

use super::timeline::PlaceholderId;
use crate::model::{Message, Role};
use crate::store::MessageStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Timing of the push and poll paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub timeout: Duration,
    pub resubscribe_delay: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2500),
            max_poll_attempts: 120,
            timeout: Duration::from_secs(300),
            resubscribe_delay: Duration::from_millis(2500),
        }
    }
}

/// Pending-reply marker: a user message was sent and its reply is awaited.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReply {
    pub conversation_id: String,
    pub placeholder: PlaceholderId,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A reply row was matched to a placeholder.
    Resolved {
        placeholder: PlaceholderId,
        message: Message,
    },
    /// No reply within the window or the attempt budget.
    TimedOut { placeholder: PlaceholderId },
    /// A row arrived that no outstanding placeholder accepts.
    Appended(Message),
    /// The webhook call for this placeholder failed outright.
    DispatchFailed {
        placeholder: PlaceholderId,
        error: String,
    },
}

/// Event envelope. `epoch` identifies the session that produced it, so events from
/// a stopped session can be told apart even for the same conversation id.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchUpdate {
    pub epoch: u64,
    pub conversation_id: String,
    pub event: WatchEvent,
}

struct Tracked {
    marker: PendingReply,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Markers {
    /// Outstanding markers in send order.
    pending: Vec<Tracked>,
    /// Rows already handed out, by id. Assistant rows keep their `created_at`, since
    /// only those can come back from a poll.
    seen: HashMap<String, Option<DateTime<Utc>>>,
}

impl Markers {
    fn see(&mut self, row: &Message) -> bool {
        if self.seen.contains_key(&row.id) {
            return false;
        }
        let at = (row.role == Role::Assistant).then_some(row.created_at);
        self.seen.insert(row.id.clone(), at);
        true
    }

    /// Seen assistant rows a poll from `since` could return again.
    fn claimed_since(&self, since: DateTime<Utc>) -> Vec<String> {
        self.seen
            .iter()
            .filter(|(_, at)| at.is_some_and(|at| at >= since))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

struct Shared {
    epoch: u64,
    conversation_id: String,
    stopped: AtomicBool,
    markers: Mutex<Markers>,
    events: mpsc::UnboundedSender<WatchUpdate>,
}

impl Shared {
    fn emit(&self, event: WatchEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let update = WatchUpdate {
            epoch: self.epoch,
            conversation_id: self.conversation_id.clone(),
            event,
        };
        if self.events.send(update).is_err() {
            log::debug!("watch: event receiver dropped for {}", self.conversation_id);
        }
    }

    /// Route an observed row: resolve the oldest marker whose send time is not after
    /// the row, or surface it as a plain append. Rows already seen are ignored.
    async fn observe(&self, row: Message, source: &str) {
        if row.session_id != self.conversation_id {
            return;
        }
        let mut g = self.markers.lock().await;
        if !g.see(&row) {
            return;
        }
        let idx = if row.role == Role::Assistant {
            g.pending
                .iter()
                .position(|t| t.marker.sent_at <= row.created_at)
        } else {
            None
        };
        match idx {
            Some(i) => {
                let tracked = g.pending.remove(i);
                log::info!(
                    "watch: reply {} resolved {} via {}",
                    row.id,
                    tracked.marker.placeholder,
                    source
                );
                self.emit(WatchEvent::Resolved {
                    placeholder: tracked.marker.placeholder,
                    message: row,
                });
                if let Some(task) = tracked.task {
                    task.abort();
                }
            }
            None => {
                log::debug!("watch: row {} ({}) matched no placeholder", row.id, row.role.as_str());
                self.emit(WatchEvent::Appended(row));
            }
        }
    }

    async fn time_out(&self, placeholder: PlaceholderId) {
        let mut g = self.markers.lock().await;
        let Some(i) = g.pending.iter().position(|t| t.marker.placeholder == placeholder) else {
            return;
        };
        g.pending.remove(i);
        log::warn!(
            "watch: no reply for {} in {}, giving up",
            placeholder,
            self.conversation_id
        );
        self.emit(WatchEvent::TimedOut { placeholder });
    }

    async fn is_pending(&self, placeholder: PlaceholderId) -> bool {
        self.markers
            .lock()
            .await
            .pending
            .iter()
            .any(|t| t.marker.placeholder == placeholder)
    }

    async fn claimed_since(&self, since: DateTime<Utc>) -> Vec<String> {
        self.markers.lock().await.claimed_since(since)
    }
}

/// Monitors one conversation for reply rows. Owned by the console; stopped when the
/// displayed conversation changes or when dropped.
pub struct WatchSession {
    shared: Arc<Shared>,
    store: Arc<dyn MessageStore>,
    settings: WatchSettings,
    kill_tx: watch::Sender<bool>,
    push_task: Option<JoinHandle<()>>,
}

impl WatchSession {
    /// Open the push path for `conversation_id`. Events go to `events`.
    pub fn start(
        store: Arc<dyn MessageStore>,
        conversation_id: impl Into<String>,
        settings: WatchSettings,
        events: mpsc::UnboundedSender<WatchUpdate>,
    ) -> Self {
        let shared = Arc::new(Shared {
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::SeqCst),
            conversation_id: conversation_id.into(),
            stopped: AtomicBool::new(false),
            markers: Mutex::new(Markers::default()),
            events,
        });
        let (kill_tx, kill_rx) = watch::channel(false);
        log::debug!("watch: starting session {} for {}", shared.epoch, shared.conversation_id);
        let push_task = tokio::spawn(push_loop(
            shared.clone(),
            store.clone(),
            settings.resubscribe_delay,
            kill_rx,
        ));
        Self {
            shared,
            store,
            settings,
            kill_tx,
            push_task: Some(push_task),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.shared.epoch
    }

    pub fn conversation_id(&self) -> &str {
        &self.shared.conversation_id
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Mark rows that are already displayed so they are never reported.
    pub async fn mark_seen<'a>(&self, rows: impl IntoIterator<Item = &'a Message>) {
        let mut g = self.shared.markers.lock().await;
        for row in rows {
            g.see(row);
        }
    }

    /// Start watching for the reply to `marker`: poll immediately and then every
    /// interval, and give up after the timeout or the last attempt.
    pub async fn track(&self, marker: PendingReply) {
        if !self.is_running() {
            log::debug!("watch: session stopped, not tracking {}", marker.placeholder);
            return;
        }
        let placeholder = marker.placeholder;
        // Registered before the poll task exists so a fast reply finds it.
        let mut g = self.shared.markers.lock().await;
        g.pending.push(Tracked {
            marker: marker.clone(),
            task: None,
        });
        let task = tokio::spawn(poll_until_resolved(
            self.shared.clone(),
            self.store.clone(),
            marker,
            self.settings,
            self.kill_tx.subscribe(),
        ));
        if let Some(t) = g.pending.iter_mut().find(|t| t.marker.placeholder == placeholder) {
            t.task = Some(task);
        }
    }

    /// Stop watching one placeholder without reporting anything for it.
    pub async fn forget(&self, placeholder: PlaceholderId) -> bool {
        let mut g = self.shared.markers.lock().await;
        let Some(i) = g.pending.iter().position(|t| t.marker.placeholder == placeholder) else {
            return false;
        };
        if let Some(task) = g.pending.remove(i).task {
            task.abort();
        }
        true
    }

    pub async fn pending(&self) -> Vec<PlaceholderId> {
        self.shared
            .markers
            .lock()
            .await
            .pending
            .iter()
            .map(|t| t.marker.placeholder)
            .collect()
    }

    /// Release the subscription and every poll timer. No event is emitted afterwards.
    pub fn stop(&mut self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("watch: stopping session {} for {}", self.shared.epoch, self.shared.conversation_id);
        let _ = self.kill_tx.send(true);
        if let Some(task) = self.push_task.take() {
            task.abort();
        }
        if let Ok(mut g) = self.shared.markers.try_lock() {
            for tracked in g.pending.drain(..) {
                if let Some(task) = tracked.task {
                    task.abort();
                }
            }
        }
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn push_loop(
    shared: Arc<Shared>,
    store: Arc<dyn MessageStore>,
    resubscribe_delay: Duration,
    mut kill_rx: watch::Receiver<bool>,
) {
    loop {
        let opened = tokio::select! {
            _ = kill_rx.changed() => return,
            res = store.subscribe(&shared.conversation_id) => res,
        };
        match opened {
            Ok(mut sub) => {
                log::debug!("watch: push path open for {}", shared.conversation_id);
                loop {
                    tokio::select! {
                        _ = kill_rx.changed() => return,
                        row = sub.next() => match row {
                            Some(row) => shared.observe(row, "push").await,
                            None => {
                                log::warn!("watch: push path for {} dropped", shared.conversation_id);
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    "watch: subscribe for {} failed: {}; retrying in {:?}",
                    shared.conversation_id,
                    e,
                    resubscribe_delay
                );
            }
        }
        tokio::select! {
            _ = kill_rx.changed() => return,
            _ = tokio::time::sleep(resubscribe_delay) => {}
        }
    }
}

async fn poll_until_resolved(
    shared: Arc<Shared>,
    store: Arc<dyn MessageStore>,
    marker: PendingReply,
    settings: WatchSettings,
    mut kill_rx: watch::Receiver<bool>,
) {
    let placeholder = marker.placeholder;
    let polling = async {
        let mut ticker = tokio::time::interval(settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        for attempt in 1..=settings.max_poll_attempts {
            ticker.tick().await;
            let exclude = shared.claimed_since(marker.sent_at).await;
            match store
                .reply_after(&marker.conversation_id, marker.sent_at, &exclude)
                .await
            {
                Ok(Some(row)) => shared.observe(row, "poll").await,
                Ok(None) => {}
                Err(e) => log::warn!("watch: poll {} for {} failed: {}", attempt, placeholder, e),
            }
            if !shared.is_pending(placeholder).await {
                return;
            }
        }
        log::debug!("watch: poll budget spent for {}", placeholder);
    };

    tokio::select! {
        _ = kill_rx.changed() => return,
        res = tokio::time::timeout(settings.timeout, polling) => {
            if res.is_err() {
                log::debug!("watch: wait window elapsed for {}", placeholder);
            }
        }
    }
    shared.time_out(placeholder).await;
}
