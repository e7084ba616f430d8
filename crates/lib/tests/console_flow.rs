//! Console send/reply flow with a scripted automation and the in-memory store.

use async_trait::async_trait;
use opsdesk::console::{Console, ConsoleError, ConsoleSettings, ConsoleUpdate, TIMEOUT_TEXT};
use opsdesk::model::{Conversation, NewMessage, Role};
use opsdesk::store::{ConversationStore, MemoryStore, MessageStore, StoreError};
use opsdesk::watch::{Entry, Slot, WatchSettings};
use opsdesk::webhook::{Automation, WebhookError, WebhookReply, WebhookRequest};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy)]
enum Script {
    /// Write an assistant row into the conversation, like the workflow does.
    Reply(&'static str),
    /// Accept the request and never write anything.
    Silent,
    /// Answer with a server error.
    Fail,
}

struct ScriptedAutomation {
    store: Arc<MemoryStore>,
    script: Mutex<Script>,
    requests: Mutex<Vec<WebhookRequest>>,
}

impl ScriptedAutomation {
    fn new(store: Arc<MemoryStore>, script: Script) -> Arc<Self> {
        Arc::new(Self {
            store,
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    fn requests(&self) -> Vec<WebhookRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Automation for ScriptedAutomation {
    async fn dispatch(&self, request: &WebhookRequest) -> Result<WebhookReply, WebhookError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = *self.script.lock().unwrap();
        match script {
            Script::Reply(text) => {
                self.store
                    .insert(NewMessage::assistant(&request.session_id, text).at(request.timestamp))
                    .await
                    .unwrap();
                Ok(WebhookReply::Empty)
            }
            Script::Silent => Ok(WebhookReply::Plain("Workflow was started".to_string())),
            Script::Fail => Err(WebhookError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            }),
        }
    }
}

fn console(store: &Arc<MemoryStore>, automation: &Arc<ScriptedAutomation>) -> Console {
    let settings = ConsoleSettings {
        watch: WatchSettings {
            timeout: Duration::from_secs(30),
            ..WatchSettings::default()
        },
        ..ConsoleSettings::default()
    };
    Console::new(store.clone(), store.clone(), automation.clone(), settings)
}

async fn next(console: &mut Console) -> Option<ConsoleUpdate> {
    tokio::time::timeout(Duration::from_secs(120), console.next_update())
        .await
        .ok()
        .flatten()
}

#[tokio::test(start_paused = true)]
async fn reply_replaces_placeholder_and_names_conversation() {
    let store = Arc::new(MemoryStore::new());
    let automation = ScriptedAutomation::new(store.clone(), Script::Reply("| DO | Status |\n|---|---|\n| DO-7 | Ready |"));
    let mut console = console(&store, &automation);
    let conversation = console.new_conversation().await.unwrap();

    let placeholder = console.send("  check do  ").await.unwrap();
    assert_eq!(console.timeline().unwrap().slot(placeholder), Some(&Slot::Pending));

    match next(&mut console).await {
        Some(ConsoleUpdate::ReplyArrived { placeholder: p, message }) => {
            assert_eq!(p, placeholder);
            assert_eq!(message.role, Role::Assistant);
            assert!(message.content.starts_with("| DO |"));
        }
        other => panic!("expected a reply, got {:?}", other),
    }
    assert!(!console.timeline().unwrap().has_pending());

    let requests = automation.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].session_id, conversation.id);
    assert_eq!(requests[0].message, "check do");
    assert_eq!(requests[0].context["history"][0]["content"], "check do");

    assert_eq!(console.conversation().unwrap().title, "check do");
    let stored = ConversationStore::get(store.as_ref(), &conversation.id).await.unwrap();
    assert_eq!(stored.title, "check do");
    assert!(stored.updated_at >= conversation.updated_at);
}

/// Conversation store whose writes take a while, like a PATCH over the network.
struct SlowConversations {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl ConversationStore for SlowConversations {
    async fn list(&self) -> Result<Vec<Conversation>, StoreError> {
        ConversationStore::list(self.inner.as_ref()).await
    }

    async fn get(&self, id: &str) -> Result<Conversation, StoreError> {
        self.inner.get(id).await
    }

    async fn create(&self, title: &str) -> Result<Conversation, StoreError> {
        self.inner.create(title).await
    }

    async fn update(&self, conversation: &Conversation) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.update(conversation).await
    }
}

#[tokio::test(start_paused = true)]
async fn reply_is_reported_while_conversation_write_is_slow() {
    let store = Arc::new(MemoryStore::new());
    let automation = ScriptedAutomation::new(store.clone(), Script::Silent);
    let conversations = Arc::new(SlowConversations {
        inner: store.clone(),
        delay: Duration::from_millis(500),
    });
    let mut console = Console::new(
        store.clone(),
        conversations,
        automation.clone(),
        ConsoleSettings::default(),
    );
    let conversation = console.new_conversation().await.unwrap();
    let placeholder = console.send("check do").await.unwrap();
    let answered_at = chrono::Utc::now() + chrono::Duration::seconds(5);
    store
        .insert(NewMessage::assistant(&conversation.id, "DO-7 ready").at(answered_at))
        .await
        .unwrap();

    // The reply is reported without waiting on the conversation write.
    let first = tokio::select! {
        update = console.next_update() => update,
        _ = tokio::time::sleep(Duration::from_millis(200)) => None,
    };
    match first {
        Some(ConsoleUpdate::ReplyArrived { placeholder: p, message }) => {
            assert_eq!(p, placeholder);
            assert_eq!(message.content, "DO-7 ready");
        }
        other => panic!("expected the reply, got {:?}", other),
    }
    assert!(matches!(
        console.timeline().unwrap().slot(placeholder),
        Some(Slot::Resolved(_))
    ));

    // Dropping the next wait does not lose the write either.
    let idle = tokio::select! {
        update = console.next_update() => update,
        _ = tokio::time::sleep(Duration::from_millis(100)) => None,
    };
    assert_eq!(idle, None);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stored = ConversationStore::get(store.as_ref(), &conversation.id).await.unwrap();
    assert_eq!(stored.title, "check do");
    assert_eq!(stored.updated_at, answered_at);
}

#[tokio::test(start_paused = true)]
async fn second_send_waits_for_pending_reply() {
    let store = Arc::new(MemoryStore::new());
    let automation = ScriptedAutomation::new(store.clone(), Script::Silent);
    let mut console = console(&store, &automation);
    console.new_conversation().await.unwrap();

    console.send("approve po 12345").await.unwrap();
    assert!(matches!(
        console.send("reject po 12345").await,
        Err(ConsoleError::ReplyPending)
    ));
    assert!(matches!(console.send("   ").await, Err(ConsoleError::EmptyMessage)));
}

#[tokio::test(start_paused = true)]
async fn silent_automation_times_out() {
    let store = Arc::new(MemoryStore::new());
    let automation = ScriptedAutomation::new(store.clone(), Script::Silent);
    let mut console = console(&store, &automation);
    console.new_conversation().await.unwrap();

    let placeholder = console.send("check holding area").await.unwrap();
    assert_eq!(
        next(&mut console).await,
        Some(ConsoleUpdate::ReplyFailed {
            placeholder,
            reason: TIMEOUT_TEXT.to_string()
        })
    );
    assert_eq!(
        console.timeline().unwrap().slot(placeholder),
        Some(&Slot::Failed(TIMEOUT_TEXT.to_string()))
    );

    // A late reply after the timeout shows up as a regular message.
    let id = console.conversation().unwrap().id.clone();
    let late = store
        .insert(NewMessage::assistant(&id, "late answer"))
        .await
        .unwrap();
    assert_eq!(next(&mut console).await, Some(ConsoleUpdate::MessageAppended(late)));
}

#[tokio::test(start_paused = true)]
async fn unreachable_automation_fails_placeholder_and_allows_retry() {
    let store = Arc::new(MemoryStore::new());
    let automation = ScriptedAutomation::new(store.clone(), Script::Fail);
    let mut console = console(&store, &automation);
    console.new_conversation().await.unwrap();

    let placeholder = console.send("generate do").await.unwrap();
    match next(&mut console).await {
        Some(ConsoleUpdate::ReplyFailed { placeholder: p, reason }) => {
            assert_eq!(p, placeholder);
            assert!(reason.contains("could not be reached"), "{}", reason);
            assert!(reason.contains("502"), "{}", reason);
        }
        other => panic!("expected a failure, got {:?}", other),
    }

    automation.set(Script::Reply("DO generated"));
    let retry = console.send("generate do").await.unwrap();
    match next(&mut console).await {
        Some(ConsoleUpdate::ReplyArrived { placeholder: p, message }) => {
            assert_eq!(p, retry);
            assert_eq!(message.content, "DO generated");
        }
        other => panic!("expected a reply, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn switching_conversations_drops_old_replies() {
    let store = Arc::new(MemoryStore::new());
    let automation = ScriptedAutomation::new(store.clone(), Script::Silent);
    let mut console = console(&store, &automation);
    let first = console.new_conversation().await.unwrap();
    console.send("check full ncr").await.unwrap();

    let second = console.new_conversation().await.unwrap();
    assert_eq!(console.conversation().unwrap().id, second.id);
    store
        .insert(NewMessage::assistant(&first.id, "NCR list"))
        .await
        .unwrap();

    assert_eq!(next(&mut console).await, None);
    assert!(console.timeline().unwrap().entries().is_empty());
    assert_eq!(store.subscriber_count(), 1);

    // Reopening shows the reply as history.
    let timeline = console.open(&first.id).await.unwrap();
    let contents: Vec<&str> = timeline
        .entries()
        .iter()
        .filter_map(|e| match e {
            Entry::Message(m) => Some(m.content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(contents, vec!["check full ncr", "NCR list"]);
}

#[tokio::test(start_paused = true)]
async fn edit_updates_store_and_timeline() {
    let store = Arc::new(MemoryStore::new());
    let automation = ScriptedAutomation::new(store.clone(), Script::Reply("rate is 1.34"));
    let mut console = console(&store, &automation);
    let conversation = console.new_conversation().await.unwrap();
    console.send("usd to sgd rate").await.unwrap();
    let Some(ConsoleUpdate::ReplyArrived { placeholder, message }) = next(&mut console).await else {
        panic!("expected a reply");
    };

    let edited = console
        .edit_message(&message.id, "rate is 1.34 (checked)")
        .await
        .unwrap();
    assert_eq!(edited.content, "rate is 1.34 (checked)");
    match console.timeline().unwrap().slot(placeholder) {
        Some(Slot::Resolved(m)) => assert_eq!(m.content, "rate is 1.34 (checked)"),
        other => panic!("unexpected slot {:?}", other),
    }
    let stored = MessageStore::list(store.as_ref(), &conversation.id).await.unwrap();
    assert!(stored.iter().any(|m| m.content == "rate is 1.34 (checked)"));
}

#[tokio::test(start_paused = true)]
async fn send_without_conversation_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let automation = ScriptedAutomation::new(store.clone(), Script::Silent);
    let mut console = console(&store, &automation);
    assert!(matches!(
        console.send("check do").await,
        Err(ConsoleError::NoConversation)
    ));
    assert!(automation.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn conversations_listed_most_recent_first() {
    let store = Arc::new(MemoryStore::new());
    let automation = ScriptedAutomation::new(store.clone(), Script::Reply("ok"));
    let mut console = console(&store, &automation);
    let older = console.new_conversation().await.unwrap();
    let newer = console.new_conversation().await.unwrap();

    console.open(&older.id).await.unwrap();
    console.send("parse supplier do").await.unwrap();
    next(&mut console).await.unwrap();

    let ids: Vec<String> = console
        .conversations()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec![older.id, newer.id]);
}
