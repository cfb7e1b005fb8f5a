#![allow(dead_code)]

use async_trait::async_trait;
use chatstream::auth::StaticTokenIdentity;
use chatstream::db::{init_db, SqliteStore};
use chatstream::main_helper::{AppState, Args};
use chatstream::provider::{GenerationRequest, ModelEvent, ModelEventStream, ModelProvider};
use chatstream::store::{ConversationPatch, ConversationStore};
use chatstream::types::*;
use clap::Parser;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// One scripted model step.
#[derive(Debug, Clone)]
pub enum Step {
    Event(ModelEvent),
    Overloaded,
    TransportFailure,
}

/// Model provider that replays a fixed script and records what it was asked.
pub struct ScriptedProvider {
    steps: Vec<Step>,
    /// How many more `stream_chat` calls fail before streaming.
    rejections_left: AtomicUsize,
    pub pulled: Arc<AtomicUsize>,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            rejections_left: AtomicUsize::new(0),
            pulled: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn tokens(tokens: &[&str]) -> Self {
        Self::new(
            tokens
                .iter()
                .map(|t| Step::Event(ModelEvent::Token(t.to_string())))
                .collect(),
        )
    }

    /// Fails at open time with an overloaded error, every time.
    pub fn overloaded_at_open() -> Self {
        Self::overloaded_then(usize::MAX, Vec::new())
    }

    /// Overloaded for the first `rejections` calls, then plays `steps`.
    pub fn overloaded_then(rejections: usize, steps: Vec<Step>) -> Self {
        let provider = Self::new(steps);
        provider.rejections_left.store(rejections, Ordering::SeqCst);
        provider
    }

    pub fn calls(&self) -> usize {
        match self.requests.lock() {
            Ok(r) => r.len(),
            Err(e) => panic!("poisoned: {}", e),
        }
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        match self.requests.lock() {
            Ok(r) => r.last().cloned(),
            Err(e) => panic!("poisoned: {}", e),
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(&self, request: GenerationRequest) -> Result<ModelEventStream> {
        match self.requests.lock() {
            Ok(mut r) => r.push(request),
            Err(e) => panic!("poisoned: {}", e),
        }
        let rejected = self
            .rejections_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(ChatError::UpstreamOverloaded("Overloaded".into()).into());
        }

        let pulled = self.pulled.clone();
        let stream = futures_util::stream::iter(self.steps.clone()).map(move |step| -> Result<ModelEvent> {
            pulled.fetch_add(1, Ordering::SeqCst);
            match step {
                Step::Event(ev) => Ok(ev),
                Step::Overloaded => Err(ChatError::UpstreamOverloaded("Overloaded".into()).into()),
                Step::TransportFailure => {
                    Err(ChatError::UpstreamTransport("connection reset".into()).into())
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

pub const TOKEN: &str = "tok-alice";
pub const OTHER_TOKEN: &str = "tok-bob";

pub fn alice() -> UserId {
    UserId::from("alice")
}

pub async fn temp_store() -> (TempDir, Arc<SqliteStore>) {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let pool = match init_db(dir.path().join("chat.db")).await {
        Ok(p) => p,
        Err(e) => panic!("Failed to init DB: {:?}", e),
    };
    (dir, Arc::new(SqliteStore::new(pool)))
}

pub fn app_state(store: Arc<SqliteStore>, provider: Arc<dyn ModelProvider>) -> Arc<AppState> {
    let table = format!("{}:alice,{}:bob", TOKEN, OTHER_TOKEN);
    let identity = match StaticTokenIdentity::parse(&table) {
        Ok(i) => i,
        Err(e) => panic!("Failed to build identity table: {:?}", e),
    };
    let args = Args::parse_from(["chatstream", "--frame-buffer", "8"]);
    Arc::new(AppState {
        store: store.clone(),
        files: store,
        provider,
        identity: Arc::new(identity),
        args: Arc::new(args),
    })
}

/// Conversation owned by alice with the given turns already stored.
pub async fn seeded_conversation(
    store: &SqliteStore,
    turns: &[(Role, &str)],
) -> ConversationId {
    let conversation = match store.create_conversation(&alice()).await {
        Ok(c) => c,
        Err(e) => panic!("create_conversation failed: {:?}", e),
    };
    for (role, content) in turns {
        let appended = store
            .append_message(NewMessage {
                conversation_id: conversation.id.clone(),
                owner: alice(),
                role: *role,
                content: content.to_string(),
                is_complete: None,
                attachments: Vec::new(),
            })
            .await;
        if let Err(e) = appended {
            panic!("append_message failed: {:?}", e);
        }
    }
    conversation.id
}

pub async fn messages(store: &SqliteStore, id: &ConversationId) -> Vec<Message> {
    match store.list_messages(id).await {
        Ok(m) => m,
        Err(e) => panic!("list_messages failed: {:?}", e),
    }
}

pub async fn incomplete_messages(store: &SqliteStore, id: &ConversationId) -> Vec<Message> {
    messages(store, id)
        .await
        .into_iter()
        .filter(|m| m.is_placeholder())
        .collect()
}

/// SQLite store whose `finalize_message` starts failing from the given call on.
pub struct FailingFinalizeStore {
    inner: Arc<SqliteStore>,
    finalizes: AtomicUsize,
    fail_from: usize,
}

impl FailingFinalizeStore {
    /// `fail_from` counts from zero: `0` fails every finalize, `1` lets the
    /// first one through.
    pub fn new(inner: Arc<SqliteStore>, fail_from: usize) -> Self {
        Self {
            inner,
            finalizes: AtomicUsize::new(0),
            fail_from,
        }
    }
}

#[async_trait]
impl ConversationStore for FailingFinalizeStore {
    async fn create_conversation(&self, owner: &UserId) -> Result<Conversation> {
        self.inner.create_conversation(owner).await
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        self.inner.get_conversation(id).await
    }

    async fn list_conversations(&self, owner: &UserId) -> Result<Vec<Conversation>> {
        self.inner.list_conversations(owner).await
    }

    async fn patch_conversation(
        &self,
        id: &ConversationId,
        patch: ConversationPatch,
    ) -> Result<()> {
        self.inner.patch_conversation(id, patch).await
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<u64> {
        self.inner.delete_conversation(id).await
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message> {
        self.inner.append_message(message).await
    }

    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        self.inner.list_messages(conversation_id).await
    }

    async fn finalize_message(&self, id: &MessageId, content: &str) -> Result<bool> {
        if self.finalizes.fetch_add(1, Ordering::SeqCst) >= self.fail_from {
            return Err(ChatError::Persistence("disk full".into()).into());
        }
        self.inner.finalize_message(id, content).await
    }

    async fn delete_message(&self, id: &MessageId) -> Result<bool> {
        self.inner.delete_message(id).await
    }

    async fn delete_messages(&self, conversation_id: &ConversationId) -> Result<u64> {
        self.inner.delete_messages(conversation_id).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}
