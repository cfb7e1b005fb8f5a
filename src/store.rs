//! Boundaries to the document store. The SQLite implementation lives in
//! [`crate::db`]; anything else that can answer these calls can stand in.

use crate::types::*;
use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub latest_message_text: Option<String>,
    pub latest_message_time: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewFile {
    pub owner: UserId,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub storage_id: String,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, owner: &UserId) -> Result<Conversation>;

    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>>;

    /// Newest first.
    async fn list_conversations(&self, owner: &UserId) -> Result<Vec<Conversation>>;

    async fn patch_conversation(&self, id: &ConversationId, patch: ConversationPatch)
        -> Result<()>;

    /// Removes the conversation and all of its messages. Returns the number of
    /// messages removed.
    async fn delete_conversation(&self, id: &ConversationId) -> Result<u64>;

    async fn append_message(&self, message: NewMessage) -> Result<Message>;

    /// Oldest first.
    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;

    /// Sets the content of an incomplete message and marks it complete.
    /// Returns `false` when the message was already complete or is gone.
    async fn finalize_message(&self, id: &MessageId, content: &str) -> Result<bool>;

    async fn delete_message(&self, id: &MessageId) -> Result<bool>;

    async fn delete_messages(&self, conversation_id: &ConversationId) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn create_file(&self, file: NewFile) -> Result<FileRecord>;

    async fn get_file(&self, id: &FileId) -> Result<Option<FileRecord>>;

    /// Records the outcome of content extraction for a file.
    async fn update_processing_status(
        &self,
        id: &FileId,
        is_processed: bool,
        extracted_text: Option<String>,
    ) -> Result<()>;
}

/// Loads a conversation and checks it belongs to `owner`. Foreign and missing
/// conversations are indistinguishable to the caller.
pub async fn require_owned_conversation(
    store: &dyn ConversationStore,
    id: &ConversationId,
    owner: &UserId,
) -> Result<Conversation> {
    match store.get_conversation(id).await? {
        Some(c) if &c.owner == owner => Ok(c),
        Some(_) => {
            tracing::warn!(
                "User [{}] requested conversation [{}] owned by someone else",
                owner.short(),
                id.short()
            );
            Err(ChatError::NotFound("Chat not found or unauthorized".into()).into())
        }
        None => Err(ChatError::NotFound("Chat not found or unauthorized".into()).into()),
    }
}
