use crate::store::{ConversationPatch, ConversationStore};
use crate::types::*;
use std::sync::Arc;

/// Appends turns and keeps the conversation's latest-message fields current.
#[derive(Clone)]
pub struct TurnWriter {
    store: Arc<dyn ConversationStore>,
    owner: UserId,
}

impl TurnWriter {
    pub fn new(store: Arc<dyn ConversationStore>, owner: UserId) -> Self {
        Self { store, owner }
    }

    pub async fn append_user_turn(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        attachments: Vec<AttachmentRef>,
    ) -> Result<Message> {
        let message = self
            .store
            .append_message(NewMessage {
                conversation_id: conversation_id.clone(),
                owner: self.owner.clone(),
                role: Role::User,
                content: text.to_string(),
                is_complete: None,
                attachments,
            })
            .await?;
        self.touch(conversation_id, &message).await?;
        Ok(message)
    }

    pub async fn append_assistant_turn(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<Message> {
        let message = self
            .store
            .append_message(NewMessage {
                conversation_id: conversation_id.clone(),
                owner: self.owner.clone(),
                role: Role::Assistant,
                content: text.to_string(),
                is_complete: None,
                attachments: Vec::new(),
            })
            .await?;
        self.touch(conversation_id, &message).await?;
        Ok(message)
    }

    /// Inserts the user turn and an assistant placeholder, both incomplete, for
    /// one generation stream. Neither is visible as history until committed.
    pub async fn open_turn(
        &self,
        conversation_id: &ConversationId,
        user_text: &str,
        attachments: Vec<AttachmentRef>,
    ) -> Result<PendingTurn> {
        let user = self
            .store
            .append_message(NewMessage {
                conversation_id: conversation_id.clone(),
                owner: self.owner.clone(),
                role: Role::User,
                content: user_text.to_string(),
                is_complete: Some(false),
                attachments,
            })
            .await?;

        let placeholder = self
            .store
            .append_message(NewMessage {
                conversation_id: conversation_id.clone(),
                owner: self.owner.clone(),
                role: Role::Assistant,
                content: String::new(),
                is_complete: Some(false),
                attachments: Vec::new(),
            })
            .await;
        let placeholder = match placeholder {
            Ok(m) => m,
            Err(e) => {
                if let Err(cleanup) = self.store.delete_message(&user.id).await {
                    tracing::error!(
                        "Failed to drop pending user turn [{}]: {}",
                        user.id.short(),
                        cleanup
                    );
                }
                return Err(e);
            }
        };

        tracing::debug!(
            "Opened turn [{}] -> placeholder [{}] in [{}]",
            user.id.short(),
            placeholder.id.short(),
            conversation_id.short()
        );
        Ok(PendingTurn {
            store: self.store.clone(),
            conversation_id: conversation_id.clone(),
            user_message_id: user.id,
            user_text: user.content,
            message_id: placeholder.id,
        })
    }

    async fn touch(&self, conversation_id: &ConversationId, message: &Message) -> Result<()> {
        self.store
            .patch_conversation(
                conversation_id,
                ConversationPatch {
                    latest_message_text: Some(message.content.clone()),
                    latest_message_time: Some(message.created_at),
                },
            )
            .await
    }
}

/// Handle to one in-flight turn: the user message and its assistant
/// placeholder. Consumed by `commit`, `commit_without_answer` or `abandon`, so
/// a stream settles its turn exactly once. Every path that fails to commit
/// removes both rows.
pub struct PendingTurn {
    store: Arc<dyn ConversationStore>,
    conversation_id: ConversationId,
    user_message_id: MessageId,
    user_text: String,
    message_id: MessageId,
}

impl PendingTurn {
    /// The assistant placeholder.
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn user_message_id(&self) -> &MessageId {
        &self.user_message_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Persists the user turn and the answer together.
    pub async fn commit(self, text: &str) -> Result<MessageId> {
        let result = self.finalize(Some(text)).await;
        match result {
            Ok(()) => Ok(self.message_id),
            Err(e) => {
                self.remove_rows().await;
                Err(e)
            }
        }
    }

    /// Keeps the user turn and drops the placeholder; used when the model
    /// answered with nothing.
    pub async fn commit_without_answer(self) -> Result<()> {
        let result = self.finalize(None).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.remove_rows().await;
                Err(e)
            }
        }
    }

    /// Removes both rows; the turn never happened.
    pub async fn abandon(self) -> Result<()> {
        let user_gone = self.store.delete_message(&self.user_message_id).await?;
        let placeholder_gone = self.store.delete_message(&self.message_id).await?;
        if !user_gone || !placeholder_gone {
            tracing::debug!(
                "Pending turn [{}] was already partly gone",
                self.user_message_id.short()
            );
        }
        Ok(())
    }

    async fn finalize(&self, answer: Option<&str>) -> Result<()> {
        self.finalize_one(&self.user_message_id, &self.user_text).await?;
        let latest = match answer {
            Some(text) => {
                self.finalize_one(&self.message_id, text).await?;
                text
            }
            None => {
                self.store.delete_message(&self.message_id).await?;
                self.user_text.as_str()
            }
        };
        self.store
            .patch_conversation(
                &self.conversation_id,
                ConversationPatch {
                    latest_message_text: Some(latest.to_string()),
                    latest_message_time: Some(now_ms()),
                },
            )
            .await
    }

    async fn finalize_one(&self, id: &MessageId, content: &str) -> Result<()> {
        if !self.store.finalize_message(id, content).await? {
            return Err(ChatError::Persistence(format!(
                "Pending message {} was already finalized or removed",
                id
            ))
            .into());
        }
        Ok(())
    }

    async fn remove_rows(&self) {
        for id in [&self.user_message_id, &self.message_id] {
            if let Err(e) = self.store.delete_message(id).await {
                tracing::error!(
                    "Failed to remove pending message [{}]: {}; startup sweep will collect it",
                    id.short(),
                    e
                );
            }
        }
    }
}
