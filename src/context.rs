use crate::constants::{SYNTHETIC_USER_TURN, UNPROCESSED_FILE_PLACEHOLDER};
use crate::store::{ConversationStore, FileStore};
use crate::types::*;

/// The user's new turn as submitted, before attachment text is folded in.
#[derive(Debug, Clone, Default)]
pub struct NewTurn {
    pub text: Option<String>,
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone)]
pub struct AssembledContext {
    /// Normalized history, oldest first, ending with the new user turn.
    pub messages: Vec<ChatMessage>,
    /// Text of the new turn including attachment preambles; this is what gets persisted.
    pub user_text: String,
    pub prior_turns: usize,
}

pub struct ContextAssembler<'a> {
    store: &'a dyn ConversationStore,
    files: &'a dyn FileStore,
    /// Only this user's files are read into the turn.
    owner: &'a UserId,
    max_history_messages: usize,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(
        store: &'a dyn ConversationStore,
        files: &'a dyn FileStore,
        owner: &'a UserId,
        max_history_messages: usize,
    ) -> Self {
        Self {
            store,
            files,
            owner,
            max_history_messages,
        }
    }

    /// Builds the model input for `turn`. Any failure to read prior turns fails
    /// the whole call; nothing partial is returned.
    pub async fn assemble(
        &self,
        conversation_id: &ConversationId,
        turn: &NewTurn,
    ) -> Result<AssembledContext> {
        let prior = self.store.list_messages(conversation_id).await?;
        let user_text = self.compose_turn_text(turn).await;

        let mut turns: Vec<ChatMessage> = prior
            .iter()
            .filter(|m| !m.is_placeholder())
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        turns.push(ChatMessage::user(user_text.clone()));

        let messages = normalize_history(turns, self.max_history_messages);
        tracing::debug!(
            "Assembled context for [{}]: {} stored turns -> {} model turns",
            conversation_id.short(),
            prior.len(),
            messages.len()
        );

        Ok(AssembledContext {
            messages,
            user_text,
            prior_turns: prior.len(),
        })
    }

    /// User text followed by one preamble block per attachment.
    pub async fn compose_turn_text(&self, turn: &NewTurn) -> String {
        let mut text = match &turn.text {
            Some(t) => t.clone(),
            None => String::new(),
        };

        for attachment in &turn.attachments {
            match self.files.get_file(&attachment.file_id).await {
                Ok(Some(record)) if &record.owner != self.owner => {
                    tracing::warn!(
                        "User [{}] attached file [{}] owned by someone else; treating it as unknown",
                        self.owner.short(),
                        attachment.file_id.short()
                    );
                    text.push_str(&attachment_preamble(attachment, None));
                }
                Ok(record) => text.push_str(&attachment_preamble(attachment, record.as_ref())),
                Err(e) => {
                    tracing::error!(
                        "Error processing file {} ({}): {}",
                        attachment.file_name,
                        attachment.file_id.short(),
                        e
                    );
                    text.push_str(&format!(
                        "\n\nFile: {} (Error processing file)\n",
                        attachment.file_name
                    ));
                }
            }
        }
        text
    }
}

pub fn attachment_preamble(attachment: &AttachmentRef, record: Option<&FileRecord>) -> String {
    let mut block = format!(
        "\n\nFile: {}\nType: {}\nSize: {} bytes\n",
        attachment.file_name, attachment.file_type, attachment.file_size
    );
    let extracted = record
        .and_then(|r| r.extracted_text.as_deref())
        .filter(|t| !t.trim().is_empty());
    match extracted {
        Some(t) => block.push_str(&format!("Content:\n{}\n", t)),
        None => block.push_str(&format!("Content: {}\n", UNPROCESSED_FILE_PLACEHOLDER)),
    }
    block
}

/// Makes a history the model will accept: no empty turns, strict user/assistant
/// alternation, at most `max_messages` turns, and a user turn first.
pub fn normalize_history(turns: Vec<ChatMessage>, max_messages: usize) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(turns.len() + 1);

    for turn in turns {
        if turn.content.trim().is_empty() {
            continue;
        }
        let same_role = matches!(out.last(), Some(last) if last.role == turn.role);
        match out.last_mut() {
            Some(last) if same_role => {
                last.content.push_str("\n\n");
                last.content.push_str(&turn.content);
            }
            _ => out.push(turn),
        }
    }

    let max_messages = max_messages.max(1);
    if out.len() > max_messages {
        let cut = out.len() - max_messages;
        out.drain(..cut);
        // A trimmed window starts on a user turn.
        let leading = out
            .iter()
            .take_while(|m| m.role != Role::User)
            .count();
        if leading < out.len() {
            out.drain(..leading);
        }
    }

    let starts_with_user = match out.first() {
        Some(first) => first.role == Role::User,
        None => return vec![ChatMessage::user(SYNTHETIC_USER_TURN)],
    };
    if !starts_with_user {
        out.insert(0, ChatMessage::user(SYNTHETIC_USER_TURN));
    }
    out
}
