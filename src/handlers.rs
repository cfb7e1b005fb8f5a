use crate::auth::require_identity;
use crate::constants::{SSE_HEADERS, SYSTEM_MESSAGE, WELCOME_MESSAGE};
use crate::context::{ContextAssembler, NewTurn};
use crate::persistence::TurnWriter;
use crate::provider::GenerationRequest;
use crate::store::{require_owned_conversation, NewFile};
use crate::streaming::{frame_channel, StreamDriver};
use crate::types::*;
use crate::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::Instrument;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChatBody {
    #[serde(alias = "chatId")]
    pub conversation_id: Option<ConversationId>,
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<AttachmentRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveMessageBody {
    #[serde(alias = "chatId")]
    pub conversation_id: Option<ConversationId>,
    pub content: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterFileBody {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub storage_id: String,
    pub extracted_text: Option<String>,
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    match serde_json::from_slice(body) {
        Ok(v) => Ok(v),
        Err(e) => Err(ChatError::Validation(format!("Invalid request body: {}", e)).into()),
    }
}

fn non_blank(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty())
}

fn required_conversation(id: Option<ConversationId>) -> Result<ConversationId> {
    match id {
        Some(id) if !id.as_str().trim().is_empty() => Ok(id),
        _ => Err(ChatError::Validation("Missing required fields: conversationId".into()).into()),
    }
}

/// `POST /chat/stream`. Everything that can be rejected is checked before the
/// first byte goes out; after that, failures travel as `error` frames.
#[tracing::instrument(
    skip_all,
    fields(conversation = tracing::field::Empty, user = tracing::field::Empty)
)]
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let identity = require_identity(state.identity.as_ref(), &headers).await?;
    let span = tracing::Span::current();
    span.record("user", identity.subject.short());

    let req: StreamChatBody = parse_body(&body)?;
    let conversation_id = required_conversation(req.conversation_id)?;
    span.record("conversation", conversation_id.short());

    let text = non_blank(req.content);
    let attachments = match req.attachments {
        Some(a) => a,
        None => Vec::new(),
    };
    if text.is_none() && attachments.is_empty() {
        return Err(ChatError::Validation(
            "Missing required fields: content or attachments".into(),
        )
        .into());
    }
    for (i, attachment) in attachments.iter().enumerate() {
        attachment.validate(i)?;
    }

    require_owned_conversation(state.store.as_ref(), &conversation_id, &identity.subject).await?;

    let turn = NewTurn {
        text,
        attachments: attachments.clone(),
    };
    let assembled = ContextAssembler::new(
        state.store.as_ref(),
        state.files.as_ref(),
        &identity.subject,
        state.args.max_history_messages,
    )
    .assemble(&conversation_id, &turn)
    .await?;

    // Stored as pending; it only becomes history once the stream settles.
    let pending = TurnWriter::new(state.store.clone(), identity.subject.clone())
        .open_turn(&conversation_id, &assembled.user_text, attachments)
        .await?;

    tracing::info!(
        "[🌐 -> ⚙️ ] Streaming turn for [{}]: {} prior turns, {} model turns",
        conversation_id.short(),
        assembled.prior_turns,
        assembled.messages.len()
    );

    let request = GenerationRequest {
        conversation_id: conversation_id.clone(),
        system: SYSTEM_MESSAGE.to_string(),
        messages: assembled.messages,
    };
    let (sink, frames) = frame_channel(state.args.frame_buffer);
    let stream_span = tracing::info_span!(
        parent: &span,
        "stream",
        conversation = %conversation_id.short(),
        placeholder = %pending.message_id().short()
    );
    tokio::spawn(
        StreamDriver::new()
            .run(state.provider.clone(), request, pending, sink)
            .instrument(stream_span),
    );

    let mut response = Response::new(Body::from_stream(frames));
    for (name, value) in SSE_HEADERS {
        response.headers_mut().insert(
            HeaderName::from_static(*name),
            HeaderValue::from_static(*value),
        );
    }
    Ok(response)
}

/// `POST /chat/save`: direct, non-streaming append.
#[tracing::instrument(skip_all)]
pub async fn chat_save(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let identity = require_identity(state.identity.as_ref(), &headers).await?;
    let req: SaveMessageBody = parse_body(&body)?;

    let fields = (req.conversation_id, non_blank(req.content), req.role);
    let (conversation_id, content, role) = match fields {
        (Some(c), Some(t), Some(r)) => (c, t, r),
        _ => return Err(ChatError::Validation("Missing required fields".into()).into()),
    };
    let role = match Role::parse(&role) {
        Some(r) => r,
        None => return Err(ChatError::Validation(format!("Unknown role '{}'", role)).into()),
    };

    require_owned_conversation(state.store.as_ref(), &conversation_id, &identity.subject).await?;

    let writer = TurnWriter::new(state.store.clone(), identity.subject);
    let message = match role {
        Role::User => writer.append_user_turn(&conversation_id, &content, Vec::new()).await?,
        Role::Assistant => writer.append_assistant_turn(&conversation_id, &content).await?,
    };
    tracing::debug!("Saved {} message [{}]", role, message.id.short());

    Ok(Json(serde_json::json!({ "success": true })))
}

/// `POST /chats`: new conversation seeded with the welcome message.
pub async fn create_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let identity = require_identity(state.identity.as_ref(), &headers).await?;
    let conversation = state.store.create_conversation(&identity.subject).await?;

    TurnWriter::new(state.store.clone(), identity.subject)
        .append_assistant_turn(&conversation.id, WELCOME_MESSAGE)
        .await?;

    tracing::info!("Created conversation [{}]", conversation.id.short());
    Ok(Json(serde_json::json!({
        "success": true,
        "chatId": conversation.id,
    })))
}

pub async fn list_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let identity = require_identity(state.identity.as_ref(), &headers).await?;
    let chats = state.store.list_conversations(&identity.subject).await?;
    Ok(Json(serde_json::json!({ "chats": chats })))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let identity = require_identity(state.identity.as_ref(), &headers).await?;
    let conversation_id = ConversationId::from(id);
    require_owned_conversation(state.store.as_ref(), &conversation_id, &identity.subject).await?;

    let messages: Vec<Message> = state
        .store
        .list_messages(&conversation_id)
        .await?
        .into_iter()
        .filter(|m| !m.is_placeholder())
        .collect();
    Ok(Json(serde_json::json!({ "messages": messages })))
}

pub async fn delete_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let identity = require_identity(state.identity.as_ref(), &headers).await?;
    let conversation_id = ConversationId::from(id);
    require_owned_conversation(state.store.as_ref(), &conversation_id, &identity.subject).await?;

    let deleted = state.store.delete_messages(&conversation_id).await?;
    tracing::info!("Deleted {} messages from [{}]", deleted, conversation_id.short());
    Ok(Json(serde_json::json!({ "success": true, "deleted": deleted })))
}

pub async fn delete_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let identity = require_identity(state.identity.as_ref(), &headers).await?;
    let conversation_id = ConversationId::from(id);
    require_owned_conversation(state.store.as_ref(), &conversation_id, &identity.subject).await?;

    let deleted = state.store.delete_conversation(&conversation_id).await?;
    tracing::info!(
        "Deleted conversation [{}] and {} messages",
        conversation_id.short(),
        deleted
    );
    Ok(Json(serde_json::json!({ "success": true, "deletedMessages": deleted })))
}

/// `POST /files`: records metadata for content stored elsewhere.
pub async fn register_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let identity = require_identity(state.identity.as_ref(), &headers).await?;
    let req: RegisterFileBody = parse_body(&body)?;
    if req.file_name.trim().is_empty() || req.storage_id.trim().is_empty() {
        return Err(ChatError::Validation("Missing required fields".into()).into());
    }

    let mut record = state
        .files
        .create_file(NewFile {
            owner: identity.subject,
            file_name: req.file_name,
            file_type: req.file_type,
            file_size: req.file_size,
            storage_id: req.storage_id,
        })
        .await?;

    if let Some(text) = non_blank(req.extracted_text) {
        state
            .files
            .update_processing_status(&record.id, true, Some(text.clone()))
            .await?;
        record.is_processed = true;
        record.extracted_text = Some(text);
    }

    Ok((StatusCode::CREATED, Json(record)).into_response())
}
