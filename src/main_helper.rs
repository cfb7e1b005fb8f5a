use crate::auth::IdentityProvider;
use crate::constants::{ANTHROPIC_BASE_URL, DEFAULT_MAX_HISTORY_MESSAGES, DEFAULT_MODEL};
use crate::handlers;
use crate::health;
use crate::logging::request_id_middleware;
use crate::provider::ModelProvider;
use crate::store::{ConversationStore, FileStore};
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "chatstream.db")]
    pub database: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long, default_value = ANTHROPIC_BASE_URL)]
    pub provider_base_url: String,
    #[arg(long, default_value_t = 4096)]
    pub max_tokens: u32,
    #[arg(long)]
    pub temperature: Option<f32>,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_size: usize,
    /// Frames buffered per stream before the driver waits on the client.
    #[arg(long, default_value_t = 64)]
    pub frame_buffer: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_HISTORY_MESSAGES)]
    pub max_history_messages: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub files: Arc<dyn FileStore>,
    pub provider: Arc<dyn ModelProvider>,
    pub identity: Arc<dyn IdentityProvider>,
    pub args: Arc<Args>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let max_body_size = state.args.max_body_size;
    Router::new()
        .route("/chat/stream", post(handlers::chat_stream))
        .route("/chat/save", post(handlers::chat_save))
        .route("/chats", post(handlers::create_chat).get(handlers::list_chats))
        .route(
            "/chats/:id/messages",
            get(handlers::list_messages).delete(handlers::delete_messages),
        )
        .route("/chats/:id", delete(handlers::delete_chat))
        .route("/files", post(handlers::register_file))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(axum::extract::DefaultBodyLimit::max(max_body_size))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
