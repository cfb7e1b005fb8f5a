#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use chatstream::auth::StaticTokenIdentity;
use chatstream::db::{init_db, SqliteStore};
use chatstream::main_helper::build_router;
use chatstream::provider::{AnthropicConfig, AnthropicProvider};
use chatstream::redaction_layer::RedactingWriter;
use chatstream::{AppState, Args};

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;

fn required_env(name: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => {
            eprintln!("Error: {} environment variable is missing or empty.", name);
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "chatstream=debug,tower_http=info".into(),
    };

    let _ = std::fs::create_dir_all("logs");
    let file_appender = tracing_appender::rolling::daily("logs", "chatstream.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(move || RedactingWriter::new(non_blocking.clone())),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    chatstream::logging::setup_panic_hook();

    let args = Arc::new(Args::parse());

    let pool = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };
    let store = Arc::new(SqliteStore::new(pool));

    let api_key = required_env("ANTHROPIC_API_KEY");
    let identity = match StaticTokenIdentity::parse(&required_env("CHATSTREAM_TOKENS")) {
        Ok(i) => i,
        Err(e) => {
            eprintln!("Invalid CHATSTREAM_TOKENS: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Loaded {} API tokens", identity.len());

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let provider = AnthropicProvider::new(
        client,
        AnthropicConfig {
            api_key,
            base_url: args.provider_base_url.clone(),
            model: args.model.clone(),
            max_tokens: args.max_tokens,
            temperature: args.temperature,
        },
    );

    let state = Arc::new(AppState {
        store: store.clone(),
        files: store,
        provider: Arc::new(provider),
        identity: Arc::new(identity),
        args: args.clone(),
    });
    let app = build_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("chatstream listening on {} (model {})", addr, args.model);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {}", e);
    }
}
