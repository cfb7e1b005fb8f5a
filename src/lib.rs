#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod auth;
pub mod client;
pub mod constants;
pub mod context;
pub mod db;
pub mod delta;
pub mod handlers;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod persistence;
pub mod provider;
pub mod redaction_layer;
pub mod retry;
pub mod specs;
pub mod sse;
pub mod store;
pub mod streaming;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
