pub mod config;
pub mod relay;
pub mod status;
pub mod voting;
pub mod webhook;

use std::sync::Arc;

pub use voting::VoteEngine;

/// Per-request id attached to tracing spans and request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

pub fn get_bot_version() -> String {
    // Git hash from the deployment build, if any
    match option_env!("SQUID_GIT_HASH") {
        Some(git_hash) if git_hash.len() >= 8 => git_hash[..8].to_string(),
        Some(git_hash) if !git_hash.is_empty() => git_hash.to_string(),
        _ => env!("CARGO_PKG_VERSION").to_string(),
    }
}

pub struct AppState {
    pub engine: Arc<VoteEngine>,
    pub webhook_secret: String,
}
