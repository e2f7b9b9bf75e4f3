use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use squid_server::config::Config;
use squid_server::relay::RelayClient;
use squid_server::status::StatusData;
use squid_server::voting::{Collaborators, SqliteRepository};
use squid_server::webhook::webhook_router;
use squid_server::{get_bot_version, AppState, VoteEngine};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "squid-votes",
        "version": get_bot_version()
    })))
}

async fn help_handler() -> Json<serde_json::Value> {
    Json(json!({
        "service": "squid-votes",
        "version": get_bot_version(),
        "description": "Weighted reaction votes on build changes and log deletions",
        "endpoints": [
            { "path": "/health", "method": "GET", "authentication": "None" },
            { "path": "/help", "method": "GET", "authentication": "None" },
            { "path": "/status", "method": "GET", "authentication": "None" },
            { "path": "/events/reaction", "method": "POST", "authentication": "X-Squid-Signature" },
            { "path": "/sessions/build", "method": "POST", "authentication": "X-Squid-Signature" },
            { "path": "/sessions/delete-log", "method": "POST", "authentication": "X-Squid-Signature" },
            { "path": "/sessions/cancel", "method": "POST", "authentication": "X-Squid-Signature" }
        ],
        "configuration": {
            "required_env_vars": [
                "SQUID_WEBHOOK_SECRET",
                "SQUID_RELAY_URL",
                "SQUID_RELAY_TOKEN",
                "SQUID_BOT_USER_ID"
            ],
            "optional_env_vars": [
                "PORT (default: 3000)",
                "STATE_DIR (default: current directory)",
                "DEFAULT_PASS_THRESHOLD (default: 3)",
                "DEFAULT_FAIL_THRESHOLD (default: 3)",
                "STAFF_VOTE_WEIGHT (default: 3)",
                "RUST_LOG (default: info)"
            ]
        }
    }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusData> {
    let sessions = state.engine.open_sessions().await;
    Json(StatusData::from_sessions(sessions, get_bot_version()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting vote service {}", get_bot_version());

    let config = Config::from_env().context("Failed to load configuration")?;

    let db_path = config.state_dir.join("squid-votes.db");
    info!("Using vote database: {}", db_path.display());
    let repository = SqliteRepository::new(&db_path)
        .with_context(|| format!("Failed to open vote database {}", db_path.display()))?;

    let relay = RelayClient::new(
        config.relay_url.clone(),
        config.relay_token.clone(),
        config.staff_vote_weight,
    )?;

    let engine = Arc::new(VoteEngine::new(
        Arc::new(repository),
        Collaborators::from_single(Arc::new(relay)),
        config.bot_user_id,
        config.default_thresholds,
    ));

    // Open sessions must be routable before the first event arrives
    let restored = engine
        .rehydrate()
        .await
        .context("Failed to restore open vote sessions")?;
    info!("Restored {} open vote session(s)", restored);

    let app_state = Arc::new(AppState {
        engine,
        webhook_secret: config.webhook_secret,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/help", get(help_handler))
        .route("/status", get(status_handler))
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
