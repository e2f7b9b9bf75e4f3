//! Signed HTTP endpoints called by the chat gateway relay.

use axum::{
    extract::{Extension, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use squid_core::{MessageId, SessionError, SessionId, SessionStatus, VoteSession};

use crate::voting::{
    EngineError, NewBuildChangeSession, NewDeleteLogSession, ReactionEvent, ReactionOutcome,
};
use crate::{AppState, CorrelationId};

pub const SIGNATURE_HEADER: &str = "x-squid-signature";

const MAX_BODY_BYTES: usize = 256 * 1024;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub message_id: MessageId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: Option<SessionId>,
    pub kind: String,
    pub status: String,
    pub message_ids: Vec<MessageId>,
}

impl From<&VoteSession> for SessionResponse {
    fn from(session: &VoteSession) -> Self {
        let status = match session.status() {
            SessionStatus::Open => "open".to_string(),
            SessionStatus::Closed { result } => result.as_str().to_string(),
        };
        Self {
            session_id: session.id(),
            kind: session.kind().to_string(),
            status,
            message_ids: session.message_ids().collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn engine_error(err: EngineError) -> ApiError {
    let status = match &err {
        EngineError::Session(SessionError::Closed) | EngineError::MessageInUse(_) => {
            StatusCode::CONFLICT
        }
        EngineError::Session(_) | EngineError::NoMessages => StatusCode::BAD_REQUEST,
        EngineError::UnknownMessage(_) => StatusCode::NOT_FOUND,
        EngineError::Repository(_) => {
            error!("Vote store failure: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// Check a `sha256=<hex>` signature over `payload` in constant time.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let correlation_id = CorrelationId(Uuid::new_v4().to_string());

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_signature(&state.webhook_secret, &bytes, signature) {
        warn!("Invalid webhook signature on {}", parts.uri.path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    let mut new_request = Request::from_parts(parts, axum::body::Body::from(bytes));
    new_request.extensions_mut().insert(correlation_id);

    Ok(next.run(new_request).await)
}

pub async fn reaction_handler(
    State(state): State<Arc<AppState>>,
    Extension(correlation_id): Extension<CorrelationId>,
    Json(event): Json<ReactionEvent>,
) -> Json<ReactionOutcome> {
    let span = info_span!(
        "reaction",
        correlation_id = %correlation_id.0,
        message_id = %event.message_id,
        user_id = %event.user_id
    );
    let outcome = state
        .engine
        .handle_reaction_event(&event)
        .instrument(span)
        .await;
    Json(outcome)
}

pub async fn create_build_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(correlation_id): Extension<CorrelationId>,
    Json(request): Json<NewBuildChangeSession>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let span = info_span!("create_build_session", correlation_id = %correlation_id.0);
    let session = state
        .engine
        .create_build_change_session(request)
        .instrument(span)
        .await
        .map_err(engine_error)?;
    info!("Created build vote session {:?}", session.id());
    Ok((StatusCode::CREATED, Json(SessionResponse::from(&session))))
}

pub async fn create_delete_log_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(correlation_id): Extension<CorrelationId>,
    Json(request): Json<NewDeleteLogSession>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let span = info_span!("create_delete_log_session", correlation_id = %correlation_id.0);
    let session = state
        .engine
        .create_delete_log_session(request)
        .instrument(span)
        .await
        .map_err(engine_error)?;
    info!("Created delete-log vote session {:?}", session.id());
    Ok((StatusCode::CREATED, Json(SessionResponse::from(&session))))
}

pub async fn cancel_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(correlation_id): Extension<CorrelationId>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let span = info_span!("cancel_session", correlation_id = %correlation_id.0);
    let session = state
        .engine
        .cancel_session(request.message_id)
        .instrument(span)
        .await
        .map_err(engine_error)?;
    Ok(Json(SessionResponse::from(&session)))
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/events/reaction", post(reaction_handler))
        .route("/sessions/build", post(create_build_session_handler))
        .route("/sessions/delete-log", post(create_delete_log_session_handler))
        .route("/sessions/cancel", post(cancel_session_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}
