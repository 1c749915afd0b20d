//! HTTP action boundary.
//!
//! Three POST endpoints, one per action kind, plus a health probe. Every
//! action requires either a single-action token bound to the endpoint's
//! kind or the static service secret in `x-service-secret`. Token claims
//! win over request fields: a token's conversation binds the action, and
//! a body that names a different conversation is rejected.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::{ActionKind, TokenService};
use crate::client::MessagingClient;
use crate::connection::{ConnectionHealth, ConnectionManager};
use crate::error::{AuthError, ClientError};

const SERVICE_SECRET_HEADER: &str = "x-service-secret";

pub struct ApiState {
    pub connection: Arc<ConnectionManager>,
    pub tokens: TokenService,
}

/// Build the action router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/actions/send", post(send_action))
        .route("/actions/reply", post(reply_action))
        .route("/actions/react", post(react_action))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(router: Router, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind action api to {addr}"))?;
    tracing::info!(%addr, "action api listening");
    axum::serve(listener, router)
        .await
        .context("action api server failed")?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    token: Option<String>,
    conversation_id: Option<String>,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ReplyRequest {
    token: Option<String>,
    conversation_id: Option<String>,
    reference: Option<String>,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ReactRequest {
    token: Option<String>,
    conversation_id: Option<String>,
    reference: Option<String>,
    emoji: String,
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    message_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

async fn health(State(state): State<Arc<ApiState>>) -> Json<ConnectionHealth> {
    Json(state.connection.health().await)
}

async fn send_action(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let grant = authorize(&state, &headers, request.token.as_deref(), ActionKind::Send)?;
    let conversation_id = grant.conversation(request.conversation_id)?;
    let client = connected_client(&state).await?;
    let message_id = client
        .send_text(&conversation_id, &request.content)
        .await
        .map_err(send_failed)?;
    tracing::info!(%conversation_id, %message_id, "api sent message");
    Ok(Json(ActionResponse { message_id }))
}

async fn reply_action(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<ReplyRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let grant = authorize(&state, &headers, request.token.as_deref(), ActionKind::Reply)?;
    let conversation_id = grant.conversation(request.conversation_id)?;
    let reference = grant.reference(request.reference)?;
    let client = connected_client(&state).await?;
    let message_id = client
        .send_reply(&conversation_id, &reference, &request.content)
        .await
        .map_err(send_failed)?;
    tracing::info!(%conversation_id, %reference, %message_id, "api sent reply");
    Ok(Json(ActionResponse { message_id }))
}

async fn react_action(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<ReactRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let grant = authorize(&state, &headers, request.token.as_deref(), ActionKind::React)?;
    let conversation_id = grant.conversation(request.conversation_id)?;
    let reference = grant.reference(request.reference)?;
    let client = connected_client(&state).await?;
    let message_id = client
        .send_reaction(&conversation_id, &reference, &request.emoji)
        .await
        .map_err(send_failed)?;
    tracing::info!(%conversation_id, %reference, %message_id, "api sent reaction");
    Ok(Json(ActionResponse { message_id }))
}

/// What an authorized request is allowed to touch. Claims are `None` on
/// the service-secret path, where the request body names the targets.
struct Grant {
    conversation_id: Option<String>,
    reference: Option<String>,
}

impl Grant {
    /// Resolve the conversation, claims first. A body that contradicts
    /// the token's binding is rejected.
    fn conversation(&self, from_body: Option<String>) -> Result<String, ApiError> {
        match (&self.conversation_id, from_body) {
            (Some(bound), Some(requested)) if *bound != requested => Err(forbidden(
                "token is bound to a different conversation",
            )),
            (Some(bound), _) => Ok(bound.clone()),
            (None, Some(requested)) => Ok(requested),
            (None, None) => Err(bad_request("missing conversation_id")),
        }
    }

    fn reference(&self, from_body: Option<String>) -> Result<String, ApiError> {
        self.reference
            .clone()
            .or(from_body)
            .ok_or_else(|| bad_request("missing reference"))
    }
}

fn authorize(
    state: &ApiState,
    headers: &HeaderMap,
    token: Option<&str>,
    action: ActionKind,
) -> Result<Grant, ApiError> {
    if let Some(presented) = headers
        .get(SERVICE_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        if state.tokens.bypass_allowed(presented) {
            return Ok(Grant {
                conversation_id: None,
                reference: None,
            });
        }
        return Err(unauthorized("invalid service secret"));
    }

    let token = token.ok_or_else(|| unauthorized("missing action token"))?;
    match state.tokens.validate_for(token, action) {
        Ok(claims) => Ok(Grant {
            conversation_id: Some(claims.conversation_id),
            reference: claims.reference,
        }),
        Err(error @ AuthError::ActionMismatch { .. }) => Err(forbidden(&error.to_string())),
        Err(error @ AuthError::Signing(_)) => {
            tracing::error!(%error, "token verification could not run");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: error.to_string(),
                }),
            ))
        }
        Err(error) => Err(unauthorized(&error.to_string())),
    }
}

async fn connected_client(state: &ApiState) -> Result<Arc<dyn MessagingClient>, ApiError> {
    state.connection.handle().try_get().await.ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: ClientError::NotConnected.to_string(),
        }),
    ))
}

fn send_failed(error: ClientError) -> ApiError {
    tracing::error!(%error, "outbound action failed");
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn unauthorized(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn forbidden(message: &str) -> ApiError {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}
