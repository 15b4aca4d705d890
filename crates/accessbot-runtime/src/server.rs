use std::net::SocketAddr;
use std::sync::Arc;

use accessbot_contracts::{AccessRequest, RequestState, StateUpdate};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authority::{get_access_request, AccessRequestAuthority};
use crate::error::{Error, ErrorKind};
use crate::job::Readiness;
use crate::plugin::MessageCache;

type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    authority: Arc<dyn AccessRequestAuthority>,
    cache: Arc<MessageCache>,
    ready: Readiness,
}

impl AppState {
    pub fn new(
        authority: Arc<dyn AccessRequestAuthority>,
        cache: Arc<MessageCache>,
        ready: Readiness,
    ) -> Self {
        Self {
            authority,
            cache,
            ready,
        }
    }
}

pub async fn serve(
    listen_addr: &str,
    state: AppState,
    cancel: CancellationToken,
) -> Result<(), String> {
    let addr: SocketAddr = listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "callback server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/ready", get(ready))
        .route("/v1/requests/{id}/review", post(review))
        .with_state(state)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.ready.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[derive(Debug, Deserialize)]
struct ReviewInput {
    action: String,
    reviewer: String,
    #[serde(default)]
    reason: Option<String>,
}

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({"error": {"code": code, "message": message.into()}})),
    )
}

async fn review(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ReviewInput>,
) -> Result<Json<Value>, ApiError> {
    let target = match input.action.as_str() {
        "approve" => RequestState::Approved,
        "deny" => RequestState::Denied,
        other => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                format!("unknown action {other:?}; expected approve or deny"),
            ))
        }
    };
    if input.reviewer.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "reviewer is required",
        ));
    }

    let request = lookup(&state, &id).await?;
    if request.state.is_resolved() {
        return Err(already_resolved(&id, request.state));
    }

    let update = StateUpdate {
        state: target,
        delegator: input.reviewer.clone(),
        reason: input.reason.unwrap_or_default(),
    };
    if let Err(err) = state.authority.set_access_request_state(&id, update).await {
        return Err(rejected(&state, &id, err).await);
    }
    // The entry stays cached until the authority accepted the change.
    if let Err(err) = state.cache.pop(&id) {
        debug!(request_id = %id, error = %err, "cache closed after review");
    }
    info!(request_id = %id, reviewer = %input.reviewer, state = %target, "access request reviewed");
    Ok(Json(json!({"request_id": id, "state": target})))
}

fn already_resolved(id: &str, current: RequestState) -> ApiError {
    api_error(
        StatusCode::CONFLICT,
        "already_resolved",
        format!("access request {id} is already {current}"),
    )
}

fn expired(id: &str) -> ApiError {
    api_error(
        StatusCode::GONE,
        "request_expired",
        format!("access request {id} is unknown or expired"),
    )
}

/// Cached copy first, then the authority.
async fn lookup(state: &AppState, id: &str) -> Result<AccessRequest, ApiError> {
    match state.cache.get(id) {
        Ok(Some(cached)) => return Ok(cached.request),
        Ok(None) => {}
        Err(err) => {
            return Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "shutting_down",
                err.to_string(),
            ))
        }
    }
    get_access_request(state.authority.as_ref(), id)
        .await
        .map_err(|err| {
            if err.is_not_found() {
                expired(id)
            } else {
                api_error(StatusCode::BAD_GATEWAY, "authority_error", err.to_string())
            }
        })
}

/// Explains a refused state change. The cached snapshot may be stale, so a
/// refusal is checked against the authority's current copy.
async fn rejected(state: &AppState, id: &str, err: Error) -> ApiError {
    if err.is_not_found() {
        return expired(id);
    }
    if err.kind() == ErrorKind::BadParameter {
        match get_access_request(state.authority.as_ref(), id).await {
            Ok(current) if current.state.is_resolved() => {
                return already_resolved(id, current.state)
            }
            Err(fetch) if fetch.is_not_found() => return expired(id),
            _ => {}
        }
    }
    warn!(request_id = %id, error = %err, "failed to resolve access request");
    api_error(StatusCode::BAD_GATEWAY, "authority_error", err.to_string())
}
