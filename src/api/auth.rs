// =============================================================================
// Session Authentication — Axum extractor over server-issued tokens
// =============================================================================
//
// Mutating endpoints take a `SessionAuth` argument; the extractor validates
// the token from `X-Session-Token` (or `Authorization: Bearer ...`) against
// the session manager, refreshing its idle timer. Missing or expired
// tokens short-circuit with 401 before the handler body executes.
//
// Sessions are issued by `POST /api/session` and destroyed by
// `DELETE /api/session`; read-only endpoints stay open.
// =============================================================================

use std::sync::Arc;

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::debug;

use crate::app_state::AppState;

use super::error::ApiError;

/// Proof that the request carried a live session token.
pub struct SessionAuth(pub String);

fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(token) = parts
        .headers
        .get("x-session-token")
        .and_then(|v| v.to_str().ok())
    {
        return Some(token.to_string());
    }
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for SessionAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = token_from_parts(parts) else {
            debug!("request missing session token");
            return Err(ApiError::unauthorized("session token required"));
        };

        if !state.sessions.validate_and_touch(&token) {
            debug!("invalid or expired session token");
            return Err(ApiError::unauthorized("session token invalid or expired"));
        }

        Ok(SessionAuth(token))
    }
}

// =============================================================================
// Session endpoints
// =============================================================================

#[derive(Serialize)]
struct SessionResponse {
    token: String,
    idle_ttl_hours: i64,
}

/// `POST /api/session` — issue a fresh operator session.
pub async fn create_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let token = state.sessions.create();
    Json(SessionResponse {
        token,
        idle_ttl_hours: crate::session::DEFAULT_IDLE_TTL_HOURS,
    })
}

/// `DELETE /api/session` — log out the presented session.
pub async fn destroy_session(
    auth: SessionAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.sessions.destroy(&auth.0);
    Json(serde_json::json!({ "logged_out": true }))
}
