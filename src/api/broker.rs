// =============================================================================
// Broker Endpoints — connect / disconnect / status and the OAuth round-trip
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::{AppState, OAuthPending};
use crate::broker::zerodha;
use crate::broker::BrokerKind;
use crate::types::Credential;

use super::auth::SessionAuth;
use super::error::ApiError;

// =============================================================================
// GET /api/broker/list
// =============================================================================

#[derive(Serialize)]
struct BrokerDescriptor {
    name: &'static str,
    display_name: &'static str,
    uses_oauth: bool,
    credential_fields: &'static [&'static str],
}

pub async fn list_brokers() -> impl IntoResponse {
    Json(vec![
        BrokerDescriptor {
            name: "paper",
            display_name: "Paper Trading Simulator",
            uses_oauth: false,
            credential_fields: &[],
        },
        BrokerDescriptor {
            name: "zerodha",
            display_name: "Zerodha Kite",
            uses_oauth: true,
            credential_fields: &["api_key", "api_secret"],
        },
    ])
}

// =============================================================================
// POST /api/broker/connect
// =============================================================================

#[derive(Deserialize)]
pub struct ConnectRequest {
    broker: String,
    #[serde(default)]
    credentials: Option<CredentialFields>,
}

#[derive(Deserialize, Default)]
pub struct CredentialFields {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_secret: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

pub async fn connect(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let kind: BrokerKind = request
        .broker
        .parse()
        .map_err(|_| ApiError::validation(format!("unknown broker '{}'", request.broker)).with_field("broker"))?;

    let credential = match kind {
        BrokerKind::Paper => Credential {
            api_key: String::new(),
            api_secret: String::new(),
            access_token: None,
            access_token_expiry: None,
            refresh_token: None,
        },
        BrokerKind::Zerodha => {
            let fields = request.credentials.unwrap_or_default();
            match (fields.api_key, fields.api_secret) {
                (Some(api_key), Some(api_secret)) => Credential {
                    api_key,
                    api_secret,
                    access_token: fields.access_token,
                    access_token_expiry: None,
                    refresh_token: None,
                },
                _ => {
                    // Fall back to a previously vaulted credential.
                    let vault = state.vault.as_ref().ok_or_else(|| {
                        ApiError::validation(
                            "api_key and api_secret required (no vault to fall back to)",
                        )
                        .with_field("credentials")
                    })?;
                    vault.load(kind.as_str())?
                }
            }
        }
    };

    let result = state.connect_broker(kind, credential.clone()).await?;

    // Persist what we connected with so a restart can reconnect.
    if kind.uses_oauth() {
        match state.vault.as_ref() {
            Some(vault) => vault.save(kind.as_str(), &credential)?,
            None => warn!("connected without a vault; credential not persisted"),
        }
    }

    state.activity.push(crate::activity::Activity::position(format!(
        "broker {} connected",
        kind
    )));

    Ok(Json(serde_json::json!({
        "broker": kind.as_str(),
        "connected": true,
        "already_connected": result.already_connected,
        "user_id": result.user_id,
    })))
}

// =============================================================================
// POST /api/broker/disconnect
// =============================================================================

pub async fn disconnect(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.disconnect_current().await?;
    Ok(Json(serde_json::json!({ "connected": false })))
}

// =============================================================================
// GET /api/broker/status
// =============================================================================

pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.catalog.snapshot();
    match state.current_broker() {
        Some((kind, adapter)) => Json(serde_json::json!({
            "broker": kind.as_str(),
            "connected": adapter.is_connected(),
            "catalog_instruments": snapshot.len(),
            "catalog_refreshed_at": snapshot.refreshed_at,
            "credential_saved": state
                .vault
                .as_ref()
                .map(|v| v.contains(kind.as_str()))
                .unwrap_or(false),
        })),
        None => Json(serde_json::json!({
            "broker": serde_json::Value::Null,
            "connected": false,
            "catalog_instruments": snapshot.len(),
        })),
    }
}

// =============================================================================
// OAuth round-trip
// =============================================================================

#[derive(Deserialize)]
pub struct OAuthInitiateRequest {
    broker: String,
    api_key: String,
    api_secret: String,
}

/// `POST /api/broker/oauth/initiate` — hand the operator the vendor's
/// authorization URL with a single-use state nonce.
pub async fn oauth_initiate(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
    Json(request): Json<OAuthInitiateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let kind: BrokerKind = request
        .broker
        .parse()
        .map_err(|_| ApiError::validation(format!("unknown broker '{}'", request.broker)).with_field("broker"))?;
    if !kind.uses_oauth() {
        return Err(
            ApiError::validation(format!("broker '{}' does not use OAuth", kind)).with_field("broker"),
        );
    }
    if request.api_key.trim().is_empty() {
        return Err(ApiError::validation("api_key must not be empty").with_field("api_key"));
    }
    if request.api_secret.trim().is_empty() {
        return Err(ApiError::validation("api_secret must not be empty").with_field("api_secret"));
    }

    let nonce = Uuid::new_v4().to_string();
    let url = zerodha::login_url(zerodha::DEFAULT_LOGIN_BASE, &request.api_key, &nonce);

    state.stash_oauth_state(
        nonce.clone(),
        OAuthPending {
            api_key: request.api_key,
            api_secret: request.api_secret,
            created_at: Instant::now(),
        },
    );

    info!(broker = %kind, "oauth flow initiated");
    Ok(Json(serde_json::json!({
        "authorization_url": url,
        "state": nonce,
    })))
}

#[derive(Deserialize)]
pub struct OAuthCallbackQuery {
    #[serde(default)]
    request_token: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

/// `GET /api/broker/oauth/callback` — complete the exchange. The nonce is
/// single-use: an unknown or replayed `state` is a 400 and the vault is
/// never touched.
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let request_token = query
        .request_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::validation("request_token missing").with_field("request_token"))?;
    let nonce = query
        .state
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::validation("state missing").with_field("state"))?;

    let pending = state.take_oauth_state(&nonce).ok_or_else(|| {
        ApiError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "stale-state",
            "unknown or already-used oauth state nonce",
        )
    })?;

    let http = reqwest::Client::new();
    let (access_token, user_id) = zerodha::exchange_request_token(
        &http,
        zerodha::DEFAULT_API_BASE,
        &pending.api_key,
        &pending.api_secret,
        &request_token,
    )
    .await?;

    let credential = Credential {
        api_key: pending.api_key,
        api_secret: pending.api_secret,
        access_token: Some(access_token),
        access_token_expiry: Some(zerodha::default_token_expiry(Utc::now())),
        refresh_token: None,
    };

    let result = state
        .connect_broker(BrokerKind::Zerodha, credential.clone())
        .await?;

    match state.vault.as_ref() {
        Some(vault) => vault.save(BrokerKind::Zerodha.as_str(), &credential)?,
        None => warn!("oauth completed without a vault; credential not persisted"),
    }

    state.activity.push(crate::activity::Activity::position(
        "zerodha authenticated via oauth",
    ));

    Ok(Json(serde_json::json!({
        "broker": "zerodha",
        "connected": true,
        "user_id": result.user_id.or(user_id),
    })))
}
