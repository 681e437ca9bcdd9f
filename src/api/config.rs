// =============================================================================
// Config Endpoints — current config, named variants, presets, validation
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::config::{presets, BotConfig, ConfigStore};

use super::auth::SessionAuth;
use super::error::ApiError;

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::internal(e.to_string())
}

/// `GET /api/config` — the active config (defaults when none saved yet).
pub async fn get_current(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .config_store
        .load_current()
        .map_err(internal)?
        .unwrap_or_default();
    Ok(Json(config))
}

/// `POST /api/config` — validate and persist the active config. Unknown
/// keys warn and are dropped; invariant violations are 400s.
pub async fn put_current(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let config = parse_and_validate(&body)?;
    state.config_store.save_current(&config).map_err(internal)?;
    Ok(Json(config))
}

/// `POST /api/config/validate` — dry-run validation.
pub async fn validate(
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let config = BotConfig::from_json(&body)
        .map_err(|e| ApiError::validation(format!("unparseable config: {e}")))?;
    let violations = config.validate();
    Ok(Json(serde_json::json!({
        "valid": violations.is_empty(),
        "violations": violations,
    })))
}

fn parse_and_validate(body: &serde_json::Value) -> Result<BotConfig, ApiError> {
    let config = BotConfig::from_json(body)
        .map_err(|e| ApiError::validation(format!("unparseable config: {e}")))?;
    let violations = config.validate();
    if let Some(first) = violations.first() {
        return Err(
            ApiError::validation(format!("{}: {}", first.field, first.message))
                .with_field(first.field.clone()),
        );
    }
    Ok(config)
}

/// `GET /api/config/list` — saved variant names.
pub async fn list_named(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let names = state.config_store.list_named().map_err(internal)?;
    Ok(Json(serde_json::json!({ "configs": names })))
}

/// `GET /api/config/:name`
pub async fn get_named(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !ConfigStore::is_valid_name(&name) {
        return Err(ApiError::validation("invalid config name").with_field("name"));
    }
    state
        .config_store
        .load_named(&name)
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no saved config named '{name}'")))
}

/// `POST /api/config/:name` — save the body as a named variant.
pub async fn put_named(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    if !ConfigStore::is_valid_name(&name) {
        return Err(ApiError::validation("invalid config name").with_field("name"));
    }
    let config = parse_and_validate(&body)?;
    state
        .config_store
        .save_named(&name, &config)
        .map_err(internal)?;
    Ok(Json(config))
}

/// `DELETE /api/config/:name`
pub async fn delete_named(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !ConfigStore::is_valid_name(&name) {
        return Err(ApiError::validation("invalid config name").with_field("name"));
    }
    let deleted = state.config_store.delete_named(&name).map_err(internal)?;
    if !deleted {
        return Err(ApiError::not_found(format!("no saved config named '{name}'")));
    }
    Ok(Json(serde_json::json!({ "deleted": name })))
}

#[derive(Serialize)]
struct Preset {
    name: String,
    config: BotConfig,
}

/// `GET /api/config/presets`
pub async fn get_presets() -> impl IntoResponse {
    let list: Vec<Preset> = presets()
        .into_iter()
        .map(|(name, config)| Preset { name, config })
        .collect();
    Json(list)
}
