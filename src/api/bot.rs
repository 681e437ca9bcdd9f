// =============================================================================
// Bot Endpoints — lifecycle commands and observability
// =============================================================================
//
// Handlers never touch trading state directly: lifecycle commands go to the
// supervisor over its command channel, and reads come back as copy-on-read
// snapshots. The handlers' only jobs are input validation, instrument
// resolution, and error shaping.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::activity::ActivityKind;
use crate::app_state::AppState;
use crate::broker::BrokerKind;
use crate::config::BotConfig;
use crate::types::{BotState, Instrument};

use super::auth::SessionAuth;
use super::error::ApiError;

/// Resolve the active config and its instruments for a start.
fn prepare_start(state: &AppState) -> Result<(BotConfig, BrokerKind, Vec<Instrument>), ApiError> {
    let config = state
        .config_store
        .load_current()
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| {
            ApiError::validation("no configuration saved; POST /api/config first")
        })?;

    let kind: BrokerKind = config
        .effective_broker()
        .parse()
        .map_err(|e: String| ApiError::validation(e).with_field("broker"))?;

    let mut instruments = Vec::with_capacity(config.instruments.len());
    for reference in &config.instruments {
        match state.catalog.resolve(reference) {
            Some(instrument) => instruments.push(instrument),
            None => {
                return Err(ApiError::validation(format!(
                    "instrument {reference} not found in catalog; is the broker connected?"
                ))
                .with_field("instruments"));
            }
        }
    }

    Ok((config, kind, instruments))
}

/// `POST /api/bot/start`
pub async fn start(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let (config, kind, instruments) = prepare_start(&state)?;

    let (current_kind, adapter) = state
        .current_broker()
        .ok_or_else(|| ApiError::conflict("broker-not-connected", "connect a broker first"))?;
    if current_kind != kind {
        return Err(ApiError::conflict(
            "broker-mismatch",
            format!("config wants '{kind}' but '{current_kind}' is connected"),
        ));
    }

    let ack = state.supervisor.start(config, adapter, instruments).await?;
    Ok(Json(ack))
}

/// `POST /api/bot/stop`
pub async fn stop(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let ack = state.supervisor.stop().await?;
    Ok(Json(ack))
}

/// `POST /api/bot/restart`
pub async fn restart(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.supervisor.stop().await?;

    let (config, kind, instruments) = prepare_start(&state)?;
    let (current_kind, adapter) = state
        .current_broker()
        .ok_or_else(|| ApiError::conflict("broker-not-connected", "connect a broker first"))?;
    if current_kind != kind {
        return Err(ApiError::conflict(
            "broker-mismatch",
            format!("config wants '{kind}' but '{current_kind}' is connected"),
        ));
    }

    let ack = state.supervisor.start(config, adapter, instruments).await?;
    Ok(Json(ack))
}

/// `GET /api/bot/status`
pub async fn status(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.supervisor.snapshot().await?;
    Ok(Json(serde_json::json!({
        "state": snapshot.state,
        "running": snapshot.state == BotState::Running,
        "paused": snapshot.state == BotState::Paused,
        "pnl_today": snapshot.pnl_today,
        "daily_loss_limit": snapshot.daily_loss_limit,
        "open_positions": snapshot.positions.iter().filter(|p| !p.is_flat()).count(),
        "last_tick_at": snapshot.last_tick_at,
        "started_at": snapshot.started_at,
        "config": snapshot.config,
    })))
}

/// `GET /api/bot/account`
pub async fn account(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let (_, adapter) = state
        .current_broker()
        .ok_or_else(|| ApiError::conflict("broker-not-connected", "connect a broker first"))?;
    let snapshot = adapter.account_snapshot().await?;
    Ok(Json(snapshot))
}

/// `GET /api/bot/positions`
pub async fn positions(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.supervisor.snapshot().await?;
    Ok(Json(snapshot.positions))
}

#[derive(Deserialize)]
pub struct TradesParams {
    #[serde(default)]
    since: Option<chrono::DateTime<chrono::Utc>>,
}

/// `GET /api/bot/trades`
pub async fn trades(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TradesParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (_, adapter) = state
        .current_broker()
        .ok_or_else(|| ApiError::conflict("broker-not-connected", "connect a broker first"))?;
    let trades = adapter.trades(params.since).await?;
    Ok(Json(trades))
}

#[derive(Deserialize)]
pub struct ActivitiesParams {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    kind: Option<String>,
}

/// `GET /api/bot/activities`
pub async fn activities(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ActivitiesParams>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = params
        .kind
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<ActivityKind>()
                .map_err(|e| ApiError::validation(e).with_field("kind"))
        })
        .transpose()?;

    let limit = params.limit.unwrap_or(100).min(1_000);
    Ok(Json(state.activity.recent(limit, kind)))
}

/// `POST /api/bot/activities/clear`
pub async fn clear_activities(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.activity.clear();
    Json(serde_json::json!({ "cleared": true }))
}

/// `DELETE /api/bot/positions/:trading_symbol` — request a close for one
/// position.
pub async fn close_position(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
    Path(trading_symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let symbol = trading_symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(ApiError::validation("trading_symbol must not be empty")
            .with_field("trading_symbol"));
    }
    let ack = state.supervisor.close_position(symbol).await?;
    Ok(Json(ack))
}
