// =============================================================================
// HTTP Control Plane — Axum router under /api
// =============================================================================
//
// All payloads are JSON. Read-only endpoints are open; every mutating
// endpoint requires a session token (the `SessionAuth` extractor) and all
// endpoints pass the per-class rate limiter. The control plane performs no
// business logic: it validates inputs and routes to the supervisor, the
// vault, the catalog, and the current adapter.
// =============================================================================

pub mod auth;
pub mod bot;
pub mod broker;
pub mod config;
pub mod error;
pub mod instruments;
pub mod rate_limit;

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

/// Build the full API router with CORS and rate-limit middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health & session ─────────────────────────────────────────
        .route("/api/health", get(health))
        .route(
            "/api/session",
            post(auth::create_session).delete(auth::destroy_session),
        )
        // ── Broker ───────────────────────────────────────────────────
        .route("/api/broker/list", get(broker::list_brokers))
        .route("/api/broker/connect", post(broker::connect))
        .route("/api/broker/disconnect", post(broker::disconnect))
        .route("/api/broker/status", get(broker::status))
        .route("/api/broker/oauth/initiate", post(broker::oauth_initiate))
        .route("/api/broker/oauth/callback", get(broker::oauth_callback))
        // ── Instruments ──────────────────────────────────────────────
        .route("/api/instruments", get(instruments::search))
        .route("/api/instruments/quote/:trading_symbol", get(instruments::quote))
        .route("/api/instruments/:instrument_token", get(instruments::by_token))
        // ── Config ───────────────────────────────────────────────────
        .route("/api/config", get(config::get_current).post(config::put_current))
        .route("/api/config/list", get(config::list_named))
        .route("/api/config/presets", get(config::get_presets))
        .route("/api/config/validate", post(config::validate))
        .route(
            "/api/config/:name",
            get(config::get_named)
                .post(config::put_named)
                .delete(config::delete_named),
        )
        // ── Bot ──────────────────────────────────────────────────────
        .route("/api/bot/start", post(bot::start))
        .route("/api/bot/stop", post(bot::stop))
        .route("/api/bot/restart", post(bot::restart))
        .route("/api/bot/status", get(bot::status))
        .route("/api/bot/account", get(bot::account))
        .route("/api/bot/positions", get(bot::positions))
        .route("/api/bot/positions/:trading_symbol", delete(bot::close_position))
        .route("/api/bot/trades", get(bot::trades))
        .route("/api/bot/activities", get(bot::activities))
        .route("/api/bot/activities/clear", post(bot::clear_activities))
        // ── Middleware & state ───────────────────────────────────────
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
        "broker_connected": state
            .current_broker()
            .map(|(_, b)| b.is_connected())
            .unwrap_or(false),
    }))
}
