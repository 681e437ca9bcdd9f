// =============================================================================
// Instrument Endpoints — catalog search and live quotes
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::catalog::SearchQuery;
use crate::types::{Exchange, InstrumentRef, Segment};

use super::error::ApiError;

#[derive(Deserialize)]
pub struct InstrumentSearchParams {
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    segment: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

/// `GET /api/instruments?search=&exchange=&segment=&limit=&offset=`
pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<InstrumentSearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let exchange = params
        .exchange
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Exchange>()
                .map_err(|e| ApiError::validation(e).with_field("exchange"))
        })
        .transpose()?;
    let segment = params
        .segment
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Segment>()
                .map_err(|e| ApiError::validation(e).with_field("segment"))
        })
        .transpose()?;

    let query = SearchQuery {
        text: params.search,
        exchange,
        segment,
        limit: params.limit.unwrap_or(50),
        offset: params.offset.unwrap_or(0),
    };
    let (instruments, total) = state.catalog.search(&query);

    Ok(Json(serde_json::json!({
        "total": total,
        "count": instruments.len(),
        "offset": query.offset,
        "instruments": instruments,
    })))
}

/// `GET /api/instruments/:instrument_token`
pub async fn by_token(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let token: u32 = token
        .parse()
        .map_err(|_| ApiError::validation("instrument_token must be numeric").with_field("instrument_token"))?;

    state
        .catalog
        .get_by_token(token)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("instrument token {token} not in catalog")))
}

#[derive(Deserialize)]
pub struct QuoteParams {
    #[serde(default)]
    exchange: Option<String>,
}

/// `GET /api/instruments/quote/:trading_symbol`
///
/// The exchange defaults to NSE; pass `?exchange=` for the rest.
pub async fn quote(
    State(state): State<Arc<AppState>>,
    Path(trading_symbol): Path<String>,
    Query(params): Query<QuoteParams>,
) -> Result<impl IntoResponse, ApiError> {
    let exchange = params
        .exchange
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Exchange>()
                .map_err(|e| ApiError::validation(e).with_field("exchange"))
        })
        .transpose()?
        .unwrap_or(Exchange::NSE);

    let instrument = state
        .catalog
        .resolve(&InstrumentRef {
            exchange,
            trading_symbol: trading_symbol.clone(),
        })
        .ok_or_else(|| {
            ApiError::not_found(format!("{exchange}:{trading_symbol} not in catalog"))
        })?;

    let (_, adapter) = state
        .current_broker()
        .ok_or_else(|| ApiError::conflict("broker-not-connected", "connect a broker first"))?;

    let quote = adapter.quote(&instrument).await?;
    Ok(Json(serde_json::json!({
        "instrument": instrument,
        "quote": quote,
    })))
}
