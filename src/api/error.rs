// =============================================================================
// API Error Shape — `{ error: { code, message, field? } }`
// =============================================================================
//
// Every handler funnels failures through `ApiError` so the dashboard sees
// one stable shape. Codes are kebab-case; the HTTP status carries the
// class: 400 validation, 401 auth, 403 forbidden, 404 not found, 409 state
// conflict, 429 rate limited, 500 internal, 503 broker unreachable.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::broker::BrokerError;
use crate::supervisor::ControlError;
use crate::vault::VaultError;

#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ApiErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorBody {
                code: code.to_string(),
                message: message.into(),
                field: None,
            },
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.body.field = Some(field.into());
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not-found", message)
    }

    pub fn conflict(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.body });
        (self.status, Json(body)).into_response()
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match &err {
            BrokerError::AuthFailed { reason } => Self::new(
                StatusCode::UNAUTHORIZED,
                "auth-failed",
                format!("broker authentication failed: {reason}"),
            ),
            BrokerError::NotConnected => Self::conflict(
                "broker-not-connected",
                "no broker session; connect a broker first",
            ),
            BrokerError::NetworkFailed(_) | BrokerError::VendorUnavailable(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "broker-unreachable",
                err.to_string(),
            ),
            BrokerError::RateLimited => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate-limited",
                "broker rate limit exceeded, try again shortly",
            ),
            BrokerError::Stale => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "stale-quote",
                "quote is stale",
            ),
            BrokerError::Rejected { reason } => Self::new(
                StatusCode::BAD_REQUEST,
                "order-rejected",
                format!("order rejected: {reason}"),
            ),
            BrokerError::OrderNotFound(id) => Self::not_found(format!("order {id} not found")),
            BrokerError::InstrumentNotFound(symbol) => {
                Self::not_found(format!("instrument {symbol} not found"))
            }
            BrokerError::Vendor { .. } | BrokerError::Internal(_) => {
                Self::internal(err.to_string())
            }
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        match &err {
            VaultError::NotFound(broker) => {
                Self::not_found(format!("no stored credential for {broker}"))
            }
            VaultError::DecryptFailed(broker) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "decrypt-failed",
                format!("credential for {broker} could not be decrypted; wrong master key?"),
            ),
            VaultError::Io(_) | VaultError::Serde(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match &err {
            ControlError::InvalidConfig { violations } => {
                let first = violations.first();
                let mut api = Self::validation(
                    first
                        .map(|v| format!("{}: {}", v.field, v.message))
                        .unwrap_or_else(|| "config invalid".to_string()),
                );
                if let Some(v) = first {
                    api = api.with_field(v.field.clone());
                }
                api
            }
            ControlError::BrokerNotConnected => Self::conflict(
                "broker-not-connected",
                "broker must be connected before starting the bot",
            ),
            ControlError::NoSuchPosition { trading_symbol } => {
                Self::not_found(format!("no open position for {trading_symbol}"))
            }
            ControlError::Internal { message } => Self::internal(message.clone()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_errors_map_to_expected_statuses() {
        let e: ApiError = BrokerError::NotConnected.into();
        assert_eq!(e.status, StatusCode::CONFLICT);
        assert_eq!(e.body.code, "broker-not-connected");

        let e: ApiError = BrokerError::RateLimited.into();
        assert_eq!(e.status, StatusCode::TOO_MANY_REQUESTS);

        let e: ApiError = BrokerError::VendorUnavailable("down".into()).into();
        assert_eq!(e.status, StatusCode::SERVICE_UNAVAILABLE);

        let e: ApiError = BrokerError::AuthFailed {
            reason: "expired".into(),
        }
        .into();
        assert_eq!(e.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn control_errors_carry_field() {
        let e: ApiError = ControlError::InvalidConfig {
            violations: vec![crate::config::ConfigViolation {
                field: "risk_per_trade_percent".into(),
                message: "must be in (0, 5]".into(),
            }],
        }
        .into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.body.field.as_deref(), Some("risk_per_trade_percent"));
    }

    #[test]
    fn error_body_serialises_to_stable_shape() {
        let e = ApiError::validation("bad input").with_field("timeframe");
        let json = serde_json::json!({ "error": e.body });
        assert_eq!(json["error"]["code"], "validation");
        assert_eq!(json["error"]["field"], "timeframe");
        assert!(json["error"]["message"].is_string());
    }
}
