// =============================================================================
// Broker Port — the capability set every adapter implements
// =============================================================================
//
// Two adapters exist: the live OAuth vendor client (`zerodha`) and the
// deterministic in-process simulator (`paper`). Code that must branch on
// adapter identity (the OAuth paths) matches on `BrokerKind` instead of
// downcasting.
//
// Retry, timeout, and rate-limit behaviour is not implemented here; the
// policy layer in `policy.rs` wraps the outbound calls of adapters that
// talk to a network.
// =============================================================================

pub mod paper;
pub mod policy;
pub mod zerodha;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AccountSnapshot, Bar, Credential, Instrument, Order, OrderIntent, Position, Quote, Timeframe,
    Trade,
};

// =============================================================================
// Errors
// =============================================================================

/// Failure taxonomy for adapter operations.
///
/// Transient kinds (`NetworkFailed`, `VendorUnavailable`) are retried by the
/// policy layer with bounded backoff; everything else surfaces immediately.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Bad credentials or expired token. Never retried; for OAuth brokers
    /// this marks the session as needing re-authentication.
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("broker is not connected")]
    NotConnected,

    /// Transport-level failure (DNS, connect, timeout).
    #[error("network failure: {0}")]
    NetworkFailed(String),

    /// Vendor 5xx or equivalent outage.
    #[error("vendor unavailable: {0}")]
    VendorUnavailable(String),

    /// The per-endpoint-class token bucket stayed empty past the caller's
    /// patience budget.
    #[error("rate limited")]
    RateLimited,

    /// A quote older than one polling interval.
    #[error("quote is stale")]
    Stale,

    /// The vendor refused the order.
    #[error("order rejected: {reason}")]
    Rejected { reason: String },

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("instrument not found: {0}")]
    InstrumentNotFound(String),

    /// Any other vendor-reported error.
    #[error("vendor error ({status}): {message}")]
    Vendor { status: u16, message: String },

    /// Broken invariant inside the adapter itself.
    #[error("internal adapter error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Whether the policy layer may retry the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkFailed(_) | Self::VendorUnavailable(_))
    }
}

// =============================================================================
// Port types
// =============================================================================

/// Closed set of adapter identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Paper,
    Zerodha,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Zerodha => "zerodha",
        }
    }

    /// Whether this adapter authenticates via the OAuth round-trip.
    pub fn uses_oauth(&self) -> bool {
        matches!(self, Self::Zerodha)
    }
}

impl std::str::FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paper" => Ok(Self::Paper),
            "zerodha" => Ok(Self::Zerodha),
            other => Err(format!("unknown broker: {other}")),
        }
    }
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of `connect`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectResult {
    pub broker: BrokerKind,
    /// True when the adapter was already connected and the existing session
    /// was reused (connect is idempotent).
    pub already_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Fields an open order may be modified with.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderChanges {
    pub quantity: Option<u32>,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
}

/// Result of `cancel_order` / `modify_order`. Mutating a terminal order is
/// reported, not raised: terminal states are absorbing and the operation is
/// idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderMutation {
    Applied,
    AlreadyTerminal,
}

// =============================================================================
// The port
// =============================================================================

/// Typed interface every broker adapter implements.
///
/// All snapshot methods (`positions`, `orders`, `trades`,
/// `account_snapshot`) reflect broker state at call time.
#[async_trait]
pub trait Broker: Send + Sync {
    fn kind(&self) -> BrokerKind;

    /// Establish an authenticated session. Idempotent: connecting an
    /// already-connected adapter returns the existing session with
    /// `already_connected = true`.
    async fn connect(&self, credential: Credential) -> Result<ConnectResult, BrokerError>;

    /// Tear down the session. Safe to call after a failed `connect`.
    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Cheap and non-blocking.
    fn is_connected(&self) -> bool;

    async fn account_snapshot(&self) -> Result<AccountSnapshot, BrokerError>;

    /// A quote whose timestamp is within one polling interval, or
    /// [`BrokerError::Stale`].
    async fn quote(&self, instrument: &Instrument) -> Result<Quote, BrokerError>;

    /// Bars in ascending time order. When `to` falls inside the current
    /// unclosed interval the final bar is partial and flagged
    /// `is_final = false`.
    async fn historical_bars(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BrokerError>;

    /// Synchronous acknowledgement (broker order id), not a fill.
    async fn place_order(&self, intent: &OrderIntent) -> Result<String, BrokerError>;

    async fn modify_order(
        &self,
        order_id: &str,
        changes: OrderChanges,
    ) -> Result<OrderMutation, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<OrderMutation, BrokerError>;

    async fn positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn orders(&self) -> Result<Vec<Order>, BrokerError>;

    async fn trades(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Trade>, BrokerError>;

    /// The raw instrument master this adapter trades; consumed by the
    /// instrument catalog.
    async fn instruments(&self) -> Result<Vec<Instrument>, BrokerError>;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BrokerError::NetworkFailed("timeout".into()).is_transient());
        assert!(BrokerError::VendorUnavailable("502".into()).is_transient());
        assert!(!BrokerError::AuthFailed {
            reason: "expired".into()
        }
        .is_transient());
        assert!(!BrokerError::RateLimited.is_transient());
        assert!(!BrokerError::Rejected {
            reason: "margin".into()
        }
        .is_transient());
    }

    #[test]
    fn broker_kind_round_trip() {
        assert_eq!("paper".parse::<BrokerKind>().unwrap(), BrokerKind::Paper);
        assert_eq!(
            "zerodha".parse::<BrokerKind>().unwrap(),
            BrokerKind::Zerodha
        );
        assert!("binance".parse::<BrokerKind>().is_err());
        assert!(BrokerKind::Zerodha.uses_oauth());
        assert!(!BrokerKind::Paper.uses_oauth());
    }
}
