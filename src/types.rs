// =============================================================================
// Shared domain types used across the Meridian trading engine
// =============================================================================
//
// Everything here is a plain value type: adapters produce them, the
// supervisor owns collections of them, and the HTTP layer serialises them
// out to the dashboard. Mutation rules live with the owners, not here.
// =============================================================================

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Exchange / segment
// =============================================================================

/// Exchanges the engine recognises. Serialised as the vendor's upper-case
/// codes (`NSE`, `NFO`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    /// National Stock Exchange (equity).
    NSE,
    /// Bombay Stock Exchange (equity).
    BSE,
    /// NSE futures & options.
    NFO,
    /// BSE futures & options.
    BFO,
    /// Multi Commodity Exchange.
    MCX,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NSE => "NSE",
            Self::BSE => "BSE",
            Self::NFO => "NFO",
            Self::BFO => "BFO",
            Self::MCX => "MCX",
        }
    }
}

impl std::str::FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NSE" => Ok(Self::NSE),
            "BSE" => Ok(Self::BSE),
            "NFO" => Ok(Self::NFO),
            "BFO" => Ok(Self::BFO),
            "MCX" => Ok(Self::MCX),
            other => Err(format!("unknown exchange: {other}")),
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market segment an instrument trades in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Equity,
    Futures,
    Options,
    Currency,
    Commodity,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equity => "equity",
            Self::Futures => "futures",
            Self::Options => "options",
            Self::Currency => "currency",
            Self::Commodity => "commodity",
        }
    }
}

impl std::str::FromStr for Segment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "equity" | "eq" => Ok(Self::Equity),
            "futures" | "fut" => Ok(Self::Futures),
            "options" | "opt" => Ok(Self::Options),
            "currency" => Ok(Self::Currency),
            "commodity" => Ok(Self::Commodity),
            other => Err(format!("unknown segment: {other}")),
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Option contract type for derivative instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

// =============================================================================
// Instrument
// =============================================================================

/// A tradable contract from the broker's instrument master.
///
/// Identity is `(exchange, trading_symbol)`; the numeric `instrument_token`
/// is the broker-assigned stable id used for quote and history lookups.
/// Instruments are immutable between catalog refreshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub instrument_token: u32,
    pub exchange: Exchange,
    pub trading_symbol: String,
    /// Company / contract name; absent for many derivatives.
    #[serde(default)]
    pub name: Option<String>,
    pub segment: Segment,
    /// Exchange-defined minimum tradable quantity. Order quantities are
    /// multiples of this.
    pub lot_size: u32,
    /// Minimum price increment.
    pub tick_size: f64,
    #[serde(default)]
    pub expiry: Option<NaiveDate>,
    #[serde(default)]
    pub strike: Option<f64>,
    #[serde(default)]
    pub option_type: Option<OptionType>,
}

impl Instrument {
    /// `EXCHANGE:SYMBOL` form used in vendor quote requests and log lines.
    pub fn qualified_symbol(&self) -> String {
        format!("{}:{}", self.exchange, self.trading_symbol)
    }
}

/// An `(exchange, trading_symbol)` pair as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentRef {
    pub exchange: Exchange,
    pub trading_symbol: String,
}

impl std::fmt::Display for InstrumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.trading_symbol)
    }
}

// =============================================================================
// Quote / Bar / Timeframe
// =============================================================================

/// Point-in-time market snapshot for a single instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub instrument_token: u32,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Whether this quote was produced within the last `within` window.
    pub fn is_fresh(&self, within: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.timestamp) <= within
    }

    /// Bid/ask midpoint.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Bar timeframes the engine supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::D1 => "1d",
        }
    }

    /// Wall-clock length of one bar.
    pub fn duration(&self) -> Duration {
        match self {
            Self::M1 => Duration::minutes(1),
            Self::M3 => Duration::minutes(3),
            Self::M5 => Duration::minutes(5),
            Self::M15 => Duration::minutes(15),
            Self::M30 => Duration::minutes(30),
            Self::H1 => Duration::hours(1),
            Self::D1 => Duration::days(1),
        }
    }

    /// Interval string the vendor's historical-data API expects.
    pub fn vendor_interval(&self) -> &'static str {
        match self {
            Self::M1 => "minute",
            Self::M3 => "3minute",
            Self::M5 => "5minute",
            Self::M15 => "15minute",
            Self::M30 => "30minute",
            Self::H1 => "60minute",
            Self::D1 => "day",
        }
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::M1),
            "3m" => Ok(Self::M3),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "1d" => Ok(Self::D1),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single OHLCV bar. Bars are strictly time-ordered per
/// `(instrument, timeframe)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
    /// `false` when this is the trailing partial bar of an interval that has
    /// not closed yet.
    #[serde(default = "default_true")]
    pub is_final: bool,
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    /// Stop-loss limit: arms at the trigger, then rests as a limit order.
    Sl,
    /// Stop-loss market: arms at the trigger, then fills at market.
    SlM,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Product {
    /// Intraday margin product; positions square off same day.
    Mis,
    /// Cash-and-carry delivery (equity).
    Cnc,
    /// Overnight margin product (derivatives).
    Nrml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Day,
    Ioc,
}

/// A risk-sized prospective order, produced by the risk layer and handed to
/// a broker adapter. `stop_loss` and `take_profit` are tracked by the
/// supervisor when the broker holds no bracket of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: u32,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub product: Product,
    pub validity: Validity,
}

/// Broker-observed order lifecycle.
///
/// `pending -> open -> (complete | cancelled | rejected)`
///
/// `pending` is the local state between `place_order` returning an id and
/// the first status observation; every other transition is driven by the
/// broker. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    Complete,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Rejected)
    }

    /// Whether the `self -> next` transition is legal under the order state
    /// machine. Self-transitions are no-op observations and always legal.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Pending => true,
            Self::Open => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Broker-tracked instance of an [`OrderIntent`]. Mutated only from broker
/// observations (poll or callback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub broker_order_id: String,
    pub instrument_token: u32,
    pub trading_symbol: String,
    pub exchange: Exchange,
    pub side: Side,
    pub quantity: u32,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    pub product: Product,
    pub validity: Validity,
    pub status: OrderStatus,
    pub filled_qty: u32,
    pub avg_fill_price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

// =============================================================================
// Positions / trades / account
// =============================================================================

/// Net open exposure for one instrument. `net_quantity == 0` means flat;
/// transitioning through zero closes the position and may open the opposite
/// side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument_token: u32,
    pub trading_symbol: String,
    pub exchange: Exchange,
    /// Signed: positive long, negative short.
    pub net_quantity: i64,
    pub avg_entry_price: f64,
    pub last_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub product: Product,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.net_quantity == 0
    }

    /// Absolute rupee notional at the last mark.
    pub fn notional(&self) -> f64 {
        self.net_quantity.unsigned_abs() as f64 * self.last_price
    }
}

/// Immutable fill record. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub instrument_token: u32,
    pub trading_symbol: String,
    pub side: Side,
    pub quantity: u32,
    pub price: f64,
    pub fees: f64,
    pub timestamp: DateTime<Utc>,
}

/// Account-level funds snapshot derived from the broker on each poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: f64,
    pub cash_available: f64,
    pub margin_used: f64,
    pub margin_available: f64,
    pub realized_pnl_today: f64,
    pub unrealized_pnl: f64,
    pub currency: String,
}

// =============================================================================
// Bot lifecycle
// =============================================================================

/// Supervisor lifecycle state.
///
/// `stopped -> starting -> running -> (paused | stopping) -> stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Per-broker secret bundle. Stored only as vault ciphertext; adapters
/// receive it by value at connect time and never persist it.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub access_token_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("has_access_token", &self.access_token.is_some())
            .field("access_token_expiry", &self.access_token_expiry)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_round_trip() {
        for tf in [
            Timeframe::M1,
            Timeframe::M3,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::D1,
        ] {
            let parsed: Timeframe = tf.as_str().parse().unwrap();
            assert_eq!(parsed, tf);
        }
        assert!("2m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn timeframe_serde_uses_short_names() {
        let json = serde_json::to_string(&Timeframe::M5).unwrap();
        assert_eq!(json, "\"5m\"");
        let tf: Timeframe = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(tf, Timeframe::H1);
    }

    #[test]
    fn order_status_transitions() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Open));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Open.can_transition_to(Complete));
        assert!(Open.can_transition_to(Cancelled));
        assert!(!Complete.can_transition_to(Open));
        assert!(!Cancelled.can_transition_to(Complete));
        // Self-transitions are no-ops, always legal.
        assert!(Complete.can_transition_to(Complete));
        assert!(!Open.can_transition_to(Pending));
    }

    #[test]
    fn quote_freshness() {
        let now = Utc::now();
        let q = Quote {
            instrument_token: 1,
            bid: 99.0,
            ask: 101.0,
            last: 100.0,
            volume: 10,
            timestamp: now - Duration::seconds(10),
        };
        assert!(q.is_fresh(Duration::seconds(30), now));
        assert!(!q.is_fresh(Duration::seconds(5), now));
        assert!((q.mid() - 100.0).abs() < 1e-12);
    }

    #[test]
    fn credential_debug_redacts_secrets() {
        let cred = Credential {
            api_key: "kite_key".into(),
            api_secret: "kite_secret".into(),
            access_token: Some("tok".into()),
            access_token_expiry: None,
            refresh_token: None,
        };
        let dbg = format!("{cred:?}");
        assert!(!dbg.contains("kite_key"));
        assert!(!dbg.contains("kite_secret"));
        assert!(!dbg.contains("tok\""));
        assert!(dbg.contains("redacted"));
    }

    #[test]
    fn exchange_parse_is_case_insensitive() {
        assert_eq!("nse".parse::<Exchange>().unwrap(), Exchange::NSE);
        assert!("LSE".parse::<Exchange>().is_err());
    }

    #[test]
    fn position_notional_uses_abs_quantity() {
        let p = Position {
            instrument_token: 1,
            trading_symbol: "RELIANCE".into(),
            exchange: Exchange::NSE,
            net_quantity: -10,
            avg_entry_price: 2800.0,
            last_price: 2850.0,
            unrealized_pnl: -500.0,
            realized_pnl: 0.0,
            product: Product::Mis,
        };
        assert!((p.notional() - 28_500.0).abs() < 1e-9);
        assert!(!p.is_flat());
    }
}
