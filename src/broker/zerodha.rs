// =============================================================================
// Zerodha Broker Adapter — Kite-style OAuth vendor client
// =============================================================================
//
// Authentication is the vendor's two-leg OAuth flow: the control plane sends
// the operator to `login_url`, the vendor redirects back with a short-lived
// request token, and `exchange_request_token` trades
// `(api_key, api_secret, request_token)` for an access token using a
// SHA-256 checksum. Access tokens die at the vendor's daily cut-over
// (06:00 IST); use after expiry surfaces `AuthFailed` and flags the session
// for re-authentication.
//
// All outbound calls run through the policy layer (token buckets, retries,
// deadlines). Vendor payloads are parsed by hand from `serde_json::Value`;
// the instrument master arrives as CSV and is cached in memory for 24 h.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, TimeZone, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::types::{
    AccountSnapshot, Bar, Credential, Exchange, Instrument, OptionType, Order, OrderIntent,
    OrderStatus, OrderType, Position, Product, Quote, Segment, Side, Timeframe, Trade, Validity,
};

use super::policy::{EndpointClass, PolicyLayer};
use super::{Broker, BrokerError, BrokerKind, ConnectResult, OrderChanges, OrderMutation};

pub const DEFAULT_API_BASE: &str = "https://api.kite.trade";
pub const DEFAULT_LOGIN_BASE: &str = "https://kite.zerodha.com/connect/login";

/// Kite API protocol version header.
const KITE_VERSION: &str = "3";

/// Quotes older than this are refused as stale.
const QUOTE_STALE_AFTER_SECS: i64 = 60;

/// Tolerated adapter/vendor clock skew before a warning is logged.
const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// Instrument master cache lifetime.
const INSTRUMENT_CACHE_SECS: u64 = 24 * 3600;

/// IST (UTC+5:30), the vendor's wall clock.
fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 1800).expect("IST offset is valid")
}

// =============================================================================
// OAuth helpers (used by the control plane before an adapter session exists)
// =============================================================================

/// The vendor authorization URL the operator is redirected to. The `state`
/// nonce rides along in `redirect_params` and comes back on the callback.
pub fn login_url(login_base: &str, api_key: &str, state: &str) -> String {
    format!("{login_base}?v=3&api_key={api_key}&redirect_params=state%3D{state}")
}

/// `SHA256(api_key + request_token + api_secret)`, hex-encoded.
pub fn request_token_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Exchange a request token for an access token.
///
/// Returns `(access_token, user_id)`. Auth failures are terminal; transport
/// failures map to the transient kinds so callers may retry.
pub async fn exchange_request_token(
    http: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    api_secret: &str,
    request_token: &str,
) -> Result<(String, Option<String>), BrokerError> {
    let checksum = request_token_checksum(api_key, request_token, api_secret);
    let params = [
        ("api_key", api_key),
        ("request_token", request_token),
        ("checksum", checksum.as_str()),
    ];

    let response = http
        .post(format!("{base_url}/session/token"))
        .header("X-Kite-Version", KITE_VERSION)
        .form(&params)
        .send()
        .await
        .map_err(map_reqwest_error)?;

    let body = read_vendor_json(response).await?;
    let data = &body["data"];
    let access_token = data["access_token"]
        .as_str()
        .ok_or_else(|| BrokerError::Internal("token exchange response missing access_token".into()))?
        .to_string();
    let user_id = data["user_id"].as_str().map(str::to_string);

    info!(user = user_id.as_deref().unwrap_or("?"), "access token obtained");
    Ok((access_token, user_id))
}

/// Vendor access tokens lapse at the next 06:00 IST after issue.
pub fn default_token_expiry(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&ist());
    let cutover = local
        .date_naive()
        .and_hms_opt(6, 0, 0)
        .expect("06:00:00 is valid");
    let cutover = ist()
        .from_local_datetime(&cutover)
        .single()
        .expect("unambiguous IST time");
    let expiry = if local.time() < cutover.time() {
        cutover
    } else {
        cutover + ChronoDuration::days(1)
    };
    expiry.with_timezone(&Utc)
}

// =============================================================================
// Response plumbing
// =============================================================================

fn map_reqwest_error(err: reqwest::Error) -> BrokerError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        BrokerError::NetworkFailed(err.to_string())
    } else {
        BrokerError::Internal(err.to_string())
    }
}

/// Map a vendor HTTP response into JSON or the error taxonomy.
async fn read_vendor_json(response: reqwest::Response) -> Result<serde_json::Value, BrokerError> {
    let status = response.status();
    let text = response.text().await.map_err(map_reqwest_error)?;

    if status.is_success() {
        return serde_json::from_str(&text)
            .map_err(|e| BrokerError::Internal(format!("bad vendor json: {e}")));
    }

    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| text.chars().take(200).collect());

    match status.as_u16() {
        401 | 403 => Err(BrokerError::AuthFailed { reason: message }),
        429 => Err(BrokerError::RateLimited),
        s if s >= 500 => Err(BrokerError::VendorUnavailable(message)),
        s => Err(BrokerError::Vendor { status: s, message }),
    }
}

/// Vendor numbers arrive as either JSON numbers or strings.
fn value_f64(value: &serde_json::Value) -> f64 {
    if let Some(n) = value.as_f64() {
        n
    } else if let Some(s) = value.as_str() {
        s.parse().unwrap_or(0.0)
    } else {
        0.0
    }
}

fn value_u64(value: &serde_json::Value) -> u64 {
    if let Some(n) = value.as_u64() {
        n
    } else if let Some(s) = value.as_str() {
        s.parse().unwrap_or(0)
    } else {
        0
    }
}

/// Vendor timestamps are naive IST: `2024-05-01 09:15:00`.
fn parse_vendor_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok()?;
    ist()
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Historical candles carry an RFC 3339-ish offset (`+0530`).
fn parse_candle_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Map the vendor's order status strings onto the port's state machine.
fn map_order_status(vendor: &str) -> OrderStatus {
    match vendor {
        "COMPLETE" => OrderStatus::Complete,
        "CANCELLED" | "CANCELLED AMO" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        "PUT ORDER REQ RECEIVED" | "VALIDATION PENDING" | "OPEN PENDING" => OrderStatus::Pending,
        // OPEN, TRIGGER PENDING, MODIFY PENDING, and friends all count as
        // working orders.
        _ => OrderStatus::Open,
    }
}

fn order_type_to_vendor(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::Sl => "SL",
        OrderType::SlM => "SL-M",
    }
}

fn order_type_from_vendor(s: &str) -> OrderType {
    match s {
        "LIMIT" => OrderType::Limit,
        "SL" => OrderType::Sl,
        "SL-M" => OrderType::SlM,
        _ => OrderType::Market,
    }
}

fn product_to_vendor(product: Product) -> &'static str {
    match product {
        Product::Mis => "MIS",
        Product::Cnc => "CNC",
        Product::Nrml => "NRML",
    }
}

fn product_from_vendor(s: &str) -> Product {
    match s {
        "CNC" => Product::Cnc,
        "NRML" => Product::Nrml,
        _ => Product::Mis,
    }
}

fn side_to_vendor(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn side_from_vendor(s: &str) -> Side {
    if s == "SELL" {
        Side::Sell
    } else {
        Side::Buy
    }
}

fn validity_to_vendor(validity: Validity) -> &'static str {
    match validity {
        Validity::Day => "DAY",
        Validity::Ioc => "IOC",
    }
}

/// Segment strings in the master look like `NSE`, `NFO-OPT`, `MCX-FUT`.
fn segment_from_vendor(s: &str) -> Segment {
    if s.contains("OPT") {
        Segment::Options
    } else if s.contains("FUT") {
        Segment::Futures
    } else if s.starts_with("CDS") || s.starts_with("BCD") {
        Segment::Currency
    } else if s.starts_with("MCX") {
        Segment::Commodity
    } else {
        Segment::Equity
    }
}

// =============================================================================
// Instrument master CSV
// =============================================================================

/// Split one CSV line honouring double quotes (instrument names contain
/// commas).
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

/// Parse the vendor's instrument dump. Rows for exchanges the engine does
/// not model are skipped.
///
/// Column order: instrument_token, exchange_token, tradingsymbol, name,
/// last_price, expiry, strike, tick_size, lot_size, instrument_type,
/// segment, exchange.
fn parse_instrument_csv(csv: &str) -> Vec<Instrument> {
    let mut instruments = Vec::new();
    for line in csv.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(line);
        if fields.len() < 12 {
            continue;
        }

        let Ok(exchange) = fields[11].trim().parse::<Exchange>() else {
            continue;
        };
        let Ok(instrument_token) = fields[0].trim().parse::<u32>() else {
            continue;
        };

        let name = fields[3].trim();
        let expiry = NaiveDate::parse_from_str(fields[5].trim(), "%Y-%m-%d").ok();
        let strike: f64 = fields[6].trim().parse().unwrap_or(0.0);
        let option_type = match fields[9].trim() {
            "CE" => Some(OptionType::Call),
            "PE" => Some(OptionType::Put),
            _ => None,
        };

        instruments.push(Instrument {
            instrument_token,
            exchange,
            trading_symbol: fields[2].trim().to_string(),
            name: (!name.is_empty()).then(|| name.to_string()),
            segment: segment_from_vendor(fields[10].trim()),
            lot_size: fields[8].trim().parse().unwrap_or(1),
            tick_size: fields[7].trim().parse().unwrap_or(0.05),
            expiry,
            strike: (strike > 0.0).then_some(strike),
            option_type,
        });
    }
    instruments
}

// =============================================================================
// The adapter
// =============================================================================

struct LiveSession {
    api_key: String,
    access_token: String,
    expires_at: DateTime<Utc>,
    user_id: Option<String>,
}

pub struct ZerodhaBroker {
    http: reqwest::Client,
    base_url: String,
    policy: PolicyLayer,
    session: RwLock<Option<LiveSession>>,
    instrument_cache: RwLock<Option<(Instant, Arc<Vec<Instrument>>)>>,
}

impl ZerodhaBroker {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_API_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with static config");
        Self {
            http,
            base_url: base_url.into(),
            policy: PolicyLayer::new(),
            session: RwLock::new(None),
            instrument_cache: RwLock::new(None),
        }
    }

    /// `Authorization` header value, or the auth error that explains why
    /// there is none. An expired token clears the session so the operator
    /// is pushed back through OAuth.
    fn auth_header(&self) -> Result<String, BrokerError> {
        {
            let guard = self.session.read();
            let Some(session) = guard.as_ref() else {
                return Err(BrokerError::NotConnected);
            };
            if Utc::now() < session.expires_at {
                return Ok(format!(
                    "token {}:{}",
                    session.api_key, session.access_token
                ));
            }
        }
        // Read guard released before taking the write lock.
        *self.session.write() = None;
        Err(BrokerError::AuthFailed {
            reason: "access token expired, re-authentication required".to_string(),
        })
    }

    async fn get_json(
        &self,
        class: EndpointClass,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, BrokerError> {
        let auth = self.auth_header()?;
        let url = format!("{}{}", self.base_url, path);
        self.policy
            .run(class, || {
                let request = self
                    .http
                    .get(&url)
                    .header("X-Kite-Version", KITE_VERSION)
                    .header("Authorization", &auth)
                    .query(query);
                async move {
                    let response = request.send().await.map_err(map_reqwest_error)?;
                    read_vendor_json(response).await
                }
            })
            .await
    }

    async fn send_form(
        &self,
        class: EndpointClass,
        method: reqwest::Method,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<serde_json::Value, BrokerError> {
        let auth = self.auth_header()?;
        let url = format!("{}{}", self.base_url, path);
        self.policy
            .run(class, || {
                let request = self
                    .http
                    .request(method.clone(), &url)
                    .header("X-Kite-Version", KITE_VERSION)
                    .header("Authorization", &auth)
                    .form(form);
                async move {
                    let response = request.send().await.map_err(map_reqwest_error)?;
                    read_vendor_json(response).await
                }
            })
            .await
    }

    async fn get_text(&self, class: EndpointClass, path: &str) -> Result<String, BrokerError> {
        let auth = self.auth_header()?;
        let url = format!("{}{}", self.base_url, path);
        self.policy
            .run(class, || {
                let request = self
                    .http
                    .get(&url)
                    .header("X-Kite-Version", KITE_VERSION)
                    .header("Authorization", &auth);
                async move {
                    let response = request.send().await.map_err(map_reqwest_error)?;
                    let status = response.status();
                    let text = response.text().await.map_err(map_reqwest_error)?;
                    if status.is_success() {
                        Ok(text)
                    } else if status.as_u16() >= 500 {
                        Err(BrokerError::VendorUnavailable(format!("status {status}")))
                    } else {
                        Err(BrokerError::Vendor {
                            status: status.as_u16(),
                            message: text.chars().take(200).collect(),
                        })
                    }
                }
            })
            .await
    }

    /// Is the referenced order already terminal on the vendor side? Used to
    /// classify modify/cancel failures as `AlreadyTerminal`.
    async fn order_is_terminal(&self, order_id: &str) -> bool {
        match self.orders().await {
            Ok(orders) => orders
                .iter()
                .find(|o| o.broker_order_id == order_id)
                .map(|o| o.status.is_terminal())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn parse_order(value: &serde_json::Value) -> Order {
        let quantity = value_u64(&value["quantity"]) as u32;
        let filled_qty = value_u64(&value["filled_quantity"]) as u32;
        let mut status = map_order_status(value["status"].as_str().unwrap_or(""));

        // A terminal claim with quantity still outstanding is reported as
        // cancelled: the remainder will never fill.
        if status == OrderStatus::Complete && filled_qty < quantity {
            status = OrderStatus::Cancelled;
        }

        let created_at = value["order_timestamp"]
            .as_str()
            .and_then(parse_vendor_timestamp)
            .unwrap_or_else(Utc::now);
        let updated_at = value["exchange_update_timestamp"]
            .as_str()
            .and_then(parse_vendor_timestamp)
            .unwrap_or(created_at);

        let price = value_f64(&value["price"]);
        let trigger = value_f64(&value["trigger_price"]);

        Order {
            broker_order_id: value["order_id"].as_str().unwrap_or("").to_string(),
            instrument_token: value_u64(&value["instrument_token"]) as u32,
            trading_symbol: value["tradingsymbol"].as_str().unwrap_or("").to_string(),
            exchange: value["exchange"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Exchange::NSE),
            side: side_from_vendor(value["transaction_type"].as_str().unwrap_or("BUY")),
            quantity,
            order_type: order_type_from_vendor(value["order_type"].as_str().unwrap_or("MARKET")),
            price: (price > 0.0).then_some(price),
            trigger_price: (trigger > 0.0).then_some(trigger),
            product: product_from_vendor(value["product"].as_str().unwrap_or("MIS")),
            validity: if value["validity"].as_str() == Some("IOC") {
                Validity::Ioc
            } else {
                Validity::Day
            },
            status,
            filled_qty,
            avg_fill_price: value_f64(&value["average_price"]),
            created_at,
            updated_at,
            rejection_reason: value["status_message"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }
}

impl Default for ZerodhaBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for ZerodhaBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Zerodha
    }

    async fn connect(&self, credential: Credential) -> Result<ConnectResult, BrokerError> {
        if self.is_connected() {
            let user_id = self.session.read().as_ref().and_then(|s| s.user_id.clone());
            return Ok(ConnectResult {
                broker: BrokerKind::Zerodha,
                already_connected: true,
                user_id,
            });
        }

        let access_token = credential.access_token.ok_or(BrokerError::AuthFailed {
            reason: "no access token; complete the OAuth flow first".to_string(),
        })?;
        let expires_at = credential
            .access_token_expiry
            .unwrap_or_else(|| default_token_expiry(Utc::now()));
        if Utc::now() >= expires_at {
            return Err(BrokerError::AuthFailed {
                reason: "access token expired, re-authentication required".to_string(),
            });
        }

        *self.session.write() = Some(LiveSession {
            api_key: credential.api_key.clone(),
            access_token,
            expires_at,
            user_id: None,
        });

        // Validate the token with a cheap profile read; an auth failure here
        // clears the session again.
        let profile = match self
            .get_json(EndpointClass::Quotes, "/user/profile", &[])
            .await
        {
            Ok(profile) => profile,
            Err(err) => {
                *self.session.write() = None;
                return Err(err);
            }
        };

        let user_id = profile["data"]["user_id"].as_str().map(str::to_string);
        if let Some(session) = self.session.write().as_mut() {
            session.user_id = user_id.clone();
        }

        info!(user = user_id.as_deref().unwrap_or("?"), "zerodha session established");
        Ok(ConnectResult {
            broker: BrokerKind::Zerodha,
            already_connected: false,
            user_id,
        })
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        // Best-effort vendor-side invalidation, then drop local state.
        let session_creds = self
            .session
            .read()
            .as_ref()
            .map(|session| (session.api_key.clone(), session.access_token.clone()));
        if let Some((api_key, access_token)) = session_creds {
            let url = format!(
                "{}/session/token?api_key={}&access_token={}",
                self.base_url, api_key, access_token
            );
            let _ = self
                .http
                .delete(&url)
                .header("X-Kite-Version", KITE_VERSION)
                .send()
                .await;
        }
        *self.session.write() = None;
        info!("zerodha session closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .map(|s| Utc::now() < s.expires_at)
            .unwrap_or(false)
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        let body = self
            .get_json(EndpointClass::Quotes, "/user/margins", &[])
            .await?;
        let equity_segment = &body["data"]["equity"];

        let margin_available = value_f64(&equity_segment["net"]);
        let margin_used = value_f64(&equity_segment["utilised"]["debits"]);
        Ok(AccountSnapshot {
            equity: margin_available + margin_used,
            cash_available: value_f64(&equity_segment["available"]["cash"]),
            margin_used,
            margin_available,
            realized_pnl_today: value_f64(&equity_segment["utilised"]["m2m_realised"]),
            unrealized_pnl: value_f64(&equity_segment["utilised"]["m2m_unrealised"]),
            currency: "INR".to_string(),
        })
    }

    async fn quote(&self, instrument: &Instrument) -> Result<Quote, BrokerError> {
        let key = instrument.qualified_symbol();
        let body = self
            .get_json(EndpointClass::Quotes, "/quote", &[("i", key.clone())])
            .await?;
        let data = &body["data"][&key];
        if data.is_null() {
            return Err(BrokerError::InstrumentNotFound(key));
        }

        let now = Utc::now();
        let timestamp = data["timestamp"]
            .as_str()
            .and_then(parse_vendor_timestamp)
            .unwrap_or(now);

        let skew = (now - timestamp).num_seconds();
        if skew.abs() > MAX_CLOCK_SKEW_SECS && skew < QUOTE_STALE_AFTER_SECS {
            warn!(
                symbol = %key,
                skew_seconds = skew,
                "vendor clock skew beyond tolerance"
            );
        }
        if skew > QUOTE_STALE_AFTER_SECS {
            return Err(BrokerError::Stale);
        }

        let last = value_f64(&data["last_price"]);
        let bid = value_f64(&data["depth"]["buy"][0]["price"]);
        let ask = value_f64(&data["depth"]["sell"][0]["price"]);

        Ok(Quote {
            instrument_token: instrument.instrument_token,
            // Thinly traded books can miss a side; fall back to last.
            bid: if bid > 0.0 { bid } else { last },
            ask: if ask > 0.0 { ask } else { last },
            last,
            volume: value_u64(&data["volume"]),
            timestamp,
        })
    }

    async fn historical_bars(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BrokerError> {
        let fmt = "%Y-%m-%d %H:%M:%S";
        let path = format!(
            "/instruments/historical/{}/{}",
            instrument.instrument_token,
            timeframe.vendor_interval()
        );
        let query = [
            ("from", from.with_timezone(&ist()).format(fmt).to_string()),
            ("to", to.with_timezone(&ist()).format(fmt).to_string()),
        ];
        let body = self.get_json(EndpointClass::History, &path, &query).await?;

        let candles = body["data"]["candles"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let now = Utc::now();
        let mut bars = Vec::with_capacity(candles.len());
        for candle in &candles {
            let Some(fields) = candle.as_array() else {
                continue;
            };
            if fields.len() < 6 {
                warn!(len = fields.len(), "skipping malformed candle row");
                continue;
            }
            let Some(timestamp) = fields[0].as_str().and_then(parse_candle_timestamp) else {
                continue;
            };
            bars.push(Bar {
                open: value_f64(&fields[1]),
                high: value_f64(&fields[2]),
                low: value_f64(&fields[3]),
                close: value_f64(&fields[4]),
                volume: value_u64(&fields[5]),
                timestamp,
                is_final: timestamp + timeframe.duration() <= now,
            });
        }

        debug!(
            symbol = %instrument.trading_symbol,
            timeframe = %timeframe,
            count = bars.len(),
            "historical bars fetched"
        );
        Ok(bars)
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<String, BrokerError> {
        let mut form = vec![
            ("tradingsymbol", intent.instrument.trading_symbol.clone()),
            ("exchange", intent.instrument.exchange.to_string()),
            ("transaction_type", side_to_vendor(intent.side).to_string()),
            ("order_type", order_type_to_vendor(intent.order_type).to_string()),
            ("quantity", intent.quantity.to_string()),
            ("product", product_to_vendor(intent.product).to_string()),
            ("validity", validity_to_vendor(intent.validity).to_string()),
        ];
        if let Some(price) = intent.price {
            form.push(("price", format!("{price:.2}")));
        }
        if let Some(trigger) = intent.trigger_price {
            form.push(("trigger_price", format!("{trigger:.2}")));
        }

        let result = self
            .send_form(
                EndpointClass::Orders,
                reqwest::Method::POST,
                "/orders/regular",
                &form,
            )
            .await;

        match result {
            Ok(body) => {
                let order_id = body["data"]["order_id"]
                    .as_str()
                    .ok_or_else(|| {
                        BrokerError::Internal("order response missing order_id".into())
                    })?
                    .to_string();
                info!(
                    order_id = %order_id,
                    symbol = %intent.instrument.trading_symbol,
                    side = %intent.side,
                    qty = intent.quantity,
                    "order placed"
                );
                Ok(order_id)
            }
            // The vendor signals refusals as plain 400s; surface them as
            // rejections with the vendor's reason.
            Err(BrokerError::Vendor { status: 400, message }) => {
                Err(BrokerError::Rejected { reason: message })
            }
            Err(err) => Err(err),
        }
    }

    async fn modify_order(
        &self,
        order_id: &str,
        changes: OrderChanges,
    ) -> Result<OrderMutation, BrokerError> {
        let mut form = Vec::new();
        if let Some(qty) = changes.quantity {
            form.push(("quantity", qty.to_string()));
        }
        if let Some(price) = changes.price {
            form.push(("price", format!("{price:.2}")));
        }
        if let Some(trigger) = changes.trigger_price {
            form.push(("trigger_price", format!("{trigger:.2}")));
        }

        let path = format!("/orders/regular/{order_id}");
        match self
            .send_form(EndpointClass::Orders, reqwest::Method::PUT, &path, &form)
            .await
        {
            Ok(_) => Ok(OrderMutation::Applied),
            Err(BrokerError::Vendor { status: 400, .. })
                if self.order_is_terminal(order_id).await =>
            {
                Ok(OrderMutation::AlreadyTerminal)
            }
            Err(err) => Err(err),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderMutation, BrokerError> {
        let path = format!("/orders/regular/{order_id}");
        match self
            .send_form(EndpointClass::Orders, reqwest::Method::DELETE, &path, &[])
            .await
        {
            Ok(_) => Ok(OrderMutation::Applied),
            Err(BrokerError::Vendor { status: 400, .. })
                if self.order_is_terminal(order_id).await =>
            {
                Ok(OrderMutation::AlreadyTerminal)
            }
            Err(err) => Err(err),
        }
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let body = self
            .get_json(EndpointClass::Quotes, "/portfolio/positions", &[])
            .await?;
        let net = body["data"]["net"].as_array().cloned().unwrap_or_default();

        Ok(net
            .iter()
            .map(|p| Position {
                instrument_token: value_u64(&p["instrument_token"]) as u32,
                trading_symbol: p["tradingsymbol"].as_str().unwrap_or("").to_string(),
                exchange: p["exchange"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Exchange::NSE),
                net_quantity: p["quantity"].as_i64().unwrap_or(0),
                avg_entry_price: value_f64(&p["average_price"]),
                last_price: value_f64(&p["last_price"]),
                unrealized_pnl: value_f64(&p["unrealised"]),
                realized_pnl: value_f64(&p["realised"]),
                product: product_from_vendor(p["product"].as_str().unwrap_or("MIS")),
            })
            .collect())
    }

    async fn orders(&self) -> Result<Vec<Order>, BrokerError> {
        let body = self.get_json(EndpointClass::Quotes, "/orders", &[]).await?;
        let orders = body["data"].as_array().cloned().unwrap_or_default();
        Ok(orders.iter().map(Self::parse_order).collect())
    }

    async fn trades(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Trade>, BrokerError> {
        let body = self.get_json(EndpointClass::Quotes, "/trades", &[]).await?;
        let trades = body["data"].as_array().cloned().unwrap_or_default();

        Ok(trades
            .iter()
            .filter_map(|t| {
                let timestamp = t["fill_timestamp"]
                    .as_str()
                    .or_else(|| t["order_timestamp"].as_str())
                    .and_then(parse_vendor_timestamp)?;
                if let Some(since) = since {
                    if timestamp <= since {
                        return None;
                    }
                }
                Some(Trade {
                    trade_id: t["trade_id"].as_str().unwrap_or("").to_string(),
                    order_id: t["order_id"].as_str().unwrap_or("").to_string(),
                    instrument_token: value_u64(&t["instrument_token"]) as u32,
                    trading_symbol: t["tradingsymbol"].as_str().unwrap_or("").to_string(),
                    side: side_from_vendor(t["transaction_type"].as_str().unwrap_or("BUY")),
                    quantity: value_u64(&t["quantity"]) as u32,
                    price: value_f64(&t["average_price"]),
                    fees: 0.0,
                    timestamp,
                })
            })
            .collect())
    }

    async fn instruments(&self) -> Result<Vec<Instrument>, BrokerError> {
        if let Some((fetched_at, cached)) = self.instrument_cache.read().as_ref() {
            if fetched_at.elapsed().as_secs() < INSTRUMENT_CACHE_SECS {
                return Ok(cached.as_ref().clone());
            }
        }

        let csv = self.get_text(EndpointClass::History, "/instruments").await?;
        let instruments = parse_instrument_csv(&csv);
        info!(count = instruments.len(), "instrument master refreshed");

        *self.instrument_cache.write() =
            Some((Instant::now(), Arc::new(instruments.clone())));
        Ok(instruments)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_sha256_of_concatenation() {
        // sha256("abc") is a well-known vector; key="a", token="b", secret="c".
        let checksum = request_token_checksum("a", "b", "c");
        assert_eq!(
            checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn login_url_carries_state() {
        let url = login_url(DEFAULT_LOGIN_BASE, "my_key", "nonce123");
        assert!(url.starts_with("https://kite.zerodha.com/connect/login?v=3"));
        assert!(url.contains("api_key=my_key"));
        assert!(url.contains("state%3Dnonce123"));
    }

    #[test]
    fn token_expiry_is_next_six_am_ist() {
        // 2024-05-01 10:00 IST == 04:30 UTC: past the cut-over, expire
        // tomorrow 06:00 IST (00:30 UTC).
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 4, 30, 0).unwrap();
        let expiry = default_token_expiry(now);
        assert_eq!(expiry, Utc.with_ymd_and_hms(2024, 5, 2, 0, 30, 0).unwrap());

        // 2024-05-01 05:00 IST == 2024-04-30 23:30 UTC: before the cut-over,
        // expire today 06:00 IST.
        let early = Utc.with_ymd_and_hms(2024, 4, 30, 23, 30, 0).unwrap();
        let expiry = default_token_expiry(early);
        assert_eq!(expiry, Utc.with_ymd_and_hms(2024, 5, 1, 0, 30, 0).unwrap());
    }

    #[test]
    fn order_status_mapping() {
        assert_eq!(map_order_status("COMPLETE"), OrderStatus::Complete);
        assert_eq!(map_order_status("CANCELLED"), OrderStatus::Cancelled);
        assert_eq!(map_order_status("REJECTED"), OrderStatus::Rejected);
        assert_eq!(
            map_order_status("PUT ORDER REQ RECEIVED"),
            OrderStatus::Pending
        );
        assert_eq!(map_order_status("OPEN"), OrderStatus::Open);
        assert_eq!(map_order_status("TRIGGER PENDING"), OrderStatus::Open);
    }

    #[test]
    fn parse_order_reports_partial_terminal_as_cancelled() {
        let value = serde_json::json!({
            "order_id": "240501000001",
            "tradingsymbol": "RELIANCE",
            "exchange": "NSE",
            "instrument_token": 738561,
            "transaction_type": "BUY",
            "quantity": 100,
            "filled_quantity": 40,
            "status": "COMPLETE",
            "order_type": "LIMIT",
            "price": 2800.5,
            "trigger_price": 0,
            "product": "MIS",
            "validity": "DAY",
            "average_price": 2800.1,
            "order_timestamp": "2024-05-01 10:15:00",
        });
        let order = ZerodhaBroker::parse_order(&value);
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.filled_qty, 40);
        assert_eq!(order.price, Some(2800.5));
        assert_eq!(order.trigger_price, None);
        assert_eq!(order.side, Side::Buy);
    }

    #[test]
    fn parse_order_full_fill_stays_complete() {
        let value = serde_json::json!({
            "order_id": "240501000002",
            "tradingsymbol": "TCS",
            "exchange": "NSE",
            "instrument_token": 2953217,
            "transaction_type": "SELL",
            "quantity": 10,
            "filled_quantity": 10,
            "status": "COMPLETE",
            "order_type": "MARKET",
            "price": 0,
            "trigger_price": 0,
            "product": "CNC",
            "validity": "DAY",
            "average_price": 3900.0,
            "order_timestamp": "2024-05-01 09:30:00",
        });
        let order = ZerodhaBroker::parse_order(&value);
        assert_eq!(order.status, OrderStatus::Complete);
        assert_eq!(order.product, Product::Cnc);
        assert_eq!(order.side, Side::Sell);
    }

    #[test]
    fn vendor_timestamp_parses_as_ist() {
        let ts = parse_vendor_timestamp("2024-05-01 09:15:00").unwrap();
        // 09:15 IST == 03:45 UTC.
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 1, 3, 45, 0).unwrap());
    }

    #[test]
    fn candle_timestamp_parses_offset() {
        let ts = parse_candle_timestamp("2024-05-01T09:15:00+0530").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 1, 3, 45, 0).unwrap());
    }

    #[test]
    fn instrument_csv_parsing() {
        let csv = "\
instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
738561,2885,RELIANCE,\"RELIANCE INDUSTRIES\",2800.0,,0.0,0.05,1,EQ,NSE,NSE
12345602,48225,NIFTY24MAYFUT,\"NIFTY\",22500.0,2024-05-30,0.0,0.05,50,FUT,NFO-FUT,NFO
12345858,48226,NIFTY24MAY22500CE,\"NIFTY\",120.5,2024-05-30,22500.0,0.05,50,CE,NFO-OPT,NFO
99999,1,FOO,\"Foo Corp\",1.0,,0.0,0.01,1,EQ,XNYS,XNYS
";
        let instruments = parse_instrument_csv(csv);
        // The XNYS row is skipped: unknown exchange.
        assert_eq!(instruments.len(), 3);

        let reliance = &instruments[0];
        assert_eq!(reliance.instrument_token, 738_561);
        assert_eq!(reliance.exchange, Exchange::NSE);
        assert_eq!(reliance.segment, Segment::Equity);
        assert_eq!(reliance.lot_size, 1);
        assert_eq!(reliance.expiry, None);

        let future = &instruments[1];
        assert_eq!(future.segment, Segment::Futures);
        assert_eq!(future.lot_size, 50);
        assert!(future.expiry.is_some());

        let option = &instruments[2];
        assert_eq!(option.segment, Segment::Options);
        assert_eq!(option.strike, Some(22_500.0));
        assert!(matches!(option.option_type, Some(OptionType::Call)));
    }

    #[test]
    fn csv_splitter_honours_quotes() {
        let fields = split_csv_line("1,2,\"a, b\",3");
        assert_eq!(fields, vec!["1", "2", "a, b", "3"]);
    }

    #[test]
    fn disconnected_adapter_reports_not_connected() {
        let broker = ZerodhaBroker::new();
        assert!(!broker.is_connected());
        assert!(matches!(
            broker.auth_header(),
            Err(BrokerError::NotConnected)
        ));
    }

    #[test]
    fn expired_session_clears_and_reports_auth_failed() {
        let broker = ZerodhaBroker::new();
        *broker.session.write() = Some(LiveSession {
            api_key: "k".into(),
            access_token: "t".into(),
            expires_at: Utc::now() - ChronoDuration::minutes(1),
            user_id: None,
        });
        assert!(!broker.is_connected());
        assert!(matches!(
            broker.auth_header(),
            Err(BrokerError::AuthFailed { .. })
        ));
        // The stale session was dropped so the operator re-authenticates.
        assert!(broker.session.read().is_none());
    }
}
