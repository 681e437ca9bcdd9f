// =============================================================================
// Paper Broker — deterministic in-process simulator
// =============================================================================
//
// Implements the same port as the live adapter with no external I/O:
//
//   - Quotes come from a pseudo-random walk seeded by
//     `(instrument_token, epoch_second)`, so repeat runs at the same second
//     reproduce identical prices.
//   - `market` fills at the opposite side of the current quote, `limit`
//     fills on the next simulated tick whose opposing price touches the
//     limit (price-time priority), `sl` / `sl_m` arm at the trigger and
//     then behave as limit / market.
//   - Fills produce Trades; positions use weighted-average entry and
//     realise P&L when quantity crosses through zero.
//
// The simulator advances its own clock to wall-clock time on every call
// (bumped by at least a millisecond so `updated_at` stays monotone) and
// counts a logical tick per call; an order placed on tick T rests from
// tick T+1 and can fill from tick T+2.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::types::{
    AccountSnapshot, Bar, Credential, Exchange, Instrument, Order, OrderIntent, OrderStatus,
    OrderType, Position, Product, Quote, Segment, Side, Timeframe, Trade,
};

use super::{Broker, BrokerError, BrokerKind, ConnectResult, OrderChanges, OrderMutation};

/// Default starting balance in rupees.
pub const DEFAULT_STARTING_BALANCE: f64 = 100_000.0;

/// Flat brokerage charged per executed order.
const FEE_PER_ORDER: f64 = 20.0;

// =============================================================================
// Internal state
// =============================================================================

struct PaperOrder {
    order: Order,
    /// Tick at which the order was accepted.
    placed_tick: u64,
    /// Stop orders rest dormant until the last price crosses the trigger.
    armed: bool,
}

struct PaperState {
    connected: bool,
    cash: f64,
    realized_pnl_today: f64,
    orders: Vec<PaperOrder>,
    trades: Vec<Trade>,
    positions: HashMap<u32, Position>,
    /// Instruments seen via quotes/orders, used for marking and bar synthesis.
    instruments: HashMap<u32, Instrument>,
    order_seq: u64,
    trade_seq: u64,
    clock: DateTime<Utc>,
    tick: u64,
}

// =============================================================================
// PaperBroker
// =============================================================================

pub struct PaperBroker {
    state: Mutex<PaperState>,
    starting_balance: f64,
}

impl PaperBroker {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                connected: false,
                cash: starting_balance,
                realized_pnl_today: 0.0,
                orders: Vec::new(),
                trades: Vec::new(),
                positions: HashMap::new(),
                instruments: HashMap::new(),
                order_seq: 0,
                trade_seq: 0,
                clock: Utc.timestamp_opt(0, 0).unwrap(),
                tick: 0,
            }),
            starting_balance,
        }
    }

    /// Preload a realised P&L figure, e.g. to exercise the daily loss gate.
    pub fn seed_realized_pnl(&self, pnl: f64) {
        let mut state = self.state.lock();
        state.realized_pnl_today += pnl;
        state.cash += pnl;
    }

    // -------------------------------------------------------------------------
    // Synthetic market data
    // -------------------------------------------------------------------------

    /// Deterministic last price for `(instrument_token, epoch_second)`:
    /// a slow intraday sine drift plus seeded per-second noise around a
    /// token-derived base price.
    pub fn synthetic_last(instrument_token: u32, epoch_second: i64) -> f64 {
        let base = 50.0 + (instrument_token % 40_000) as f64 / 10.0;

        let day_fraction = (epoch_second.rem_euclid(86_400)) as f64 / 86_400.0;
        let drift = (day_fraction * std::f64::consts::TAU).sin() * 0.01;

        let seed = (instrument_token as u64)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .wrapping_add(epoch_second as u64);
        let mut rng = StdRng::seed_from_u64(seed);
        let noise: f64 = rng.gen_range(-0.004..0.004);

        base * (1.0 + drift + noise)
    }

    fn synthetic_quote(instrument: &Instrument, at: DateTime<Utc>) -> Quote {
        let second = at.timestamp();
        let last = Self::synthetic_last(instrument.instrument_token, second);
        let half_spread = (instrument.tick_size.max(0.05)) / 2.0;

        let seed = (instrument.instrument_token as u64)
            .wrapping_mul(0x2545_f491_4f6c_dd1d)
            .wrapping_add(second as u64);
        let mut rng = StdRng::seed_from_u64(seed);

        Quote {
            instrument_token: instrument.instrument_token,
            bid: last - half_spread,
            ask: last + half_spread,
            last,
            volume: rng.gen_range(10_000..500_000),
            timestamp: at,
        }
    }

    // -------------------------------------------------------------------------
    // Simulation pump
    // -------------------------------------------------------------------------

    /// Advance the clock, count a tick, and run one matching pass. Runs on
    /// every port call so resting orders match without an external driver.
    fn pump(state: &mut PaperState) {
        let wall = Utc::now();
        state.clock = if wall > state.clock {
            wall
        } else {
            state.clock + ChronoDuration::milliseconds(1)
        };
        state.tick += 1;

        let now = state.clock;
        let tick = state.tick;

        // Pending orders placed on an earlier tick start resting.
        for entry in &mut state.orders {
            if entry.order.status == OrderStatus::Pending && tick > entry.placed_tick + 1 {
                entry.order.status = OrderStatus::Open;
                entry.order.updated_at = now;
            }
        }

        // Price-time priority: the order Vec is insertion-ordered, so a
        // single oldest-first pass preserves time priority at equal prices.
        let mut fills: Vec<(usize, f64)> = Vec::new();
        for (idx, entry) in state.orders.iter_mut().enumerate() {
            if entry.order.status != OrderStatus::Open || tick <= entry.placed_tick + 2 {
                continue;
            }
            let Some(instrument) = state.instruments.get(&entry.order.instrument_token) else {
                continue;
            };
            let quote = Self::synthetic_quote(instrument, now);

            // Stop orders first arm at the trigger crossing.
            if matches!(entry.order.order_type, OrderType::Sl | OrderType::SlM) && !entry.armed {
                let trigger = entry.order.trigger_price.unwrap_or(0.0);
                let crossed = match entry.order.side {
                    Side::Buy => quote.last >= trigger,
                    Side::Sell => quote.last <= trigger,
                };
                if crossed {
                    entry.armed = true;
                    entry.order.updated_at = now;
                } else {
                    continue;
                }
            }

            let fill_price = match entry.order.order_type {
                OrderType::Market => Some(match entry.order.side {
                    Side::Buy => quote.ask,
                    Side::Sell => quote.bid,
                }),
                OrderType::SlM if entry.armed => Some(match entry.order.side {
                    Side::Buy => quote.ask,
                    Side::Sell => quote.bid,
                }),
                OrderType::Limit | OrderType::Sl => {
                    let limit = entry.order.price.unwrap_or(0.0);
                    match entry.order.side {
                        // Buy fills when the ask touches the limit.
                        Side::Buy if quote.ask <= limit => Some(quote.ask),
                        // Sell fills when the bid touches the limit.
                        Side::Sell if quote.bid >= limit => Some(quote.bid),
                        _ => None,
                    }
                }
                _ => None,
            };

            if let Some(price) = fill_price {
                fills.push((idx, price));
            }
        }

        for (idx, price) in fills {
            Self::fill_order(state, idx, price);
        }

        // Mark open positions to the current synthetic quote.
        let marks: Vec<(u32, f64)> = state
            .positions
            .keys()
            .filter_map(|token| {
                state
                    .instruments
                    .get(token)
                    .map(|inst| (*token, Self::synthetic_quote(inst, now).last))
            })
            .collect();
        for (token, last) in marks {
            if let Some(pos) = state.positions.get_mut(&token) {
                pos.last_price = last;
                pos.unrealized_pnl = (last - pos.avg_entry_price) * pos.net_quantity as f64;
            }
        }
    }

    /// Execute a full fill at `price` and book the trade and position.
    fn fill_order(state: &mut PaperState, idx: usize, price: f64) {
        let now = state.clock;
        state.trade_seq += 1;
        let trade_id = format!("PT{:08}", state.trade_seq);

        let (order_id, token, symbol, exchange, side, qty, product) = {
            let entry = &mut state.orders[idx];
            entry.order.status = OrderStatus::Complete;
            entry.order.filled_qty = entry.order.quantity;
            entry.order.avg_fill_price = price;
            entry.order.updated_at = now;
            (
                entry.order.broker_order_id.clone(),
                entry.order.instrument_token,
                entry.order.trading_symbol.clone(),
                entry.order.exchange,
                entry.order.side,
                entry.order.quantity,
                entry.order.product,
            )
        };

        state.trades.push(Trade {
            trade_id,
            order_id: order_id.clone(),
            instrument_token: token,
            trading_symbol: symbol.clone(),
            side,
            quantity: qty,
            price,
            fees: FEE_PER_ORDER,
            timestamp: now,
        });

        // Cash: buys pay, sells collect; fees always debit.
        let signed_qty = match side {
            Side::Buy => qty as i64,
            Side::Sell => -(qty as i64),
        };
        state.cash -= signed_qty as f64 * price;
        state.cash -= FEE_PER_ORDER;
        state.realized_pnl_today -= FEE_PER_ORDER;

        let position = state.positions.entry(token).or_insert_with(|| Position {
            instrument_token: token,
            trading_symbol: symbol,
            exchange,
            net_quantity: 0,
            avg_entry_price: 0.0,
            last_price: price,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            product,
        });

        let old_net = position.net_quantity;
        let new_net = old_net + signed_qty;

        if old_net == 0 || old_net.signum() == signed_qty.signum() {
            // Extending (or opening): weighted-average entry.
            let old_abs = old_net.unsigned_abs() as f64;
            let add_abs = signed_qty.unsigned_abs() as f64;
            position.avg_entry_price =
                (position.avg_entry_price * old_abs + price * add_abs) / (old_abs + add_abs);
        } else {
            // Reducing, closing, or flipping through zero.
            let closed = old_net.unsigned_abs().min(signed_qty.unsigned_abs()) as f64;
            let pnl = (price - position.avg_entry_price) * closed * old_net.signum() as f64;
            position.realized_pnl += pnl;
            state.realized_pnl_today += pnl;

            if new_net != 0 && new_net.signum() != old_net.signum() {
                // Flipped: the residual opens a fresh position at the fill.
                position.avg_entry_price = price;
            } else if new_net == 0 {
                position.avg_entry_price = 0.0;
            }
        }

        position.net_quantity = new_net;
        position.last_price = price;
        position.unrealized_pnl = (price - position.avg_entry_price) * new_net as f64;
        if new_net == 0 {
            position.unrealized_pnl = 0.0;
        }

        debug!(
            order_id = %order_id,
            price,
            qty,
            side = %side,
            net = new_net,
            "paper fill"
        );
    }

    fn require_connected(state: &PaperState) -> Result<(), BrokerError> {
        if state.connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    /// Built-in instrument master: a handful of liquid NSE names with their
    /// broker tokens, enough to drive the simulator offline.
    fn builtin_instruments() -> Vec<Instrument> {
        let equity = |token: u32, symbol: &str, name: &str| Instrument {
            instrument_token: token,
            exchange: Exchange::NSE,
            trading_symbol: symbol.to_string(),
            name: Some(name.to_string()),
            segment: Segment::Equity,
            lot_size: 1,
            tick_size: 0.05,
            expiry: None,
            strike: None,
            option_type: None,
        };
        vec![
            equity(738_561, "RELIANCE", "Reliance Industries"),
            equity(2_953_217, "TCS", "Tata Consultancy Services"),
            equity(408_065, "INFY", "Infosys"),
            equity(341_249, "HDFCBANK", "HDFC Bank"),
            equity(779_521, "SBIN", "State Bank of India"),
            equity(1_270_529, "ICICIBANK", "ICICI Bank"),
            equity(2_939_649, "TATAMOTORS", "Tata Motors"),
            equity(60_417, "ASIANPAINT", "Asian Paints"),
        ]
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new(DEFAULT_STARTING_BALANCE)
    }
}

// =============================================================================
// Broker impl
// =============================================================================

#[async_trait]
impl Broker for PaperBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Paper
    }

    async fn connect(&self, _credential: Credential) -> Result<ConnectResult, BrokerError> {
        let mut state = self.state.lock();
        let already_connected = state.connected;
        if !already_connected {
            state.connected = true;
            state.clock = Utc::now();
            for instrument in Self::builtin_instruments() {
                state
                    .instruments
                    .insert(instrument.instrument_token, instrument);
            }
            info!(starting_balance = self.starting_balance, "paper broker connected");
        }
        Ok(ConnectResult {
            broker: BrokerKind::Paper,
            already_connected,
            user_id: Some("paper".to_string()),
        })
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.connected = false;
        info!("paper broker disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        Self::pump(&mut state);

        let position_value: f64 = state
            .positions
            .values()
            .map(|p| p.net_quantity as f64 * p.last_price)
            .sum();
        let unrealized: f64 = state.positions.values().map(|p| p.unrealized_pnl).sum();
        let margin_used: f64 = state.positions.values().map(|p| p.notional()).sum();
        let equity = state.cash + position_value;

        Ok(AccountSnapshot {
            equity,
            cash_available: state.cash.max(0.0),
            margin_used,
            margin_available: (equity - margin_used).max(0.0),
            realized_pnl_today: state.realized_pnl_today,
            unrealized_pnl: unrealized,
            currency: "INR".to_string(),
        })
    }

    async fn quote(&self, instrument: &Instrument) -> Result<Quote, BrokerError> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        Self::pump(&mut state);
        state
            .instruments
            .entry(instrument.instrument_token)
            .or_insert_with(|| instrument.clone());
        Ok(Self::synthetic_quote(instrument, state.clock))
    }

    async fn historical_bars(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BrokerError> {
        let now = {
            let mut state = self.state.lock();
            Self::require_connected(&state)?;
            Self::pump(&mut state);
            state
                .instruments
                .entry(instrument.instrument_token)
                .or_insert_with(|| instrument.clone());
            state.clock
        };

        if to <= from {
            return Ok(Vec::new());
        }

        let step = timeframe.duration();
        let step_secs = step.num_seconds();
        // Align the first bar to the timeframe grid.
        let start_secs = (from.timestamp() / step_secs) * step_secs;

        let mut bars = Vec::new();
        let mut bar_start = start_secs;
        while bar_start < to.timestamp() {
            let bar_end = bar_start + step_secs;
            let token = instrument.instrument_token;

            let open = Self::synthetic_last(token, bar_start);
            let close = Self::synthetic_last(token, bar_end.min(now.timestamp()));

            let seed = (token as u64)
                .wrapping_mul(0x94d0_49bb_1331_11eb)
                .wrapping_add(bar_start as u64);
            let mut rng = StdRng::seed_from_u64(seed);
            let wick: f64 = rng.gen_range(0.0..0.004);
            let high = open.max(close) * (1.0 + wick);
            let low = open.min(close) * (1.0 - wick);
            let volume = rng.gen_range(50_000..2_000_000);

            let timestamp = Utc.timestamp_opt(bar_start, 0).single().ok_or_else(|| {
                BrokerError::Internal(format!("bad bar timestamp {bar_start}"))
            })?;

            bars.push(Bar {
                open,
                high,
                low,
                close,
                volume,
                timestamp,
                is_final: bar_end <= now.timestamp(),
            });
            bar_start = bar_end;
        }

        Ok(bars)
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<String, BrokerError> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        Self::pump(&mut state);

        if intent.quantity == 0 {
            return Err(BrokerError::Rejected {
                reason: "quantity must be positive".to_string(),
            });
        }
        if matches!(intent.order_type, OrderType::Limit | OrderType::Sl)
            && intent.price.is_none()
        {
            return Err(BrokerError::Rejected {
                reason: "limit price required".to_string(),
            });
        }
        if matches!(intent.order_type, OrderType::Sl | OrderType::SlM)
            && intent.trigger_price.is_none()
        {
            return Err(BrokerError::Rejected {
                reason: "trigger price required".to_string(),
            });
        }

        // A rough funds check so the simulator cannot go arbitrarily
        // negative: buys must be coverable by cash at the current ask.
        if intent.side == Side::Buy {
            let quote = Self::synthetic_quote(&intent.instrument, state.clock);
            let cost = intent.quantity as f64 * quote.ask;
            if cost > state.cash {
                return Err(BrokerError::Rejected {
                    reason: format!("insufficient funds: need {cost:.2}, have {:.2}", state.cash),
                });
            }
        }

        state.order_seq += 1;
        let order_id = format!("PO{:08}", state.order_seq);
        let now = state.clock;
        let tick = state.tick;

        state
            .instruments
            .entry(intent.instrument.instrument_token)
            .or_insert_with(|| intent.instrument.clone());

        let order = Order {
            broker_order_id: order_id.clone(),
            instrument_token: intent.instrument.instrument_token,
            trading_symbol: intent.instrument.trading_symbol.clone(),
            exchange: intent.instrument.exchange,
            side: intent.side,
            quantity: intent.quantity,
            order_type: intent.order_type,
            price: intent.price,
            trigger_price: intent.trigger_price,
            product: intent.product,
            validity: intent.validity,
            status: OrderStatus::Pending,
            filled_qty: 0,
            avg_fill_price: 0.0,
            created_at: now,
            updated_at: now,
            rejection_reason: None,
        };

        state.orders.push(PaperOrder {
            order,
            placed_tick: tick,
            armed: false,
        });

        // Market orders fill immediately against the current quote.
        if intent.order_type == OrderType::Market {
            let idx = state.orders.len() - 1;
            let quote = Self::synthetic_quote(&intent.instrument, now);
            let price = match intent.side {
                Side::Buy => quote.ask,
                Side::Sell => quote.bid,
            };
            Self::fill_order(&mut state, idx, price);
        }

        Ok(order_id)
    }

    async fn modify_order(
        &self,
        order_id: &str,
        changes: OrderChanges,
    ) -> Result<OrderMutation, BrokerError> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        Self::pump(&mut state);
        let now = state.clock;

        let entry = state
            .orders
            .iter_mut()
            .find(|e| e.order.broker_order_id == order_id)
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;

        if entry.order.status.is_terminal() {
            return Ok(OrderMutation::AlreadyTerminal);
        }

        if let Some(qty) = changes.quantity {
            entry.order.quantity = qty;
        }
        if let Some(price) = changes.price {
            entry.order.price = Some(price);
        }
        if let Some(trigger) = changes.trigger_price {
            entry.order.trigger_price = Some(trigger);
            entry.armed = false;
        }
        entry.order.updated_at = now;
        Ok(OrderMutation::Applied)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderMutation, BrokerError> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        Self::pump(&mut state);
        let now = state.clock;

        let entry = state
            .orders
            .iter_mut()
            .find(|e| e.order.broker_order_id == order_id)
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;

        if entry.order.status.is_terminal() {
            return Ok(OrderMutation::AlreadyTerminal);
        }

        entry.order.status = OrderStatus::Cancelled;
        entry.order.updated_at = now;
        Ok(OrderMutation::Applied)
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        Self::pump(&mut state);
        Ok(state.positions.values().cloned().collect())
    }

    async fn orders(&self) -> Result<Vec<Order>, BrokerError> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        Self::pump(&mut state);
        Ok(state.orders.iter().map(|e| e.order.clone()).collect())
    }

    async fn trades(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Trade>, BrokerError> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        Self::pump(&mut state);
        Ok(state
            .trades
            .iter()
            .filter(|t| since.map_or(true, |s| t.timestamp > s))
            .cloned()
            .collect())
    }

    async fn instruments(&self) -> Result<Vec<Instrument>, BrokerError> {
        Ok(Self::builtin_instruments())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        Credential {
            api_key: String::new(),
            api_secret: String::new(),
            access_token: None,
            access_token_expiry: None,
            refresh_token: None,
        }
    }

    fn reliance() -> Instrument {
        PaperBroker::builtin_instruments()
            .into_iter()
            .find(|i| i.trading_symbol == "RELIANCE")
            .unwrap()
    }

    fn market_intent(side: Side, quantity: u32) -> OrderIntent {
        OrderIntent {
            instrument: reliance(),
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
            trigger_price: None,
            stop_loss: 0.0,
            take_profit: 0.0,
            product: Product::Mis,
            validity: crate::types::Validity::Day,
        }
    }

    async fn connected_broker() -> PaperBroker {
        let broker = PaperBroker::default();
        broker.connect(credential()).await.unwrap();
        broker
    }

    #[test]
    fn synthetic_walk_is_deterministic() {
        let a = PaperBroker::synthetic_last(738_561, 1_700_000_000);
        let b = PaperBroker::synthetic_last(738_561, 1_700_000_000);
        assert_eq!(a, b);
        // Different second or token moves the price.
        assert_ne!(a, PaperBroker::synthetic_last(738_561, 1_700_000_001));
        assert_ne!(a, PaperBroker::synthetic_last(408_065, 1_700_000_000));
        assert!(a > 0.0);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let broker = PaperBroker::default();
        let first = broker.connect(credential()).await.unwrap();
        assert!(!first.already_connected);
        let second = broker.connect(credential()).await.unwrap();
        assert!(second.already_connected);
        assert!(broker.is_connected());
    }

    #[tokio::test]
    async fn calls_before_connect_fail() {
        let broker = PaperBroker::default();
        let err = broker.account_snapshot().await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
    }

    #[tokio::test]
    async fn market_buy_fills_at_ask_and_opens_position() {
        let broker = connected_broker().await;
        let quote = broker.quote(&reliance()).await.unwrap();

        let id = broker.place_order(&market_intent(Side::Buy, 10)).await.unwrap();
        let orders = broker.orders().await.unwrap();
        let order = orders.iter().find(|o| o.broker_order_id == id).unwrap();
        assert_eq!(order.status, OrderStatus::Complete);
        assert_eq!(order.filled_qty, 10);
        // Buy fills on the ask side of the spread.
        assert!(order.avg_fill_price >= quote.last - 1.0);

        let positions = broker.positions().await.unwrap();
        let pos = positions
            .iter()
            .find(|p| p.trading_symbol == "RELIANCE")
            .unwrap();
        assert_eq!(pos.net_quantity, 10);
        assert!(pos.avg_entry_price > 0.0);

        let trades = broker.trades(None).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].quantity, 10);
    }

    #[tokio::test]
    async fn marketable_limit_walks_pending_open_complete() {
        let broker = connected_broker().await;
        let quote = broker.quote(&reliance()).await.unwrap();

        // A buy limit priced far above the market is immediately marketable
        // but still walks the state machine over simulated ticks.
        let intent = OrderIntent {
            order_type: OrderType::Limit,
            price: Some(quote.ask * 1.10),
            ..market_intent(Side::Buy, 5)
        };
        let id = broker.place_order(&intent).await.unwrap();

        let mut seen = Vec::new();
        let mut updated_ats = Vec::new();
        for _ in 0..6 {
            let orders = broker.orders().await.unwrap();
            let order = orders.iter().find(|o| o.broker_order_id == id).unwrap();
            if seen.last() != Some(&order.status) {
                seen.push(order.status);
                updated_ats.push(order.updated_at);
            }
            if order.status.is_terminal() {
                break;
            }
        }

        assert_eq!(
            seen,
            vec![OrderStatus::Pending, OrderStatus::Open, OrderStatus::Complete]
        );
        // Monotone updated_at across transitions.
        assert!(updated_ats.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn cancel_terminal_order_is_already_terminal() {
        let broker = connected_broker().await;
        let id = broker.place_order(&market_intent(Side::Buy, 1)).await.unwrap();

        let before = broker.orders().await.unwrap();
        assert_eq!(before[0].status, OrderStatus::Complete);

        let outcome = broker.cancel_order(&id).await.unwrap();
        assert_eq!(outcome, OrderMutation::AlreadyTerminal);

        // No state change.
        let after = broker.orders().await.unwrap();
        assert_eq!(after[0].status, OrderStatus::Complete);
        assert_eq!(after[0].filled_qty, 1);
    }

    #[tokio::test]
    async fn cancel_resting_order() {
        let broker = connected_broker().await;
        let quote = broker.quote(&reliance()).await.unwrap();

        // Deep out-of-the-money buy limit never fills.
        let intent = OrderIntent {
            order_type: OrderType::Limit,
            price: Some(quote.bid * 0.5),
            ..market_intent(Side::Buy, 5)
        };
        let id = broker.place_order(&intent).await.unwrap();
        let outcome = broker.cancel_order(&id).await.unwrap();
        assert_eq!(outcome, OrderMutation::Applied);

        let orders = broker.orders().await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn modify_resting_order_and_terminal_guard() {
        let broker = connected_broker().await;
        let quote = broker.quote(&reliance()).await.unwrap();

        let intent = OrderIntent {
            order_type: OrderType::Limit,
            price: Some(quote.bid * 0.5),
            ..market_intent(Side::Buy, 5)
        };
        let id = broker.place_order(&intent).await.unwrap();

        let outcome = broker
            .modify_order(
                &id,
                OrderChanges {
                    quantity: Some(10),
                    price: Some(quote.bid * 0.6),
                    trigger_price: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, OrderMutation::Applied);

        let orders = broker.orders().await.unwrap();
        let order = orders.iter().find(|o| o.broker_order_id == id).unwrap();
        assert_eq!(order.quantity, 10);

        // Terminal orders refuse modification the same way they refuse
        // cancellation.
        let market_id = broker.place_order(&market_intent(Side::Buy, 1)).await.unwrap();
        let outcome = broker
            .modify_order(&market_id, OrderChanges::default())
            .await
            .unwrap();
        assert_eq!(outcome, OrderMutation::AlreadyTerminal);
    }

    #[tokio::test]
    async fn round_trip_realises_pnl_and_flattens() {
        let broker = connected_broker().await;
        broker.place_order(&market_intent(Side::Buy, 10)).await.unwrap();
        broker.place_order(&market_intent(Side::Sell, 10)).await.unwrap();

        let positions = broker.positions().await.unwrap();
        let pos = positions
            .iter()
            .find(|p| p.trading_symbol == "RELIANCE")
            .unwrap();
        assert!(pos.is_flat());
        assert_eq!(pos.avg_entry_price, 0.0);
        assert_eq!(pos.unrealized_pnl, 0.0);
        // Crossing the spread twice plus fees: realised is nonzero.
        let snapshot = broker.account_snapshot().await.unwrap();
        assert!(snapshot.realized_pnl_today != 0.0);
    }

    #[tokio::test]
    async fn flip_through_zero_reopens_at_fill_price() {
        let broker = connected_broker().await;
        broker.place_order(&market_intent(Side::Buy, 5)).await.unwrap();
        broker.place_order(&market_intent(Side::Sell, 12)).await.unwrap();

        let positions = broker.positions().await.unwrap();
        let pos = positions
            .iter()
            .find(|p| p.trading_symbol == "RELIANCE")
            .unwrap();
        assert_eq!(pos.net_quantity, -7);
        assert!(pos.avg_entry_price > 0.0);
    }

    #[tokio::test]
    async fn account_equity_tracks_cash_and_positions() {
        let broker = connected_broker().await;
        let start = broker.account_snapshot().await.unwrap();
        assert!((start.equity - DEFAULT_STARTING_BALANCE).abs() < 1e-6);

        broker.place_order(&market_intent(Side::Buy, 10)).await.unwrap();
        let after = broker.account_snapshot().await.unwrap();
        // Equity only drops by fees and the spread, not the full cost.
        assert!(after.equity > DEFAULT_STARTING_BALANCE * 0.9);
        assert!(after.margin_used > 0.0);
        // Open notional never exceeds reported margin capacity.
        assert!(after.margin_used <= after.margin_used + after.margin_available + 1e-9);
    }

    #[tokio::test]
    async fn oversized_buy_is_rejected() {
        let broker = connected_broker().await;
        let err = broker
            .place_order(&market_intent(Side::Buy, 10_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected { .. }));
    }

    #[tokio::test]
    async fn historical_bars_are_ordered_and_flag_partial_tail() {
        let broker = connected_broker().await;
        let to = Utc::now();
        let from = to - ChronoDuration::minutes(5 * 50);
        let bars = broker
            .historical_bars(&reliance(), Timeframe::M5, from, to)
            .await
            .unwrap();
        assert!(bars.len() >= 49);
        for pair in bars.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
        // All but possibly the last are final.
        for bar in &bars[..bars.len() - 1] {
            assert!(bar.is_final);
        }
        assert!(!bars.last().unwrap().is_final);
        for bar in &bars {
            assert!(bar.high >= bar.low);
            assert!(bar.high >= bar.open && bar.high >= bar.close);
            assert!(bar.low <= bar.open && bar.low <= bar.close);
        }
    }

    #[tokio::test]
    async fn historical_bars_deterministic_for_same_window() {
        let broker = connected_broker().await;
        let to = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let from = to - ChronoDuration::minutes(5 * 20);
        let a = broker
            .historical_bars(&reliance(), Timeframe::M5, from, to)
            .await
            .unwrap();
        let b = broker
            .historical_bars(&reliance(), Timeframe::M5, from, to)
            .await
            .unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.open, y.open);
            assert_eq!(x.close, y.close);
            assert_eq!(x.volume, y.volume);
        }
    }

    #[tokio::test]
    async fn seeded_daily_loss_shows_in_snapshot() {
        let broker = connected_broker().await;
        broker.seed_realized_pnl(-2_100.0);
        let snapshot = broker.account_snapshot().await.unwrap();
        assert!(snapshot.realized_pnl_today <= -2_100.0);
    }
}
