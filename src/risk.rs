// =============================================================================
// Risk & Sizing — turns accepted Decisions into bracketed order intents
// =============================================================================
//
// Sizing pipeline:
//   1. risk_amount   = equity * risk_per_trade_percent / 100
//   2. stop_distance = |entry - suggested_stop|, or ATR * atr_multiplier
//   3. quantity      = risk_amount / stop_distance, floored to lot_size
//   4. take_profit   = stop_distance * reward_ratio (or suggested_target)
//   5. notional must fit the per-trade cap and free margin
//   6. open positions incl. this one must fit max_positions
//
// A rejection here is not an error: the strategy accepted the setup and
// risk refused it. Rejections are logged as warning activities and produce
// no order.
//
// The daily loss gate lives here too: "daily" means the exchange (IST)
// calendar day, and the gate compares the day's realised + unrealised P&L
// against a fraction of the equity captured at day open.
// =============================================================================

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::BotConfig;
use crate::strategy::Decision;
use crate::types::{
    AccountSnapshot, Instrument, OrderIntent, OrderType, Product, Quote, Side, Validity,
};

/// No single trade may commit more than this fraction of equity as
/// notional, independent of the stop-derived size.
pub const MAX_NOTIONAL_EQUITY_FRACTION: f64 = 0.25;

fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 1800).expect("IST offset is valid")
}

// =============================================================================
// Rejections
// =============================================================================

/// Why the risk layer refused an accepted Decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RiskRejection {
    /// Hold decisions carry nothing to size.
    NotActionable,
    /// Stop distance collapsed to (or below) a tick; sizing would divide
    /// by ~zero.
    InsufficientStop,
    /// The stop-derived quantity rounds down below one lot.
    BelowLotSize { computed_qty: f64, lot_size: u32 },
    /// Notional exceeds the per-trade cap or the account's free margin.
    InsufficientMargin { required: f64, available: f64 },
    /// Too many open positions already.
    MaxPositions { open: usize, max: u32 },
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotActionable => write!(f, "decision is not actionable"),
            Self::InsufficientStop => write!(f, "stop distance too small to size against"),
            Self::BelowLotSize {
                computed_qty,
                lot_size,
            } => write!(
                f,
                "sized quantity {computed_qty:.2} is below one lot of {lot_size}"
            ),
            Self::InsufficientMargin {
                required,
                available,
            } => write!(
                f,
                "needs {required:.2} notional but only {available:.2} is available"
            ),
            Self::MaxPositions { open, max } => {
                write!(f, "{open} positions open, limit is {max}")
            }
        }
    }
}

// =============================================================================
// Sizing
// =============================================================================

/// Inputs the sizer needs beyond the decision itself.
pub struct RiskContext<'a> {
    pub account: &'a AccountSnapshot,
    pub instrument: &'a Instrument,
    pub quote: &'a Quote,
    /// Most recent ATR, used when the strategy supplied no stop anchor.
    pub atr: Option<f64>,
    /// Open positions before this intent.
    pub open_positions: usize,
}

fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick > 0.0 {
        (price / tick).round() * tick
    } else {
        price
    }
}

/// Size an accepted decision into a bracketed market-order intent, or say
/// exactly why not.
pub fn size_order(
    decision: &Decision,
    ctx: &RiskContext<'_>,
    config: &BotConfig,
) -> Result<OrderIntent, RiskRejection> {
    let (side, signal) = match decision {
        Decision::Buy(signal) => (Side::Buy, signal),
        Decision::Sell(signal) => (Side::Sell, signal),
        Decision::Hold { .. } => return Err(RiskRejection::NotActionable),
    };

    // Entries cross the spread: buys lift the ask, sells hit the bid.
    let entry = match side {
        Side::Buy => ctx.quote.ask,
        Side::Sell => ctx.quote.bid,
    };

    let equity = ctx.account.equity;
    let risk_amount = equity * config.risk_per_trade_percent / 100.0;

    // Stop distance: strategy anchor first, ATR fallback second.
    let stop_distance = match signal.suggested_stop {
        Some(stop) => (entry - stop).abs(),
        None => match ctx.atr {
            Some(atr) => atr * config.atr_multiplier,
            None => return Err(RiskRejection::InsufficientStop),
        },
    };
    if !stop_distance.is_finite() || stop_distance <= ctx.instrument.tick_size {
        return Err(RiskRejection::InsufficientStop);
    }

    let lot = ctx.instrument.lot_size.max(1);
    let raw_qty = risk_amount / stop_distance;
    let lots = (raw_qty / lot as f64).floor() as u64;
    if lots == 0 {
        return Err(RiskRejection::BelowLotSize {
            computed_qty: raw_qty,
            lot_size: lot,
        });
    }
    let quantity = (lots * lot as u64) as u32;

    let notional = quantity as f64 * entry;
    let cap = equity * MAX_NOTIONAL_EQUITY_FRACTION;
    let available = ctx.account.margin_available.min(cap);
    if notional > available {
        return Err(RiskRejection::InsufficientMargin {
            required: notional,
            available,
        });
    }

    if ctx.open_positions + 1 > config.max_positions as usize {
        return Err(RiskRejection::MaxPositions {
            open: ctx.open_positions,
            max: config.max_positions,
        });
    }

    let tick = ctx.instrument.tick_size;
    let (stop_loss, take_profit) = match side {
        Side::Buy => {
            let stop = signal.suggested_stop.unwrap_or(entry - stop_distance);
            let target = signal
                .suggested_target
                .unwrap_or(entry + stop_distance * config.reward_ratio);
            (stop, target)
        }
        Side::Sell => {
            let stop = signal.suggested_stop.unwrap_or(entry + stop_distance);
            let target = signal
                .suggested_target
                .unwrap_or(entry - stop_distance * config.reward_ratio);
            (stop, target)
        }
    };

    debug!(
        symbol = %ctx.instrument.trading_symbol,
        side = %side,
        quantity,
        entry,
        stop_loss,
        take_profit,
        risk_amount,
        "intent sized"
    );

    Ok(OrderIntent {
        instrument: ctx.instrument.clone(),
        side,
        quantity,
        order_type: OrderType::Market,
        price: None,
        trigger_price: None,
        stop_loss: round_to_tick(stop_loss, tick),
        take_profit: round_to_tick(take_profit, tick),
        product: Product::Mis,
        validity: Validity::Day,
    })
}

// =============================================================================
// Daily loss gate
// =============================================================================

/// Tracks the equity captured at the open of the current IST trading day
/// and decides when the day's losses force a pause.
#[derive(Debug, Clone)]
pub struct DailyLossGate {
    ist_date: NaiveDate,
    equity_at_open: f64,
    max_daily_loss_percent: f64,
}

impl DailyLossGate {
    pub fn new(now: DateTime<Utc>, equity: f64, max_daily_loss_percent: f64) -> Self {
        Self {
            ist_date: now.with_timezone(&ist()).date_naive(),
            equity_at_open: equity,
            max_daily_loss_percent,
        }
    }

    /// If the IST calendar date has changed, rebase on the current equity
    /// and report the roll so the supervisor can clear a pause.
    pub fn roll_if_new_day(&mut self, now: DateTime<Utc>, equity: f64) -> bool {
        let today = now.with_timezone(&ist()).date_naive();
        if today != self.ist_date {
            self.ist_date = today;
            self.equity_at_open = equity;
            return true;
        }
        false
    }

    /// The loss (positive rupees) at which the gate trips.
    pub fn limit_amount(&self) -> f64 {
        self.equity_at_open * self.max_daily_loss_percent / 100.0
    }

    /// `pnl_today` is the day's realised + unrealised P&L (losses
    /// negative).
    pub fn is_breached(&self, pnl_today: f64) -> bool {
        pnl_today <= -self.limit_amount()
    }

    pub fn equity_at_open(&self) -> f64 {
        self.equity_at_open
    }
}
