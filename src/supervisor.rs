// =============================================================================
// Bot Supervisor — the single logical worker that owns the trading loop
// =============================================================================
//
// All trading state (bars, positions, orders, brackets) lives inside the
// supervisor task. HTTP handlers never share memory with it: they submit
// typed commands over a bounded mpsc channel and await a oneshot reply
// (bounded by a 5 s handshake timeout), or ask for a copy-on-read snapshot.
//
// Lifecycle: stopped -> starting -> running -> (paused | stopping) -> stopped.
// Start and stop are idempotent with respect to their terminal state and
// ack with 200-style no-ops; a daily-loss pause holds until the IST day
// rolls over.
//
// Per tick, per instrument, strictly in this order: refresh bars ->
// indicators -> strategy -> risk gates -> order submission -> position
// reconciliation -> bracket enforcement. Adapter errors on one instrument
// skip that instrument's tick and emit an error activity; they never kill
// the loop. RateLimited on quotes is a skipped tick, not an error.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::activity::{Activity, ActivityLog};
use crate::bars::{BarBuffer, BarSeriesKey};
use crate::broker::{Broker, BrokerError};
use crate::config::BotConfig;
use crate::indicators::IndicatorSet;
use crate::risk::{size_order, DailyLossGate, RiskContext};
use crate::strategy::{self, Decision, StrategyConfig, StrategyKind};
use crate::types::{
    AccountSnapshot, BotState, Instrument, Order, OrderStatus, Position, Quote, Side,
};

/// Handshake timeout for HTTP-side command replies.
pub const COMMAND_TIMEOUT_SECS: u64 = 5;

/// Closed bars retained per instrument series.
const MAX_BARS: usize = 500;

fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 1800).expect("IST offset is valid")
}

// =============================================================================
// Commands and replies
// =============================================================================

/// Why a lifecycle command was refused.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlError {
    InvalidConfig { violations: Vec<crate::config::ConfigViolation> },
    BrokerNotConnected,
    NoSuchPosition { trading_symbol: String },
    Internal { message: String },
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig { violations } => {
                write!(f, "config invalid ({} violations)", violations.len())
            }
            Self::BrokerNotConnected => write!(f, "broker is not connected"),
            Self::NoSuchPosition { trading_symbol } => {
                write!(f, "no open position for {trading_symbol}")
            }
            Self::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

/// Reply to a lifecycle command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandAck {
    pub state: BotState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Copy-on-read view of the supervisor's state for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct BotSnapshot {
    pub state: BotState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<BotConfig>,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountSnapshot>,
    pub pnl_today: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_loss_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tick_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

enum Command {
    Start {
        config: BotConfig,
        broker: Arc<dyn Broker>,
        instruments: Vec<Instrument>,
        reply: oneshot::Sender<Result<CommandAck, ControlError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<CommandAck, ControlError>>,
    },
    Snapshot {
        reply: oneshot::Sender<BotSnapshot>,
    },
    ClosePosition {
        trading_symbol: String,
        reply: oneshot::Sender<Result<CommandAck, ControlError>>,
    },
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle the control plane uses to talk to the supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
    stop_flag: Arc<AtomicBool>,
}

impl SupervisorHandle {
    async fn send<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ControlError> {
        self.tx.send(command).await.map_err(|_| ControlError::Internal {
            message: "supervisor task is gone".to_string(),
        })?;
        tokio::time::timeout(std::time::Duration::from_secs(COMMAND_TIMEOUT_SECS), rx)
            .await
            .map_err(|_| ControlError::Internal {
                message: "supervisor handshake timed out".to_string(),
            })?
            .map_err(|_| ControlError::Internal {
                message: "supervisor dropped the reply".to_string(),
            })
    }

    pub async fn start(
        &self,
        config: BotConfig,
        broker: Arc<dyn Broker>,
        instruments: Vec<Instrument>,
    ) -> Result<CommandAck, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::Start {
                config,
                broker,
                instruments,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn stop(&self) -> Result<CommandAck, ControlError> {
        // The flag lets a long tick abort before its next adapter call.
        self.stop_flag.store(true, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply }, rx).await?
    }

    pub async fn snapshot(&self) -> Result<BotSnapshot, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }, rx).await
    }

    pub async fn close_position(&self, trading_symbol: String) -> Result<CommandAck, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::ClosePosition {
                trading_symbol,
                reply,
            },
            rx,
        )
        .await?
    }
}

/// Spawn the supervisor task and return its handle.
pub fn spawn(activity: Arc<ActivityLog>) -> SupervisorHandle {
    let (tx, rx) = mpsc::channel(16);
    let stop_flag = Arc::new(AtomicBool::new(false));
    let supervisor = Supervisor {
        rx,
        activity,
        stop_flag: stop_flag.clone(),
        state: BotState::Stopped,
        session: None,
    };
    tokio::spawn(supervisor.run());
    SupervisorHandle { tx, stop_flag }
}

// =============================================================================
// Supervisor internals
// =============================================================================

/// Bracket levels the supervisor enforces when the broker holds none.
struct Bracket {
    side: Side,
    stop_loss: f64,
    take_profit: f64,
}

/// Everything that exists only while a run is active (or viewable after it
/// stopped).
struct RunSession {
    config: BotConfig,
    broker: Arc<dyn Broker>,
    strategy: StrategyKind,
    strategy_config: StrategyConfig,
    params: crate::config::IndicatorParams,
    instruments: Vec<Instrument>,
    bars: BarBuffer,
    gate: DailyLossGate,
    positions: Vec<Position>,
    orders: Vec<Order>,
    account: Option<AccountSnapshot>,
    pnl_today: f64,
    brackets: HashMap<u32, Bracket>,
    known_order_status: HashMap<String, OrderStatus>,
    last_trade_seen: Option<DateTime<Utc>>,
    last_tick_at: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
}

struct Supervisor {
    rx: mpsc::Receiver<Command>,
    activity: Arc<ActivityLog>,
    stop_flag: Arc<AtomicBool>,
    state: BotState,
    session: Option<RunSession>,
}

impl Supervisor {
    async fn run(mut self) {
        info!("supervisor task started");
        loop {
            let ticking = matches!(self.state, BotState::Running | BotState::Paused);
            if ticking {
                let poll = self
                    .session
                    .as_ref()
                    .map(|s| s.config.poll_interval_seconds)
                    .unwrap_or(30);
                // Inter-tick sleep doubles as the command wait, so a stop
                // request wakes the loop immediately.
                match tokio::time::timeout(
                    std::time::Duration::from_secs(poll),
                    self.rx.recv(),
                )
                .await
                {
                    Ok(Some(command)) => self.handle_command(command).await,
                    Ok(None) => break,
                    Err(_) => self.tick().await,
                }
            } else {
                match self.rx.recv().await {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                }
            }
        }
        info!("supervisor task exiting");
    }

    // -------------------------------------------------------------------------
    // Command handling
    // -------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                config,
                broker,
                instruments,
                reply,
            } => {
                let result = self.handle_start(config, broker, instruments).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                let result = self.handle_stop();
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::ClosePosition {
                trading_symbol,
                reply,
            } => {
                let result = self.handle_close_position(&trading_symbol).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_start(
        &mut self,
        config: BotConfig,
        broker: Arc<dyn Broker>,
        instruments: Vec<Instrument>,
    ) -> Result<CommandAck, ControlError> {
        match self.state {
            BotState::Running => {
                return Ok(CommandAck {
                    state: BotState::Running,
                    note: Some("already running".to_string()),
                });
            }
            BotState::Paused => {
                // The daily loss gate holds until the day rolls over; start
                // acks but changes nothing.
                return Ok(CommandAck {
                    state: BotState::Paused,
                    note: Some("paused by daily loss gate until the next trading day".to_string()),
                });
            }
            _ => {}
        }

        let violations = config.validate();
        if !violations.is_empty() {
            return Err(ControlError::InvalidConfig { violations });
        }
        if !broker.is_connected() {
            return Err(ControlError::BrokerNotConnected);
        }
        if instruments.is_empty() {
            return Err(ControlError::Internal {
                message: "no resolvable instruments".to_string(),
            });
        }

        let strategy: StrategyKind = config
            .strategy
            .parse()
            .map_err(|message| ControlError::Internal { message })?;
        let params = strategy.effective_params(&config.indicator_params);

        self.state = BotState::Starting;
        self.stop_flag.store(false, Ordering::SeqCst);

        // Capture equity at open for the daily gate.
        let account = match broker.account_snapshot().await {
            Ok(account) => account,
            Err(e) => {
                self.state = BotState::Stopped;
                return Err(ControlError::Internal {
                    message: format!("account snapshot failed: {e}"),
                });
            }
        };
        let gate = DailyLossGate::new(Utc::now(), account.equity, config.max_daily_loss_percent);

        // Seed bar buffers with enough history for indicator warmup.
        let mut bars = BarBuffer::new(MAX_BARS);
        let warmup = params.warmup_bars();
        let now = Utc::now();
        let from = now - config.timeframe.duration() * (warmup as i32 + 5);
        for instrument in &instruments {
            let key = BarSeriesKey {
                instrument_token: instrument.instrument_token,
                timeframe: config.timeframe,
            };
            match broker
                .historical_bars(instrument, config.timeframe, from, now)
                .await
            {
                Ok(fetched) => bars.merge(key, &fetched),
                Err(e) => {
                    // Seeding gaps are not fatal; the loop backfills.
                    warn!(symbol = %instrument.trading_symbol, error = %e, "warmup seed failed");
                    self.activity.push(
                        Activity::warning(format!("warmup history unavailable: {e}"))
                            .with_symbol(instrument.trading_symbol.clone()),
                    );
                }
            }
        }

        let pnl_today = account.realized_pnl_today + account.unrealized_pnl;
        self.session = Some(RunSession {
            strategy,
            strategy_config: StrategyConfig::default(),
            params,
            instruments,
            bars,
            gate,
            positions: Vec::new(),
            orders: Vec::new(),
            account: Some(account),
            pnl_today,
            brackets: HashMap::new(),
            known_order_status: HashMap::new(),
            last_trade_seen: Some(Utc::now()),
            last_tick_at: None,
            started_at: Utc::now(),
            broker,
            config,
        });
        self.state = BotState::Running;

        self.activity.push(Activity::position("bot started"));
        info!("bot started");
        Ok(CommandAck {
            state: BotState::Running,
            note: None,
        })
    }

    fn handle_stop(&mut self) -> Result<CommandAck, ControlError> {
        match self.state {
            BotState::Stopped => Ok(CommandAck {
                state: BotState::Stopped,
                note: Some("already stopped".to_string()),
            }),
            _ => {
                self.state = BotState::Stopping;
                // In-flight adapter calls have already completed (commands
                // are handled between ticks); finish the transition.
                self.state = BotState::Stopped;
                self.stop_flag.store(false, Ordering::SeqCst);
                self.activity.push(Activity::position("bot stopped"));
                info!("bot stopped");
                Ok(CommandAck {
                    state: BotState::Stopped,
                    note: None,
                })
            }
        }
    }

    async fn handle_close_position(
        &mut self,
        trading_symbol: &str,
    ) -> Result<CommandAck, ControlError> {
        let state = self.state;
        let Some(session) = self.session.as_mut() else {
            return Err(ControlError::NoSuchPosition {
                trading_symbol: trading_symbol.to_string(),
            });
        };

        let position = session
            .positions
            .iter()
            .find(|p| p.trading_symbol == trading_symbol && !p.is_flat())
            .cloned()
            .ok_or_else(|| ControlError::NoSuchPosition {
                trading_symbol: trading_symbol.to_string(),
            })?;

        let instrument = session
            .instruments
            .iter()
            .find(|i| i.instrument_token == position.instrument_token)
            .cloned()
            .ok_or_else(|| ControlError::Internal {
                message: format!("instrument {} not tracked", position.trading_symbol),
            })?;

        match Self::submit_close(session, &instrument, &position).await {
            Ok(order_id) => {
                self.activity.push(
                    Activity::order(format!(
                        "close requested for {} ({} qty {})",
                        position.trading_symbol,
                        position.net_quantity,
                        order_id
                    ))
                    .with_symbol(position.trading_symbol.clone()),
                );
                Ok(CommandAck {
                    state,
                    note: Some(format!("close order {order_id} submitted")),
                })
            }
            Err(e) => Err(ControlError::Internal {
                message: format!("close order failed: {e}"),
            }),
        }
    }

    async fn submit_close(
        session: &mut RunSession,
        instrument: &Instrument,
        position: &Position,
    ) -> Result<String, BrokerError> {
        let side = if position.net_quantity > 0 {
            Side::Sell
        } else {
            Side::Buy
        };
        let intent = crate::types::OrderIntent {
            instrument: instrument.clone(),
            side,
            quantity: position.net_quantity.unsigned_abs() as u32,
            order_type: crate::types::OrderType::Market,
            price: None,
            trigger_price: None,
            stop_loss: 0.0,
            take_profit: 0.0,
            product: position.product,
            validity: crate::types::Validity::Day,
        };
        let order_id = session.broker.place_order(&intent).await?;
        session.brackets.remove(&position.instrument_token);
        Ok(order_id)
    }

    fn snapshot(&self) -> BotSnapshot {
        match self.session.as_ref() {
            Some(session) => BotSnapshot {
                state: self.state,
                config: Some(session.config.clone()),
                positions: session.positions.clone(),
                orders: session.orders.clone(),
                account: session.account.clone(),
                pnl_today: session.pnl_today,
                daily_loss_limit: Some(session.gate.limit_amount()),
                last_tick_at: session.last_tick_at,
                started_at: Some(session.started_at),
            },
            None => BotSnapshot {
                state: self.state,
                config: None,
                positions: Vec::new(),
                orders: Vec::new(),
                account: None,
                pnl_today: 0.0,
                daily_loss_limit: None,
                last_tick_at: None,
                started_at: None,
            },
        }
    }

    // -------------------------------------------------------------------------
    // The tick
    // -------------------------------------------------------------------------

    async fn tick(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let now = Utc::now();
        session.last_tick_at = Some(now);

        // Trading-hours window (exchange local time). Outside it the tick
        // is analysis-only.
        let ist_now = now.with_timezone(&ist());
        let minutes = ist_now.time().hour() * 60 + ist_now.time().minute();
        let in_window = session.config.trading_hours.contains_minutes(minutes);

        // Account first: sizing and the daily gate both need it.
        let account = match session.broker.account_snapshot().await {
            Ok(account) => {
                session.account = Some(account.clone());
                Some(account)
            }
            Err(e) => {
                self.activity
                    .push(Activity::error(format!("account snapshot failed: {e}")));
                None
            }
        };

        let mut quotes: HashMap<u32, Quote> = HashMap::new();

        let instruments = session.instruments.clone();
        for instrument in &instruments {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            match self
                .tick_instrument(&mut session, instrument, account.as_ref(), in_window)
                .await
            {
                Ok(Some(quote)) => {
                    quotes.insert(instrument.instrument_token, quote);
                }
                Ok(None) => {}
                Err(BrokerError::RateLimited) => {
                    // Skipped tick for this instrument, by design not an error.
                    warn!(symbol = %instrument.trading_symbol, "rate limited, skipping tick");
                }
                Err(e) => {
                    self.activity.push(
                        Activity::error(format!("tick failed: {e}"))
                            .with_symbol(instrument.trading_symbol.clone()),
                    );
                }
            }
        }

        if !self.stop_flag.load(Ordering::SeqCst) {
            self.reconcile(&mut session).await;
            self.enforce_brackets(&mut session, &quotes).await;
        }

        // Daily loss gate over realised + unrealised P&L for the IST day.
        if let Some(account) = session.account.clone() {
            let pnl_today = account.realized_pnl_today + account.unrealized_pnl;
            session.pnl_today = pnl_today;

            if session.gate.roll_if_new_day(now, account.equity) {
                if self.state == BotState::Paused {
                    self.state = BotState::Running;
                    self.activity
                        .push(Activity::position("new trading day, resuming from pause"));
                }
            } else if self.state == BotState::Running && session.gate.is_breached(pnl_today) {
                self.state = BotState::Paused;
                self.activity.push(Activity::warning(format!(
                    "daily loss limit breached: pnl {:.2} beyond -{:.2}, pausing until next trading day",
                    pnl_today,
                    session.gate.limit_amount()
                )));
                warn!(pnl_today, "daily loss gate tripped, bot paused");
            }
        }

        self.session = Some(session);
    }

    /// One instrument's slice of the tick. Returns the quote for bracket
    /// enforcement; `Ok(None)` means analysis happened without a usable
    /// quote.
    async fn tick_instrument(
        &mut self,
        session: &mut RunSession,
        instrument: &Instrument,
        account: Option<&AccountSnapshot>,
        in_window: bool,
    ) -> Result<Option<Quote>, BrokerError> {
        let key = BarSeriesKey {
            instrument_token: instrument.instrument_token,
            timeframe: session.config.timeframe,
        };

        // Refresh bars from the last stored point (with one interval of
        // overlap so the partial tail firms up).
        let now = Utc::now();
        let from = session
            .bars
            .last_bar(&key)
            .map(|b| b.timestamp - session.config.timeframe.duration())
            .unwrap_or_else(|| {
                now - session.config.timeframe.duration()
                    * (session.params.warmup_bars() as i32 + 5)
            });
        let fetched = session
            .broker
            .historical_bars(instrument, session.config.timeframe, from, now)
            .await?;
        session.bars.merge(key, &fetched);

        let quote = session.broker.quote(instrument).await?;

        let closed = session.bars.closed_bars(&key, session.params.warmup_bars());
        let Some(set) = IndicatorSet::compute(&closed, &session.params) else {
            self.activity.push(
                Activity::analysis("no bars yet, holding")
                    .with_symbol(instrument.trading_symbol.clone()),
            );
            return Ok(Some(quote));
        };

        let decision = strategy::evaluate(
            session.strategy,
            &set,
            &closed,
            &session.strategy_config,
        );

        self.activity.push(
            Activity::analysis(format!(
                "{}: {} ({:.0}%) — {}",
                session.strategy,
                decision.action_str(),
                decision.confidence() * 100.0,
                decision.reason()
            ))
            .with_symbol(instrument.trading_symbol.clone()),
        );

        if !decision.is_actionable() {
            return Ok(Some(quote));
        }

        self.activity.push(
            Activity::signal(format!(
                "{} signal ({:.0}%): {}",
                decision.action_str(),
                decision.confidence() * 100.0,
                decision.reason()
            ))
            .with_symbol(instrument.trading_symbol.clone()),
        );

        if self.state != BotState::Running {
            return Ok(Some(quote));
        }
        if !in_window {
            self.activity.push(
                Activity::analysis("outside trading hours, analysis only")
                    .with_symbol(instrument.trading_symbol.clone()),
            );
            return Ok(Some(quote));
        }

        // One position per instrument: stay out while exposure exists.
        let already_open = session
            .positions
            .iter()
            .any(|p| p.instrument_token == instrument.instrument_token && !p.is_flat());
        if already_open {
            return Ok(Some(quote));
        }

        let Some(account) = account else {
            return Ok(Some(quote));
        };

        let open_positions = session.positions.iter().filter(|p| !p.is_flat()).count();
        let ctx = RiskContext {
            account,
            instrument,
            quote: &quote,
            atr: set.atr,
            open_positions,
        };

        match size_order(&decision, &ctx, &session.config) {
            Ok(intent) => {
                let side = intent.side;
                match session.broker.place_order(&intent).await {
                    Ok(order_id) => {
                        session.brackets.insert(
                            instrument.instrument_token,
                            Bracket {
                                side,
                                stop_loss: intent.stop_loss,
                                take_profit: intent.take_profit,
                            },
                        );
                        self.activity.push(
                            Activity::order(format!(
                                "{} {} x{} submitted (order {}, sl {:.2}, tp {:.2})",
                                side,
                                instrument.trading_symbol,
                                intent.quantity,
                                order_id,
                                intent.stop_loss,
                                intent.take_profit
                            ))
                            .with_symbol(instrument.trading_symbol.clone()),
                        );
                    }
                    Err(BrokerError::Rejected { reason }) => {
                        self.activity.push(
                            Activity::warning(format!("order rejected by broker: {reason}"))
                                .with_symbol(instrument.trading_symbol.clone()),
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(rejection) => {
                self.activity.push(
                    Activity::warning(format!("risk rejection: {rejection}"))
                        .with_symbol(instrument.trading_symbol.clone()),
                );
            }
        }

        Ok(Some(quote))
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Pull positions/orders/trades from the broker, update the local model,
    /// and emit activities on transitions.
    async fn reconcile(&mut self, session: &mut RunSession) {
        match session.broker.positions().await {
            Ok(positions) => {
                // Position transitions: flat -> open and open -> flat.
                for position in &positions {
                    let previous = session
                        .positions
                        .iter()
                        .find(|p| p.instrument_token == position.instrument_token);
                    let was_open = previous.map(|p| !p.is_flat()).unwrap_or(false);
                    if !was_open && !position.is_flat() {
                        self.activity.push(
                            Activity::position(format!(
                                "position opened: {} {} @ {:.2}",
                                position.trading_symbol,
                                position.net_quantity,
                                position.avg_entry_price
                            ))
                            .with_symbol(position.trading_symbol.clone()),
                        );
                    } else if was_open && position.is_flat() {
                        session.brackets.remove(&position.instrument_token);
                        self.activity.push(
                            Activity::position(format!(
                                "position closed: {} (realised {:.2})",
                                position.trading_symbol, position.realized_pnl
                            ))
                            .with_symbol(position.trading_symbol.clone()),
                        );
                    }
                }
                session.positions = positions;
            }
            Err(e) => self
                .activity
                .push(Activity::error(format!("position poll failed: {e}"))),
        }

        match session.broker.orders().await {
            Ok(orders) => {
                for order in &orders {
                    let previous = session.known_order_status.get(&order.broker_order_id);
                    match previous {
                        Some(&prev) if prev != order.status => {
                            if !prev.can_transition_to(order.status) {
                                warn!(
                                    order_id = %order.broker_order_id,
                                    from = %prev,
                                    to = %order.status,
                                    "order status regressed, keeping broker's word"
                                );
                            }
                            self.activity.push(
                                Activity::order(format!(
                                    "order {} {} -> {}",
                                    order.broker_order_id, prev, order.status
                                ))
                                .with_symbol(order.trading_symbol.clone()),
                            );
                        }
                        None if order.status == OrderStatus::Rejected => {
                            self.activity.push(
                                Activity::warning(format!(
                                    "order {} rejected: {}",
                                    order.broker_order_id,
                                    order
                                        .rejection_reason
                                        .as_deref()
                                        .unwrap_or("no reason given")
                                ))
                                .with_symbol(order.trading_symbol.clone()),
                            );
                        }
                        _ => {}
                    }
                    session
                        .known_order_status
                        .insert(order.broker_order_id.clone(), order.status);
                }
                session.orders = orders;
            }
            Err(e) => self
                .activity
                .push(Activity::error(format!("order poll failed: {e}"))),
        }

        match session.broker.trades(session.last_trade_seen).await {
            Ok(trades) => {
                for trade in &trades {
                    self.activity.push(
                        Activity::position(format!(
                            "fill: {} {} x{} @ {:.2}",
                            trade.side, trade.trading_symbol, trade.quantity, trade.price
                        ))
                        .with_symbol(trade.trading_symbol.clone()),
                    );
                    let newest = session.last_trade_seen.get_or_insert(trade.timestamp);
                    if trade.timestamp > *newest {
                        *newest = trade.timestamp;
                    }
                }
            }
            Err(e) => self
                .activity
                .push(Activity::error(format!("trade poll failed: {e}"))),
        }
    }

    /// Apply stop-loss / take-profit exits for positions whose broker holds
    /// no bracket of its own.
    async fn enforce_brackets(
        &mut self,
        session: &mut RunSession,
        quotes: &HashMap<u32, Quote>,
    ) {
        let candidates: Vec<(Instrument, Position, f64, &'static str)> = session
            .positions
            .iter()
            .filter(|p| !p.is_flat())
            .filter_map(|position| {
                let bracket = session.brackets.get(&position.instrument_token)?;
                let quote = quotes.get(&position.instrument_token)?;
                let last = quote.last;

                let breach = match bracket.side {
                    Side::Buy => {
                        if last <= bracket.stop_loss {
                            Some(("stop loss hit", bracket.stop_loss))
                        } else if last >= bracket.take_profit {
                            Some(("target hit", bracket.take_profit))
                        } else {
                            None
                        }
                    }
                    Side::Sell => {
                        if last >= bracket.stop_loss {
                            Some(("stop loss hit", bracket.stop_loss))
                        } else if last <= bracket.take_profit {
                            Some(("target hit", bracket.take_profit))
                        } else {
                            None
                        }
                    }
                };

                let instrument = session
                    .instruments
                    .iter()
                    .find(|i| i.instrument_token == position.instrument_token)?
                    .clone();
                breach.map(|(label, level)| (instrument, position.clone(), level, label))
            })
            .collect();

        for (instrument, position, level, label) in candidates {
            match Self::submit_close(session, &instrument, &position).await {
                Ok(order_id) => {
                    self.activity.push(
                        Activity::position(format!(
                            "{label} at {level:.2} for {}, exit order {order_id} submitted",
                            position.trading_symbol
                        ))
                        .with_symbol(position.trading_symbol.clone()),
                    );
                }
                Err(e) => {
                    error!(symbol = %position.trading_symbol, error = %e, "bracket exit failed");
                    self.activity.push(
                        Activity::error(format!("bracket exit failed: {e}"))
                            .with_symbol(position.trading_symbol.clone()),
                    );
                }
            }
        }
    }
}
