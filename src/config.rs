// =============================================================================
// Bot Configuration — validated settings consumed by the supervisor
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file. Unknown keys in an incoming
// JSON document are ignored with a warning; required invariants are checked
// by `validate()` before the supervisor will accept a config.
// =============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{InstrumentRef, Timeframe};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_broker() -> String {
    "paper".to_string()
}

fn default_strategy() -> String {
    "trend_follow".to_string()
}

fn default_timeframe() -> Timeframe {
    Timeframe::M5
}

fn default_risk_per_trade_percent() -> f64 {
    1.0
}

fn default_reward_ratio() -> f64 {
    2.0
}

fn default_atr_multiplier() -> f64 {
    1.5
}

fn default_max_positions() -> u32 {
    3
}

fn default_max_daily_loss_percent() -> f64 {
    2.0
}

fn default_poll_interval_seconds() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_trading_hours() -> TradingHours {
    TradingHours {
        start: "09:15".to_string(),
        end: "15:30".to_string(),
    }
}

// =============================================================================
// Sub-structures
// =============================================================================

/// Exchange-local trading window. Ticks outside the window are
/// analysis-only: decisions are computed and logged but no orders go out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingHours {
    /// "HH:MM", exchange local time.
    pub start: String,
    /// "HH:MM", exchange local time.
    pub end: String,
}

impl TradingHours {
    /// Parse "HH:MM" into minutes since midnight.
    fn parse_hhmm(s: &str) -> Option<u32> {
        let (h, m) = s.split_once(':')?;
        let h: u32 = h.parse().ok()?;
        let m: u32 = m.parse().ok()?;
        if h > 23 || m > 59 {
            return None;
        }
        Some(h * 60 + m)
    }

    /// Whether `time` ("HH:MM" equivalent, minutes since midnight) falls in
    /// the window. The window is inclusive on both ends.
    pub fn contains_minutes(&self, minutes: u32) -> bool {
        match (Self::parse_hhmm(&self.start), Self::parse_hhmm(&self.end)) {
            (Some(s), Some(e)) => minutes >= s && minutes <= e,
            _ => true, // malformed windows never block trading; validate() rejects them upfront
        }
    }

    pub fn is_valid(&self) -> bool {
        match (Self::parse_hhmm(&self.start), Self::parse_hhmm(&self.end)) {
            (Some(s), Some(e)) => s < e,
            _ => false,
        }
    }
}

/// Optional overrides for indicator lookbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorParams {
    #[serde(default = "IndicatorParams::default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "IndicatorParams::default_ema_slow")]
    pub ema_slow: usize,
    #[serde(default = "IndicatorParams::default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "IndicatorParams::default_macd_fast")]
    pub macd_fast: usize,
    #[serde(default = "IndicatorParams::default_macd_slow")]
    pub macd_slow: usize,
    #[serde(default = "IndicatorParams::default_macd_signal")]
    pub macd_signal: usize,
    #[serde(default = "IndicatorParams::default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "IndicatorParams::default_adx_period")]
    pub adx_period: usize,
    #[serde(default = "IndicatorParams::default_bollinger_period")]
    pub bollinger_period: usize,
    #[serde(default = "IndicatorParams::default_bollinger_k")]
    pub bollinger_k: f64,
    #[serde(default = "IndicatorParams::default_volume_ma_period")]
    pub volume_ma_period: usize,
}

impl IndicatorParams {
    fn default_ema_fast() -> usize {
        9
    }
    fn default_ema_slow() -> usize {
        21
    }
    fn default_rsi_period() -> usize {
        14
    }
    fn default_macd_fast() -> usize {
        12
    }
    fn default_macd_slow() -> usize {
        26
    }
    fn default_macd_signal() -> usize {
        9
    }
    fn default_atr_period() -> usize {
        14
    }
    fn default_adx_period() -> usize {
        14
    }
    fn default_bollinger_period() -> usize {
        20
    }
    fn default_bollinger_k() -> f64 {
        2.0
    }
    fn default_volume_ma_period() -> usize {
        20
    }

    /// The longest lookback any indicator needs, used to size the warmup
    /// history the supervisor seeds before the first tick.
    pub fn warmup_bars(&self) -> usize {
        let candidates = [
            self.ema_slow,
            self.rsi_period + 1,
            self.macd_slow + self.macd_signal,
            self.atr_period + 1,
            // ADX needs two smoothing passes over the period.
            self.adx_period * 2 + 1,
            self.bollinger_period,
            self.volume_ma_period,
        ];
        let max = candidates.into_iter().max().unwrap_or(50);
        // Headroom so EMA recursion has settled past its seed.
        max * 3
    }
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            ema_fast: Self::default_ema_fast(),
            ema_slow: Self::default_ema_slow(),
            rsi_period: Self::default_rsi_period(),
            macd_fast: Self::default_macd_fast(),
            macd_slow: Self::default_macd_slow(),
            macd_signal: Self::default_macd_signal(),
            atr_period: Self::default_atr_period(),
            adx_period: Self::default_adx_period(),
            bollinger_period: Self::default_bollinger_period(),
            bollinger_k: Self::default_bollinger_k(),
            volume_ma_period: Self::default_volume_ma_period(),
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// The persisted configuration consumed by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Adapter to use: `paper` or a supported live broker name.
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Instruments the bot watches and trades.
    #[serde(default)]
    pub instruments: Vec<InstrumentRef>,

    /// Strategy name: `trend_follow | mean_revert | momentum | scalping`.
    #[serde(default = "default_strategy")]
    pub strategy: String,

    #[serde(default = "default_timeframe")]
    pub timeframe: Timeframe,

    /// Percent of equity risked per trade; must be in (0, 5].
    #[serde(default = "default_risk_per_trade_percent")]
    pub risk_per_trade_percent: f64,

    /// Target-to-stop ratio, > 0.
    #[serde(default = "default_reward_ratio")]
    pub reward_ratio: f64,

    /// Stop distance in ATR units when the strategy supplies no stop.
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,

    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    #[serde(default = "default_max_daily_loss_percent")]
    pub max_daily_loss_percent: f64,

    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    #[serde(default = "default_trading_hours")]
    pub trading_hours: TradingHours,

    /// If true, forces the paper adapter regardless of `broker`.
    #[serde(default = "default_true")]
    pub paper_trading: bool,

    #[serde(default)]
    pub indicator_params: IndicatorParams,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            instruments: Vec::new(),
            strategy: default_strategy(),
            timeframe: default_timeframe(),
            risk_per_trade_percent: default_risk_per_trade_percent(),
            reward_ratio: default_reward_ratio(),
            atr_multiplier: default_atr_multiplier(),
            max_positions: default_max_positions(),
            max_daily_loss_percent: default_max_daily_loss_percent(),
            poll_interval_seconds: default_poll_interval_seconds(),
            trading_hours: default_trading_hours(),
            paper_trading: true,
            indicator_params: IndicatorParams::default(),
        }
    }
}

/// A single field-level validation failure.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigViolation {
    pub field: String,
    pub message: String,
}

pub const KNOWN_STRATEGIES: &[&str] = &["trend_follow", "mean_revert", "momentum", "scalping"];
pub const KNOWN_BROKERS: &[&str] = &["paper", "zerodha"];

impl BotConfig {
    /// Effective broker name after the `paper_trading` override.
    pub fn effective_broker(&self) -> &str {
        if self.paper_trading {
            "paper"
        } else {
            self.broker.as_str()
        }
    }

    /// Check every invariant; returns all violations, not just the first.
    pub fn validate(&self) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();
        let mut fail = |field: &str, message: String| {
            violations.push(ConfigViolation {
                field: field.to_string(),
                message,
            });
        };

        if !KNOWN_BROKERS.contains(&self.broker.as_str()) {
            fail("broker", format!("unknown broker '{}'", self.broker));
        }
        if self.instruments.is_empty() {
            fail("instruments", "at least one instrument is required".into());
        }
        let mut seen = HashSet::new();
        for inst in &self.instruments {
            if !seen.insert((inst.exchange, inst.trading_symbol.clone())) {
                fail("instruments", format!("duplicate instrument {inst}"));
            }
            if inst.trading_symbol.trim().is_empty() {
                fail("instruments", "empty trading_symbol".into());
            }
        }
        if !KNOWN_STRATEGIES.contains(&self.strategy.as_str()) {
            fail("strategy", format!("unknown strategy '{}'", self.strategy));
        }
        if !(self.risk_per_trade_percent > 0.0 && self.risk_per_trade_percent <= 5.0) {
            fail(
                "risk_per_trade_percent",
                format!(
                    "must be in (0, 5], got {}",
                    self.risk_per_trade_percent
                ),
            );
        }
        if self.reward_ratio <= 0.0 {
            fail("reward_ratio", format!("must be > 0, got {}", self.reward_ratio));
        }
        if self.atr_multiplier <= 0.0 {
            fail("atr_multiplier", format!("must be > 0, got {}", self.atr_multiplier));
        }
        if self.max_positions < 1 {
            fail("max_positions", "must be >= 1".into());
        }
        if self.max_daily_loss_percent <= 0.0 {
            fail(
                "max_daily_loss_percent",
                format!("must be > 0, got {}", self.max_daily_loss_percent),
            );
        }
        if self.poll_interval_seconds < 5 {
            fail(
                "poll_interval_seconds",
                format!("must be >= 5, got {}", self.poll_interval_seconds),
            );
        }
        if !self.trading_hours.is_valid() {
            fail(
                "trading_hours",
                format!(
                    "start must be HH:MM and precede end, got {}..{}",
                    self.trading_hours.start, self.trading_hours.end
                ),
            );
        }

        violations
    }

    /// Parse a JSON document into a config, warning on unknown keys.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        if let Some(obj) = value.as_object() {
            let known: HashSet<&str> = [
                "broker",
                "instruments",
                "strategy",
                "timeframe",
                "risk_per_trade_percent",
                "reward_ratio",
                "atr_multiplier",
                "max_positions",
                "max_daily_loss_percent",
                "poll_interval_seconds",
                "trading_hours",
                "paper_trading",
                "indicator_params",
            ]
            .into_iter()
            .collect();
            for key in obj.keys() {
                if !known.contains(key.as_str()) {
                    warn!(key = %key, "ignoring unknown config key");
                }
            }
        }
        let config: Self =
            serde_json::from_value(value.clone()).context("failed to parse bot config")?;
        Ok(config)
    }
}

// =============================================================================
// ConfigStore — current + named variants under APP_DATA_DIR/config
// =============================================================================

/// Filesystem-backed store for the active config and named saved variants.
///
/// Layout:
///   config/current.json
///   config/named/<name>.json
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("config");
        std::fs::create_dir_all(dir.join("named"))
            .with_context(|| format!("failed to create config dir under {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join("current.json")
    }

    fn named_path(&self, name: &str) -> PathBuf {
        self.dir.join("named").join(format!("{name}.json"))
    }

    /// Names are used as file names; keep them to a safe character set.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    /// Load the active config; `None` when nothing has been saved yet.
    pub fn load_current(&self) -> Result<Option<BotConfig>> {
        Self::load_file(&self.current_path())
    }

    /// Persist the active config atomically.
    pub fn save_current(&self, config: &BotConfig) -> Result<()> {
        Self::save_file(&self.current_path(), config)?;
        info!("bot config saved (current)");
        Ok(())
    }

    pub fn load_named(&self, name: &str) -> Result<Option<BotConfig>> {
        Self::load_file(&self.named_path(name))
    }

    pub fn save_named(&self, name: &str, config: &BotConfig) -> Result<()> {
        Self::save_file(&self.named_path(name), config)?;
        info!(name = %name, "bot config saved (named)");
        Ok(())
    }

    pub fn delete_named(&self, name: &str) -> Result<bool> {
        let path = self.named_path(name);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to delete config {}", path.display()))?;
        Ok(true)
    }

    /// Saved variant names, sorted.
    pub fn list_named(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let named_dir = self.dir.join("named");
        for entry in std::fs::read_dir(&named_dir)
            .with_context(|| format!("failed to read {}", named_dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn load_file(path: &Path) -> Result<Option<BotConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        Ok(Some(BotConfig::from_json(&value)?))
    }

    fn save_file(path: &Path, config: &BotConfig) -> Result<()> {
        let content =
            serde_json::to_string_pretty(config).context("failed to serialise bot config")?;

        // Atomic write: tmp sibling, then rename.
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        Ok(())
    }
}

/// Built-in presets surfaced by `GET /api/config/presets`.
pub fn presets() -> Vec<(String, BotConfig)> {
    let conservative = BotConfig {
        risk_per_trade_percent: 0.5,
        reward_ratio: 2.0,
        max_positions: 1,
        max_daily_loss_percent: 1.0,
        strategy: "trend_follow".to_string(),
        ..BotConfig::default()
    };
    let balanced = BotConfig::default();
    let aggressive = BotConfig {
        risk_per_trade_percent: 2.0,
        reward_ratio: 1.5,
        max_positions: 5,
        max_daily_loss_percent: 4.0,
        strategy: "momentum".to_string(),
        timeframe: Timeframe::M15,
        ..BotConfig::default()
    };
    vec![
        ("conservative".to_string(), conservative),
        ("balanced".to_string(), balanced),
        ("aggressive".to_string(), aggressive),
    ]
}
