// =============================================================================
// Strategy Evaluators
// =============================================================================
//
// A strategy is a pure function `(IndicatorSet, recent bars, config) ->
// Decision`. Undefined indicators always come out as Hold with an
// insufficient-data reason; evaluators never panic on missing inputs.
//
// Tie-break rule: when both a buy and a sell case fire, the stronger
// (higher-confidence) signal wins; equal confidence yields Hold.
// Confidence is each strategy's local, calibrated score in [0, 1] and is
// not comparable across strategies.
// =============================================================================

pub mod mean_revert;
pub mod momentum;
pub mod scalping;
pub mod trend_follow;

use serde::Serialize;

use crate::config::IndicatorParams;
use crate::indicators::IndicatorSet;
use crate::types::Bar;

// =============================================================================
// Decision
// =============================================================================

/// Payload of an actionable decision.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    /// Strategy-local score in [0, 1].
    pub confidence: f64,
    pub reason: String,
    /// Price anchor for the stop; the risk layer falls back to ATR sizing
    /// when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_stop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_target: Option<f64>,
}

/// What a strategy wants done about one instrument right now.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Buy(Signal),
    Sell(Signal),
    Hold { confidence: f64, reason: String },
}

impl Decision {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self::Hold {
            confidence: 0.0,
            reason: reason.into(),
        }
    }

    pub fn insufficient_data(what: &str) -> Self {
        Self::hold(format!("insufficient data: {what}"))
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, Self::Hold { .. })
    }

    pub fn confidence(&self) -> f64 {
        match self {
            Self::Buy(s) | Self::Sell(s) => s.confidence,
            Self::Hold { confidence, .. } => *confidence,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Buy(s) | Self::Sell(s) => &s.reason,
            Self::Hold { reason, .. } => reason,
        }
    }

    pub fn action_str(&self) -> &'static str {
        match self {
            Self::Buy(_) => "buy",
            Self::Sell(_) => "sell",
            Self::Hold { .. } => "hold",
        }
    }
}

/// Apply the tie-break rule to simultaneous buy/sell candidates.
pub(crate) fn resolve(buy: Option<Signal>, sell: Option<Signal>) -> Decision {
    match (buy, sell) {
        (Some(b), Some(s)) => {
            if b.confidence > s.confidence {
                Decision::Buy(b)
            } else if s.confidence > b.confidence {
                Decision::Sell(s)
            } else {
                Decision::hold("buy and sell signals tied, standing aside")
            }
        }
        (Some(b), None) => Decision::Buy(b),
        (None, Some(s)) => Decision::Sell(s),
        (None, None) => Decision::hold("no setup"),
    }
}

// =============================================================================
// Strategy selection
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    TrendFollow,
    MeanRevert,
    Momentum,
    Scalping,
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trend_follow" => Ok(Self::TrendFollow),
            "mean_revert" => Ok(Self::MeanRevert),
            "momentum" => Ok(Self::Momentum),
            "scalping" => Ok(Self::Scalping),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrendFollow => "trend_follow",
            Self::MeanRevert => "mean_revert",
            Self::Momentum => "momentum",
            Self::Scalping => "scalping",
        };
        f.write_str(s)
    }
}

impl StrategyKind {
    /// Indicator lookbacks this strategy actually wants. Scalping runs the
    /// configured lookbacks at half length (floored so nothing degenerates
    /// to zero).
    pub fn effective_params(&self, base: &IndicatorParams) -> IndicatorParams {
        match self {
            Self::Scalping => IndicatorParams {
                ema_fast: (base.ema_fast / 2).max(3),
                ema_slow: (base.ema_slow / 2).max(8),
                rsi_period: (base.rsi_period / 2).max(5),
                macd_fast: (base.macd_fast / 2).max(5),
                macd_slow: (base.macd_slow / 2).max(11),
                macd_signal: (base.macd_signal / 2).max(4),
                atr_period: (base.atr_period / 2).max(5),
                adx_period: (base.adx_period / 2).max(5),
                bollinger_period: (base.bollinger_period / 2).max(10),
                bollinger_k: base.bollinger_k,
                volume_ma_period: (base.volume_ma_period / 2).max(10),
            },
            _ => base.clone(),
        }
    }
}

/// Strategy thresholds. These are strategy-level knobs, distinct from the
/// indicator lookbacks in `IndicatorParams`.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// ADX at or above this reads as trending (trend-follow gate).
    pub adx_trend_threshold: f64,
    /// ADX below this reads as ranging (mean-revert gate).
    pub adx_ranging_threshold: f64,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    /// Scalping refuses entries on thinner volume than this ratio.
    pub min_volume_ratio: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            adx_trend_threshold: 25.0,
            adx_ranging_threshold: 20.0,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            min_volume_ratio: 1.2,
        }
    }
}

/// Evaluate `kind` over the prepared inputs. Evaluators are pure; a broken
/// input yields Hold, never a panic.
pub fn evaluate(
    kind: StrategyKind,
    set: &IndicatorSet,
    bars: &[Bar],
    config: &StrategyConfig,
) -> Decision {
    match kind {
        StrategyKind::TrendFollow => trend_follow::evaluate(set, bars, config),
        StrategyKind::MeanRevert => mean_revert::evaluate(set, bars, config),
        StrategyKind::Momentum => momentum::evaluate(set, bars, config),
        StrategyKind::Scalping => scalping::evaluate(set, bars, config),
    }
}

// =============================================================================
// Test helpers
// =============================================================================
#[cfg(test)]
pub(crate) mod testutil {
    use crate::indicators::{AdxResult, BollingerBands, IndicatorSet, MacdResult};

    /// A fully populated, neutral indicator set tests can mutate.
    pub fn neutral_set(close: f64) -> IndicatorSet {
        IndicatorSet {
            close,
            ema_fast: Some(close),
            ema_slow: Some(close),
            prev_ema_fast: Some(close),
            prev_ema_slow: Some(close),
            rsi: Some(50.0),
            macd: Some(MacdResult {
                macd: 0.0,
                signal: 0.0,
                histogram: 0.0,
            }),
            prev_macd: Some(MacdResult {
                macd: 0.0,
                signal: 0.0,
                histogram: 0.0,
            }),
            atr: Some(close * 0.01),
            adx: Some(AdxResult {
                adx: 15.0,
                plus_di: 20.0,
                minus_di: 20.0,
            }),
            bollinger: Some(BollingerBands {
                upper: close * 1.02,
                mid: close,
                lower: close * 0.98,
                width: 4.0,
            }),
            volume_ma: Some(100_000.0),
            volume_ratio: Some(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(confidence: f64) -> Signal {
        Signal {
            confidence,
            reason: "test".into(),
            suggested_stop: None,
            suggested_target: None,
        }
    }

    #[test]
    fn resolve_prefers_stronger_signal() {
        let d = resolve(Some(signal(0.8)), Some(signal(0.5)));
        assert!(matches!(d, Decision::Buy(_)));

        let d = resolve(Some(signal(0.4)), Some(signal(0.9)));
        assert!(matches!(d, Decision::Sell(_)));
    }

    #[test]
    fn resolve_equal_confidence_holds() {
        let d = resolve(Some(signal(0.6)), Some(signal(0.6)));
        assert!(!d.is_actionable());
    }

    #[test]
    fn strategy_kind_parsing() {
        assert_eq!(
            "trend_follow".parse::<StrategyKind>().unwrap(),
            StrategyKind::TrendFollow
        );
        assert_eq!(
            "scalping".parse::<StrategyKind>().unwrap(),
            StrategyKind::Scalping
        );
        assert!("martingale".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn scalping_halves_lookbacks() {
        let base = IndicatorParams::default();
        let scalp = StrategyKind::Scalping.effective_params(&base);
        assert!(scalp.ema_fast < base.ema_fast);
        assert!(scalp.ema_slow < base.ema_slow);
        assert!(scalp.adx_period < base.adx_period);
        // Other strategies keep the configured lookbacks.
        let same = StrategyKind::TrendFollow.effective_params(&base);
        assert_eq!(same.ema_fast, base.ema_fast);
    }

    #[test]
    fn hold_constructors() {
        let d = Decision::insufficient_data("ema");
        assert!(!d.is_actionable());
        assert!(d.reason().contains("insufficient data"));
        assert_eq!(d.confidence(), 0.0);
        assert_eq!(d.action_str(), "hold");
    }
}
