// =============================================================================
// Scalping strategy
// =============================================================================
//
// Trend-follow at shorter lookbacks (the supervisor computes the indicator
// set with halved periods for this strategy) plus a volume gate: entries
// are refused unless the latest bar traded meaningfully heavier than its
// recent average. Stops anchor one ATR from the close to keep scalps tight.
// =============================================================================

use crate::indicators::IndicatorSet;
use crate::types::Bar;

use super::{trend_follow, Decision, Signal, StrategyConfig};

pub fn evaluate(set: &IndicatorSet, bars: &[Bar], config: &StrategyConfig) -> Decision {
    let Some(volume_ratio) = set.volume_ratio else {
        return Decision::insufficient_data("volume history");
    };

    if volume_ratio < config.min_volume_ratio {
        return Decision::hold(format!(
            "volume ratio {volume_ratio:.2} below gate {:.2}",
            config.min_volume_ratio
        ));
    }

    // Same cross-and-trend logic as trend-follow; only the entry anchors
    // change.
    match trend_follow::evaluate(set, bars, config) {
        Decision::Buy(signal) => Decision::Buy(tighten(signal, set, true)),
        Decision::Sell(signal) => Decision::Sell(tighten(signal, set, false)),
        hold => hold,
    }
}

/// Scalps carry their own tight ATR stop instead of deferring to the risk
/// layer's wider default.
fn tighten(mut signal: Signal, set: &IndicatorSet, long: bool) -> Signal {
    if let Some(atr) = set.atr {
        signal.suggested_stop = Some(if long {
            set.close - atr
        } else {
            set.close + atr
        });
    }
    signal.reason = format!("scalp: {}", signal.reason);
    signal
}
