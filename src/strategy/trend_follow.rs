// =============================================================================
// Trend-follow strategy
// =============================================================================
//
// Buy when the fast EMA crosses above the slow EMA with ADX confirming a
// trend and the close holding above the slow EMA; the sell case is the
// mirror image. Everything else is Hold.
// =============================================================================

use crate::indicators::IndicatorSet;
use crate::types::Bar;

use super::{resolve, Decision, Signal, StrategyConfig};

pub fn evaluate(set: &IndicatorSet, _bars: &[Bar], config: &StrategyConfig) -> Decision {
    let (Some(fast), Some(slow), Some(prev_fast), Some(prev_slow)) = (
        set.ema_fast,
        set.ema_slow,
        set.prev_ema_fast,
        set.prev_ema_slow,
    ) else {
        return Decision::insufficient_data("ema history");
    };
    let Some(adx) = set.adx.as_ref() else {
        return Decision::insufficient_data("adx");
    };

    if adx.adx < config.adx_trend_threshold {
        return Decision::hold(format!(
            "adx {:.1} below trend threshold {:.1}",
            adx.adx, config.adx_trend_threshold
        ));
    }

    // Confidence grows with trend strength beyond the gate, saturating at
    // ADX 50.
    let confidence = (0.5 + (adx.adx - config.adx_trend_threshold) / 50.0).clamp(0.5, 0.95);

    let crossed_up = prev_fast <= prev_slow && fast > slow;
    let crossed_down = prev_fast >= prev_slow && fast < slow;

    let buy = (crossed_up && set.close > slow).then(|| Signal {
        confidence,
        reason: format!(
            "fast ema crossed above slow ema with adx {:.1}, close above trend",
            adx.adx
        ),
        suggested_stop: None,
        suggested_target: None,
    });

    let sell = (crossed_down && set.close < slow).then(|| Signal {
        confidence,
        reason: format!(
            "fast ema crossed below slow ema with adx {:.1}, close below trend",
            adx.adx
        ),
        suggested_stop: None,
        suggested_target: None,
    });

    resolve(buy, sell)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testutil::neutral_set;

    fn cfg() -> StrategyConfig {
        StrategyConfig::default()
    }

    #[test]
    fn bullish_cross_with_trend_buys() {
        let mut set = neutral_set(100.0);
        set.prev_ema_fast = Some(99.0);
        set.prev_ema_slow = Some(99.5);
        set.ema_fast = Some(100.2);
        set.ema_slow = Some(99.8);
        set.close = 101.0;
        set.adx.as_mut().unwrap().adx = 30.0;

        let decision = evaluate(&set, &[], &cfg());
        assert!(matches!(decision, Decision::Buy(_)));
        assert!(decision.confidence() >= 0.5);
    }

    #[test]
    fn bearish_cross_with_trend_sells() {
        let mut set = neutral_set(100.0);
        set.prev_ema_fast = Some(100.5);
        set.prev_ema_slow = Some(100.0);
        set.ema_fast = Some(99.5);
        set.ema_slow = Some(99.9);
        set.close = 99.0;
        set.adx.as_mut().unwrap().adx = 35.0;

        assert!(matches!(evaluate(&set, &[], &cfg()), Decision::Sell(_)));
    }

    #[test]
    fn weak_adx_holds_even_on_cross() {
        let mut set = neutral_set(100.0);
        set.prev_ema_fast = Some(99.0);
        set.prev_ema_slow = Some(99.5);
        set.ema_fast = Some(100.2);
        set.ema_slow = Some(99.8);
        set.close = 101.0;
        set.adx.as_mut().unwrap().adx = 12.0;

        let decision = evaluate(&set, &[], &cfg());
        assert!(!decision.is_actionable());
        assert!(decision.reason().contains("adx"));
    }

    #[test]
    fn close_on_wrong_side_of_trend_holds() {
        let mut set = neutral_set(100.0);
        set.prev_ema_fast = Some(99.0);
        set.prev_ema_slow = Some(99.5);
        set.ema_fast = Some(100.2);
        set.ema_slow = Some(99.8);
        // Crossed up, but the close slipped back below the slow EMA.
        set.close = 99.0;
        set.adx.as_mut().unwrap().adx = 30.0;

        assert!(!evaluate(&set, &[], &cfg()).is_actionable());
    }

    #[test]
    fn missing_indicators_hold() {
        let mut set = neutral_set(100.0);
        set.ema_slow = None;
        let decision = evaluate(&set, &[], &cfg());
        assert!(decision.reason().contains("insufficient data"));

        let mut set = neutral_set(100.0);
        set.adx = None;
        assert!(!evaluate(&set, &[], &cfg()).is_actionable());
    }

    #[test]
    fn no_cross_holds() {
        // Fast already above slow on both bars: no fresh cross, no entry.
        let mut set = neutral_set(100.0);
        set.prev_ema_fast = Some(100.5);
        set.prev_ema_slow = Some(99.5);
        set.ema_fast = Some(100.6);
        set.ema_slow = Some(99.6);
        set.close = 101.0;
        set.adx.as_mut().unwrap().adx = 40.0;

        assert!(!evaluate(&set, &[], &cfg()).is_actionable());
    }
}
