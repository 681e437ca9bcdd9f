// =============================================================================
// Momentum strategy
// =============================================================================
//
// Buy on a fresh positive MACD histogram crossover with RSI confirming
// upside room: above the midline but short of overbought. The sell case is
// the mirror: a fresh negative crossover with RSI between oversold and the
// midline.
// =============================================================================

use crate::indicators::IndicatorSet;
use crate::types::Bar;

use super::{resolve, Decision, Signal, StrategyConfig};

pub fn evaluate(set: &IndicatorSet, _bars: &[Bar], config: &StrategyConfig) -> Decision {
    let (Some(macd), Some(prev_macd)) = (set.macd.as_ref(), set.prev_macd.as_ref()) else {
        return Decision::insufficient_data("macd history");
    };
    let Some(rsi) = set.rsi else {
        return Decision::insufficient_data("rsi");
    };

    // Histogram magnitude relative to price, saturating at 0.5% of close.
    let strength = if set.close > 0.0 {
        (macd.histogram.abs() / set.close / 0.005).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let confidence = (0.5 + strength * 0.4).min(0.9);

    let crossed_up = prev_macd.histogram <= 0.0 && macd.histogram > 0.0;
    let crossed_down = prev_macd.histogram >= 0.0 && macd.histogram < 0.0;

    let buy = (crossed_up && rsi > 50.0 && rsi < config.rsi_overbought).then(|| Signal {
        confidence,
        reason: format!(
            "macd histogram crossed positive ({:.4}) with rsi {:.1}",
            macd.histogram, rsi
        ),
        suggested_stop: None,
        suggested_target: None,
    });

    let sell = (crossed_down && rsi < 50.0 && rsi > config.rsi_oversold).then(|| Signal {
        confidence,
        reason: format!(
            "macd histogram crossed negative ({:.4}) with rsi {:.1}",
            macd.histogram, rsi
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

    fn with_histograms(prev: f64, current: f64, rsi: f64) -> crate::indicators::IndicatorSet {
        let mut set = neutral_set(100.0);
        set.prev_macd.as_mut().unwrap().histogram = prev;
        set.macd.as_mut().unwrap().histogram = current;
        set.rsi = Some(rsi);
        set
    }

    #[test]
    fn positive_crossover_with_supportive_rsi_buys() {
        let set = with_histograms(-0.05, 0.2, 58.0);
        let decision = evaluate(&set, &[], &cfg());
        assert!(matches!(decision, Decision::Buy(_)));
        assert!(decision.confidence() >= 0.5);
    }

    #[test]
    fn negative_crossover_with_supportive_rsi_sells() {
        let set = with_histograms(0.05, -0.2, 42.0);
        assert!(matches!(evaluate(&set, &[], &cfg()), Decision::Sell(_)));
    }

    #[test]
    fn overbought_rsi_blocks_the_buy() {
        let set = with_histograms(-0.05, 0.2, 75.0);
        assert!(!evaluate(&set, &[], &cfg()).is_actionable());
    }

    #[test]
    fn rsi_below_midline_blocks_the_buy() {
        let set = with_histograms(-0.05, 0.2, 45.0);
        assert!(!evaluate(&set, &[], &cfg()).is_actionable());
    }

    #[test]
    fn sustained_positive_histogram_is_not_a_crossover() {
        let set = with_histograms(0.3, 0.4, 60.0);
        assert!(!evaluate(&set, &[], &cfg()).is_actionable());
    }

    #[test]
    fn missing_macd_history_holds() {
        let mut set = neutral_set(100.0);
        set.prev_macd = None;
        let decision = evaluate(&set, &[], &cfg());
        assert!(decision.reason().contains("insufficient data"));
    }

    #[test]
    fn larger_histogram_scores_higher() {
        let small = with_histograms(-0.01, 0.05, 60.0);
        let large = with_histograms(-0.01, 0.45, 60.0);
        assert!(
            evaluate(&large, &[], &cfg()).confidence()
                > evaluate(&small, &[], &cfg()).confidence()
        );
    }
}
