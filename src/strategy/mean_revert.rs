// =============================================================================
// Mean-revert strategy
// =============================================================================
//
// Fades extremes inside a ranging market: buy when the close touches the
// lower Bollinger band with RSI oversold and ADX confirming the absence of
// a trend; sell at the upper band / overbought. The band midline is the
// profit anchor and the stop sits half a band beyond the touched band.
// =============================================================================

use crate::indicators::IndicatorSet;
use crate::types::Bar;

use super::{resolve, Decision, Signal, StrategyConfig};

pub fn evaluate(set: &IndicatorSet, _bars: &[Bar], config: &StrategyConfig) -> Decision {
    let Some(bb) = set.bollinger.as_ref() else {
        return Decision::insufficient_data("bollinger bands");
    };
    let Some(rsi) = set.rsi else {
        return Decision::insufficient_data("rsi");
    };
    let Some(adx) = set.adx.as_ref() else {
        return Decision::insufficient_data("adx");
    };

    if adx.adx >= config.adx_ranging_threshold {
        return Decision::hold(format!(
            "adx {:.1} signals a trend, refusing to fade it",
            adx.adx
        ));
    }

    let half_band = (bb.mid - bb.lower).max(0.0);

    let buy = (set.close <= bb.lower && rsi < config.rsi_oversold).then(|| {
        // Deeper oversold readings score higher.
        let depth = ((config.rsi_oversold - rsi) / config.rsi_oversold).clamp(0.0, 1.0);
        Signal {
            confidence: (0.5 + depth * 0.4).min(0.9),
            reason: format!(
                "close {:.2} at lower band with rsi {:.1} oversold in range",
                set.close, rsi
            ),
            suggested_stop: Some(bb.lower - half_band * 0.5),
            suggested_target: Some(bb.mid),
        }
    });

    let sell = (set.close >= bb.upper && rsi > config.rsi_overbought).then(|| {
        let depth = ((rsi - config.rsi_overbought) / (100.0 - config.rsi_overbought))
            .clamp(0.0, 1.0);
        Signal {
            confidence: (0.5 + depth * 0.4).min(0.9),
            reason: format!(
                "close {:.2} at upper band with rsi {:.1} overbought in range",
                set.close, rsi
            ),
            suggested_stop: Some(bb.upper + half_band * 0.5),
            suggested_target: Some(bb.mid),
        }
    });

    resolve(buy, sell)
}
