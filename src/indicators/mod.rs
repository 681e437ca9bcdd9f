// =============================================================================
// Indicator Pipeline
// =============================================================================
//
// Pure, side-effect-free functions from bar series to values. Every public
// function returns `Option<T>` so callers are forced to handle
// insufficient-data and numerical edge cases; strategies treat `None` as
// Hold. All math is double-precision floating point.
// =============================================================================

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod volume;

use serde::Serialize;

use crate::config::IndicatorParams;
use crate::types::Bar;

pub use adx::AdxResult;
pub use bollinger::BollingerBands;
pub use macd::MacdResult;

/// The most recent value of each configured indicator, computed from a
/// suffix of the bar series. A pure function of its inputs; recomputed on
/// every supervisor tick.
///
/// `prev_*` fields carry the previous bar's value where strategies need to
/// detect a crossover rather than a level.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorSet {
    pub close: f64,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub prev_ema_fast: Option<f64>,
    pub prev_ema_slow: Option<f64>,
    pub rsi: Option<f64>,
    pub macd: Option<MacdResult>,
    pub prev_macd: Option<MacdResult>,
    pub atr: Option<f64>,
    pub adx: Option<AdxResult>,
    pub bollinger: Option<BollingerBands>,
    pub volume_ma: Option<f64>,
    /// Last bar's volume divided by the volume MA.
    pub volume_ratio: Option<f64>,
}

impl IndicatorSet {
    /// Compute all indicators for the given closed bars (oldest first).
    ///
    /// Returns `None` only when there is no bar at all; individual
    /// indicators that lack data are `None` inside the set.
    pub fn compute(bars: &[Bar], params: &IndicatorParams) -> Option<IndicatorSet> {
        let last = bars.last()?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let ema_fast_series = ema::calculate_ema(&closes, params.ema_fast);
        let ema_slow_series = ema::calculate_ema(&closes, params.ema_slow);
        let macd_series =
            macd::calculate_macd_series(&closes, params.macd_fast, params.macd_slow, params.macd_signal);

        let last_two = |s: &[f64]| -> (Option<f64>, Option<f64>) {
            let n = s.len();
            (
                n.checked_sub(1).and_then(|i| s.get(i)).copied(),
                n.checked_sub(2).and_then(|i| s.get(i)).copied(),
            )
        };
        let (ema_fast, prev_ema_fast) = last_two(&ema_fast_series);
        let (ema_slow, prev_ema_slow) = last_two(&ema_slow_series);

        let macd_last = macd_series.last().cloned();
        let prev_macd = macd_series
            .len()
            .checked_sub(2)
            .and_then(|i| macd_series.get(i))
            .cloned();

        Some(IndicatorSet {
            close: last.close,
            ema_fast,
            ema_slow,
            prev_ema_fast,
            prev_ema_slow,
            rsi: rsi::calculate_rsi(&closes, params.rsi_period).last().copied(),
            macd: macd_last,
            prev_macd,
            atr: atr::calculate_atr(bars, params.atr_period),
            adx: adx::calculate_adx(bars, params.adx_period),
            bollinger: bollinger::calculate_bollinger(
                &closes,
                params.bollinger_period,
                params.bollinger_k,
            ),
            volume_ma: volume::volume_ma(bars, params.volume_ma_period),
            volume_ratio: volume::volume_ratio(bars, params.volume_ma_period),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::bars_from_closes;
    use super::*;

    #[test]
    fn compute_on_empty_input_is_none() {
        assert!(IndicatorSet::compute(&[], &IndicatorParams::default()).is_none());
    }

    #[test]
    fn compute_with_short_series_leaves_indicators_undefined() {
        let bars = bars_from_closes(&[100.0, 101.0, 102.0]);
        let set = IndicatorSet::compute(&bars, &IndicatorParams::default()).unwrap();
        assert!(set.ema_slow.is_none());
        assert!(set.rsi.is_none());
        assert!(set.adx.is_none());
        assert!(set.macd.is_none());
        assert!((set.close - 102.0).abs() < 1e-12);
    }

    #[test]
    fn compute_with_long_series_fills_everything() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + (i as f64 * 0.3).sin()).collect();
        let bars = bars_from_closes(&closes);
        let set = IndicatorSet::compute(&bars, &IndicatorParams::default()).unwrap();
        assert!(set.ema_fast.is_some());
        assert!(set.ema_slow.is_some());
        assert!(set.prev_ema_fast.is_some());
        assert!(set.rsi.is_some());
        assert!(set.macd.is_some());
        assert!(set.prev_macd.is_some());
        assert!(set.atr.is_some());
        assert!(set.adx.is_some());
        assert!(set.bollinger.is_some());
        assert!(set.volume_ma.is_some());
        assert!(set.volume_ratio.is_some());
    }

    #[test]
    fn warmup_bars_covers_default_lookbacks() {
        let params = IndicatorParams::default();
        let warmup = params.warmup_bars();
        let closes: Vec<f64> = (0..warmup).map(|i| 100.0 + i as f64 * 0.1).collect();
        let bars = bars_from_closes(&closes);
        let set = IndicatorSet::compute(&bars, &params).unwrap();
        assert!(set.adx.is_some(), "warmup window too small for ADX");
        assert!(set.macd.is_some(), "warmup window too small for MACD");
    }
}
