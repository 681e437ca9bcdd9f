// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   macd      = EMA(fast) - EMA(slow)
//   signal    = EMA(signal_period) of the macd line
//   histogram = macd - signal
//
// Strategies watch the histogram's sign changes, so the series form is the
// primary API; `IndicatorSet` keeps the last two points.
// =============================================================================

use serde::Serialize;

use super::ema::calculate_ema;

#[derive(Debug, Clone, Serialize)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Full MACD series for `closes`. Empty when the input cannot cover
/// `slow + signal_period` closes or any period is zero.
pub fn calculate_macd_series(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Vec<MacdResult> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return Vec::new();
    }
    if closes.len() < slow + signal_period {
        return Vec::new();
    }

    let fast_series = calculate_ema(closes, fast);
    let slow_series = calculate_ema(closes, slow);
    if slow_series.is_empty() {
        return Vec::new();
    }

    // The slow series starts `slow - fast` elements later; align the fast
    // series to it before differencing.
    let offset = slow - fast;
    if fast_series.len() <= offset {
        return Vec::new();
    }
    let macd_line: Vec<f64> = fast_series[offset..]
        .iter()
        .zip(slow_series.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = calculate_ema(&macd_line, signal_period);
    if signal_series.is_empty() {
        return Vec::new();
    }

    // The signal series starts `signal_period - 1` into the macd line.
    let macd_offset = signal_period - 1;
    macd_line[macd_offset..]
        .iter()
        .zip(signal_series.iter())
        .map(|(&macd, &signal)| MacdResult {
            macd,
            signal,
            histogram: macd - signal,
        })
        .collect()
}

/// Most recent MACD point, if computable.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    calculate_macd_series(closes, fast, slow, signal_period)
        .last()
        .cloned()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_guards() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd_series(&closes, 0, 26, 9).is_empty());
        assert!(calculate_macd_series(&closes, 26, 12, 9).is_empty());
        assert!(calculate_macd_series(&closes[..20], 12, 26, 9).is_empty());
    }

    #[test]
    fn macd_histogram_is_macd_minus_signal() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + (i as f64 * 0.2).sin() * 5.0).collect();
        let series = calculate_macd_series(&closes, 12, 26, 9);
        assert!(!series.is_empty());
        for point in &series {
            assert!((point.histogram - (point.macd - point.signal)).abs() < 1e-10);
        }
    }

    #[test]
    fn macd_positive_in_uptrend() {
        // In a sustained uptrend the fast EMA rides above the slow EMA.
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + i as f64).collect();
        let last = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(last.macd > 0.0);
    }

    #[test]
    fn macd_negative_in_downtrend() {
        let closes: Vec<f64> = (0..120).map(|i| 300.0 - i as f64).collect();
        let last = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(last.macd < 0.0);
    }

    #[test]
    fn macd_flat_series_is_zero() {
        let closes = vec![50.0; 120];
        let last = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(last.macd.abs() < 1e-10);
        assert!(last.signal.abs() < 1e-10);
        assert!(last.histogram.abs() < 1e-10);
    }

    #[test]
    fn macd_histogram_flips_after_reversal() {
        // A long rise then a hard fall must eventually flip the histogram
        // from positive to negative.
        let mut closes: Vec<f64> = (0..80).map(|i| 100.0 + i as f64).collect();
        closes.extend((0..60).map(|i| 180.0 - i as f64 * 2.0));
        let series = calculate_macd_series(&closes, 12, 26, 9);
        assert!(series.iter().any(|p| p.histogram > 0.0));
        assert!(series.last().unwrap().histogram < 0.0);
    }
}
