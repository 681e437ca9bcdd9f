// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period); upper/lower = middle ± k * σ over the same
// window. Width = (upper - lower) / middle * 100, a normalised volatility
// read.
// =============================================================================

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub mid: f64,
    pub lower: f64,
    pub width: f64,
}

/// Bands over the trailing `period` closes. `None` when the input is too
/// short, the mid band is zero, or the result is non-finite.
pub fn calculate_bollinger(closes: &[f64], period: usize, k: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let mid = window.iter().sum::<f64>() / period as f64;
    if mid == 0.0 || !mid.is_finite() {
        return None;
    }

    let variance = window.iter().map(|x| (x - mid).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = mid + k * std_dev;
    let lower = mid - k * std_dev;
    let width = (upper - lower) / mid * 100.0;

    width.is_finite().then_some(BollingerBands {
        upper,
        mid,
        lower,
        width,
    })
}
