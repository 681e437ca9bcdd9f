// =============================================================================
// Volume trend — moving average and current-vs-average ratio
// =============================================================================

use crate::types::Bar;

/// SMA of the trailing `period` bar volumes. `None` on short input.
pub fn volume_ma(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let window = &bars[bars.len() - period..];
    let ma = window.iter().map(|b| b.volume as f64).sum::<f64>() / period as f64;
    ma.is_finite().then_some(ma)
}

/// Last bar's volume divided by the volume MA. Values above 1.0 mean the
/// latest bar traded heavier than its recent average. `None` when the MA is
/// undefined or zero.
pub fn volume_ratio(bars: &[Bar], period: usize) -> Option<f64> {
    let ma = volume_ma(bars, period)?;
    if ma == 0.0 {
        return None;
    }
    let last = bars.last()?.volume as f64;
    let ratio = last / ma;
    ratio.is_finite().then_some(ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar_with_volume(volume: u64) -> Bar {
        Bar {
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.0,
            volume,
            timestamp: Utc::now(),
            is_final: true,
        }
    }

    #[test]
    fn ma_and_ratio_basic() {
        let bars: Vec<Bar> = [10, 20, 30, 40].into_iter().map(bar_with_volume).collect();
        assert_eq!(volume_ma(&bars, 4), Some(25.0));
        // 40 / 25
        assert!((volume_ratio(&bars, 4).unwrap() - 1.6).abs() < 1e-10);
    }

    #[test]
    fn guards() {
        let bars: Vec<Bar> = [10, 20].into_iter().map(bar_with_volume).collect();
        assert!(volume_ma(&bars, 4).is_none());
        assert!(volume_ma(&bars, 0).is_none());
        assert!(volume_ratio(&[], 4).is_none());
    }

    #[test]
    fn zero_volume_window_has_no_ratio() {
        let bars: Vec<Bar> = [0, 0, 0, 0].into_iter().map(bar_with_volume).collect();
        assert_eq!(volume_ma(&bars, 4), Some(0.0));
        assert!(volume_ratio(&bars, 4).is_none());
    }
}
