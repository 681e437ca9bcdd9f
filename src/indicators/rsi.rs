// =============================================================================
// Relative Strength Index (RSI) — Wilder smoothing
// =============================================================================
//
//   avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   RS       = avg_gain / avg_loss
//   RSI      = 100 - 100 / (1 + RS)
//
// Averages are seeded with the SMA of the first `period` gains / losses.
// =============================================================================

/// Compute the RSI series for `closes` with look-back `period`.
///
/// One value per close starting at index `period` (the first `period`
/// closes seed the averages). Empty when `period == 0` or the input is
/// shorter than `period + 1`. A zero average loss clamps RSI to 100; a
/// totally flat window yields 50.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut result = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_value(avg_gain, avg_loss) {
        Some(rsi) => result.push(rsi),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_value(avg_gain, avg_loss) {
            Some(rsi) => result.push(rsi),
            None => break,
        }
    }

    result
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };
    rsi.is_finite().then_some(rsi)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_guards() {
        assert!(calculate_rsi(&[], 14).is_empty());
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 0).is_empty());
        // period+1 closes required: 14 closes give only 13 deltas.
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(calculate_rsi(&closes, 14).is_empty());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for v in calculate_rsi(&closes, 14) {
            assert!((v - 100.0).abs() < 1e-10);
        }
    }

    #[test]
    fn rsi_all_losses_is_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for v in calculate_rsi(&closes, 14) {
            assert!(v.abs() < 1e-10);
        }
    }

    #[test]
    fn rsi_flat_market_is_50() {
        let closes = vec![100.0; 30];
        for v in calculate_rsi(&closes, 14) {
            assert!((v - 50.0).abs() < 1e-10);
        }
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let series = calculate_rsi(&closes, 14);
        assert!(!series.is_empty());
        for v in series {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn rsi_nan_truncates() {
        let mut closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        closes.push(f64::NAN);
        closes.push(22.0);
        let series = calculate_rsi(&closes, 14);
        // Values up to the NaN delta survive; the series then stops.
        assert!(!series.is_empty());
        assert!(series.iter().all(|v| v.is_finite()));
    }
}
