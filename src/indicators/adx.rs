// =============================================================================
// Average Directional Index (ADX) with +DI / -DI
// =============================================================================
//
//   1. +DM / -DM and True Range per bar transition.
//   2. Wilder-smooth +DM, -DM, TR over `period`.
//   3. +DI = smoothed(+DM) / smoothed(TR) * 100,   -DI likewise.
//   4. DX  = |+DI - -DI| / (+DI + -DI) * 100.
//   5. ADX = Wilder-smoothed average of DX over `period`.
//
// ADX > 25 reads as trending, ADX < 20 as ranging.
// =============================================================================

use serde::Serialize;

use crate::types::Bar;

/// Trend-strength reading: the smoothed ADX plus the directional index pair
/// it was derived from.
#[derive(Debug, Clone, Serialize)]
pub struct AdxResult {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Most recent ADX / +DI / -DI for `bars` (oldest first).
///
/// Needs at least `2 * period + 1` bars: `period` transitions to seed the
/// DM/TR smoothing, another `period` DX values to seed the ADX average, and
/// the very first bar that has no predecessor. `None` on insufficient input
/// or non-finite intermediates.
pub fn calculate_adx(bars: &[Bar], period: usize) -> Option<AdxResult> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let transitions = bars.len() - 1;

    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr_vals = Vec::with_capacity(transitions);

    for pair in bars.windows(2) {
        let prev = &pair[0];
        let bar = &pair[1];

        let tr = (bar.high - bar.low)
            .max((bar.high - prev.close).abs())
            .max((bar.low - prev.close).abs());

        let up_move = bar.high - prev.high;
        let down_move = prev.low - bar.low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    // Wilder running sums seeded over the first `period` transitions.
    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(transitions - period + 1);
    let (dx, mut plus_di, mut minus_di) = directional_values(smooth_plus, smooth_minus, smooth_tr)?;
    dx_values.push(dx);

    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];

        let (dx, pdi, mdi) = directional_values(smooth_plus, smooth_minus, smooth_tr)?;
        dx_values.push(dx);
        plus_di = pdi;
        minus_di = mdi;
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }

    if !adx.is_finite() {
        return None;
    }

    Some(AdxResult {
        adx,
        plus_di,
        minus_di,
    })
}

/// `(DX, +DI, -DI)` from smoothed inputs. `None` when TR is zero or a
/// result is non-finite; a zero DI sum yields DX = 0 (no directional
/// movement).
fn directional_values(
    smooth_plus: f64,
    smooth_minus: f64,
    smooth_tr: f64,
) -> Option<(f64, f64, f64)> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = smooth_plus / smooth_tr * 100.0;
    let minus_di = smooth_minus / smooth_tr * 100.0;

    let di_sum = plus_di + minus_di;
    let dx = if di_sum == 0.0 {
        0.0
    } else {
        (plus_di - minus_di).abs() / di_sum * 100.0
    };

    (dx.is_finite() && plus_di.is_finite() && minus_di.is_finite())
        .then_some((dx, plus_di, minus_di))
}
