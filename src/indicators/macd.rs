// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line    = EMA(closes, fast) - EMA(closes, slow)
// Signal line  = EMA(MACD line, signal_period)
// Histogram    = MACD line - Signal line
//
// Standard periods: fast=12, slow=26, signal=9.
// =============================================================================

use super::ema::calculate_ema;

/// One point of the MACD series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the full MACD series for `closes` using the given periods.
///
/// Returns an empty vec when there is not enough data to seed both the slow
/// EMA and the signal EMA of the MACD line.
pub fn calculate_macd(
    closes: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Vec<MacdPoint> {
    if fast_period == 0 || slow_period == 0 || signal_period == 0 || fast_period >= slow_period {
        return Vec::new();
    }

    let ema_fast = calculate_ema(closes, fast_period);
    let ema_slow = calculate_ema(closes, slow_period);
    if ema_fast.is_empty() || ema_slow.is_empty() {
        return Vec::new();
    }

    // ema_fast is longer (starts earlier) than ema_slow by (slow - fast)
    // elements; align both series to the index at which ema_slow starts.
    let offset = slow_period - fast_period;
    if ema_fast.len() <= offset {
        return Vec::new();
    }
    let aligned_fast = &ema_fast[offset..];
    let len = aligned_fast.len().min(ema_slow.len());

    let macd_line: Vec<f64> = (0..len)
        .map(|i| aligned_fast[i] - ema_slow[i])
        .collect();

    let signal_line = calculate_ema(&macd_line, signal_period);
    if signal_line.is_empty() {
        return Vec::new();
    }

    // signal_line starts at index (signal_period - 1) of macd_line.
    let sig_offset = signal_period - 1;
    if macd_line.len() <= sig_offset {
        return Vec::new();
    }

    (0..signal_line.len())
        .map(|i| {
            let macd = macd_line[sig_offset + i];
            let signal = signal_line[i];
            MacdPoint {
                macd,
                signal,
                histogram: macd - signal,
            }
        })
        .collect()
}

/// Standard 12/26/9 MACD, returning only the most recent point.
pub fn calculate(closes: &[f64]) -> Option<MacdPoint> {
    calculate_macd(closes, 12, 26, 9).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data_is_empty() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_empty());
    }

    #[test]
    fn macd_zero_period_is_empty() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 0, 26, 9).is_empty());
    }

    #[test]
    fn macd_fast_must_be_less_than_slow() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_empty());
    }

    #[test]
    fn macd_ascending_series_is_positive() {
        // A steadily rising series has the fast EMA above the slow EMA,
        // so the MACD line should be positive.
        let closes: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        let series = calculate_macd(&closes, 12, 26, 9);
        assert!(!series.is_empty());
        let last = series.last().unwrap();
        assert!(last.macd > 0.0);
        assert!(last.histogram.is_finite());
    }

    #[test]
    fn macd_convenience_matches_explicit_call() {
        let closes: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        let explicit = calculate_macd(&closes, 12, 26, 9).last().copied();
        let conv = calculate(&closes);
        assert_eq!(explicit, conv);
    }

    #[test]
    fn macd_flat_series_is_near_zero() {
        let closes = vec![100.0; 200];
        let point = calculate(&closes).unwrap();
        assert!(point.macd.abs() < 1e-6);
        assert!(point.histogram.abs() < 1e-6);
    }
}
