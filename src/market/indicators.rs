//! Technical indicator math
//!
//! All functions assume klines are ordered oldest → newest. Insufficient
//! data returns `f64::NAN` (scalar variants) or an empty vec (sequence
//! variants); callers decide how to coerce.

use super::Kline;

/// EMA over closes: SMA seed, then the standard 2/(n+1) multiplier
pub fn ema(klines: &[Kline], period: usize) -> f64 {
    if klines.len() < period {
        return f64::NAN;
    }

    let mut value: f64 = klines[..period].iter().map(|k| k.close).sum::<f64>() / period as f64;
    let multiplier = 2.0 / (period as f64 + 1.0);
    for k in &klines[period..] {
        value = (k.close - value) * multiplier + value;
    }
    value
}

/// EMA value at every point from the seed onwards
pub fn ema_sequence(klines: &[Kline], period: usize) -> Vec<f64> {
    let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();
    ema_sequence_from_values(&closes, period)
}

/// EMA sequence over an arbitrary value series (used for DEA over DIF)
pub fn ema_sequence_from_values(values: &[f64], period: usize) -> Vec<f64> {
    if values.len() < period {
        return Vec::new();
    }

    let mut sequence = Vec::with_capacity(values.len() - period + 1);
    let multiplier = 2.0 / (period as f64 + 1.0);

    let mut value: f64 = values[..period].iter().sum::<f64>() / period as f64;
    sequence.push(value);

    for &v in &values[period..] {
        value = (v - value) * multiplier + value;
        sequence.push(value);
    }
    sequence
}

/// MACD histogram: HIST = (DIF − DEA) · 2, DIF = EMA12 − EMA26, DEA = EMA9(DIF)
///
/// With 26..35 klines only the DIF is computable and is returned as a
/// degraded value; below 26 the result is NaN.
pub fn macd(klines: &[Kline]) -> f64 {
    if klines.len() < 35 {
        if klines.len() >= 26 {
            let e12 = ema(klines, 12);
            let e26 = ema(klines, 26);
            if e12.is_nan() || e26.is_nan() {
                return f64::NAN;
            }
            return e12 - e26;
        }
        return f64::NAN;
    }

    let (dif, dea, hist) = macd_sequence(klines);
    match (hist.last(), dea.last(), dif.last()) {
        (Some(&h), _, _) => h,
        (None, _, Some(&d)) => d,
        _ => f64::NAN,
    }
}

/// Full DIF / DEA / HIST series, aligned to their own lengths
pub fn macd_sequence(klines: &[Kline]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    if klines.len() < 26 {
        return (Vec::new(), Vec::new(), Vec::new());
    }

    let ema12_seq = ema_sequence(klines, 12);
    let ema26_seq = ema_sequence(klines, 26);
    if ema12_seq.is_empty() || ema26_seq.is_empty() {
        return (Vec::new(), Vec::new(), Vec::new());
    }

    // DIF starts where EMA26 starts; align the EMA12 series to it
    let offset = ema12_seq.len() - ema26_seq.len();
    let dif: Vec<f64> = ema26_seq
        .iter()
        .enumerate()
        .map(|(i, &e26)| ema12_seq[offset + i] - e26)
        .collect();

    let dea = ema_sequence_from_values(&dif, 9);
    if dea.is_empty() {
        return (dif, Vec::new(), Vec::new());
    }

    let dif_offset = dif.len() - dea.len();
    let hist: Vec<f64> = dea
        .iter()
        .enumerate()
        .map(|(i, &d)| (dif[dif_offset + i] - d) * 2.0)
        .collect();

    (dif, dea, hist)
}

/// RSI with Wilder smoothing
pub fn rsi(klines: &[Kline], period: usize) -> f64 {
    let seq = rsi_sequence(klines, period);
    seq.last().copied().unwrap_or(f64::NAN)
}

/// RSI value at every point after the initial averaging window
pub fn rsi_sequence(klines: &[Kline], period: usize) -> Vec<f64> {
    if klines.len() <= period {
        return Vec::new();
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let change = klines[i].close - klines[i - 1].close;
        if change > 0.0 {
            gains += change;
        } else {
            losses += -change;
        }
    }

    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;
    let p = period as f64;

    let rsi_of = |avg_gain: f64, avg_loss: f64| -> f64 {
        if avg_loss == 0.0 {
            100.0
        } else {
            let rs = avg_gain / avg_loss;
            100.0 - 100.0 / (1.0 + rs)
        }
    };

    let mut sequence = Vec::with_capacity(klines.len() - period);
    sequence.push(rsi_of(avg_gain, avg_loss));

    for i in period + 1..klines.len() {
        let change = klines[i].close - klines[i - 1].close;
        if change > 0.0 {
            avg_gain = (avg_gain * (p - 1.0) + change) / p;
            avg_loss = (avg_loss * (p - 1.0)) / p;
        } else {
            avg_gain = (avg_gain * (p - 1.0)) / p;
            avg_loss = (avg_loss * (p - 1.0) + (-change)) / p;
        }
        sequence.push(rsi_of(avg_gain, avg_loss));
    }

    sequence
}

/// ATR with Wilder smoothing
pub fn atr(klines: &[Kline], period: usize) -> f64 {
    if klines.len() <= period {
        return f64::NAN;
    }

    let mut trs = vec![0.0; klines.len()];
    for i in 1..klines.len() {
        let high = klines[i].high;
        let low = klines[i].low;
        let prev_close = klines[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        trs[i] = tr;
    }

    let mut atr: f64 = trs[1..=period].iter().sum::<f64>() / period as f64;
    for tr in &trs[period + 1..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }
    atr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn klines_from_closes(closes: &[f64]) -> Vec<Kline> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Kline {
                open_time: i as i64 * 60_000,
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 100.0,
                close_time: i as i64 * 60_000 + 59_999,
            })
            .collect()
    }

    #[test]
    fn test_ema_insufficient_data_is_nan() {
        let klines = klines_from_closes(&[1.0, 2.0, 3.0]);
        assert!(ema(&klines, 20).is_nan());
    }

    #[test]
    fn test_ema_constant_series() {
        let klines = klines_from_closes(&[5.0; 50]);
        assert!((ema(&klines, 20) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_seed_is_sma() {
        let closes: Vec<f64> = (1..=5).map(|i| i as f64).collect();
        let klines = klines_from_closes(&closes);
        let seq = ema_sequence(&klines, 5);
        assert_eq!(seq.len(), 1);
        assert!((seq[0] - 3.0).abs() < 1e-9); // (1+2+3+4+5)/5
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let klines = klines_from_closes(&closes);
        assert!((rsi(&klines, 7) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_flat_series() {
        // No losses at all: RSI convention yields 100
        let klines = klines_from_closes(&[10.0; 30]);
        assert_eq!(rsi(&klines, 14), 100.0);
    }

    #[test]
    fn test_macd_needs_26_klines() {
        let klines = klines_from_closes(&[1.0; 20]);
        assert!(macd(&klines).is_nan());
    }

    #[test]
    fn test_macd_constant_series_is_zero() {
        let klines = klines_from_closes(&[100.0; 60]);
        assert!(macd(&klines).abs() < 1e-9);
    }

    #[test]
    fn test_macd_sequence_alignment() {
        let closes: Vec<f64> = (0..100).map(|i| 100.0 + (i as f64 * 0.3).sin()).collect();
        let klines = klines_from_closes(&closes);
        let (dif, dea, hist) = macd_sequence(&klines);
        assert!(!dif.is_empty());
        assert_eq!(dea.len(), hist.len());
        assert!(dif.len() >= dea.len());

        // HIST is (DIF − DEA)·2 at aligned indices
        let dif_offset = dif.len() - dea.len();
        let last = hist.len() - 1;
        let expected = (dif[dif_offset + last] - dea[last]) * 2.0;
        assert!((hist[last] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_atr_constant_range() {
        // high−low = 2 everywhere, no gaps: ATR converges to 2
        let klines = klines_from_closes(&[50.0; 40]);
        assert!((atr(&klines, 14) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_atr_insufficient_data_is_nan() {
        let klines = klines_from_closes(&[50.0; 10]);
        assert!(atr(&klines, 14).is_nan());
    }
}
