// =============================================================================
// Simple moving average and envelope bands
// =============================================================================
//
// Candle sequences arrive most-recent-first from the adapter, so the SMA of
// the "first k" elements is the current k-day average.
// =============================================================================

use crate::market_data::Candle;

/// Mean of the first `period` values (most-recent-first ordering).
///
/// Returns `None` when fewer than `period` values are available — a short
/// history must never silently produce a shifted average.
pub fn sma(prices: &[i64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let sum: i64 = prices[..period].iter().sum();
    Some(sum as f64 / period as f64)
}

/// SMA of closing prices taken from a most-recent-first candle slice.
pub fn ma_from_candles(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period {
        return None;
    }
    let closes: Vec<i64> = candles[..period].iter().map(|c| c.close).collect();
    sma(&closes, period)
}

/// Envelope band pair around a moving average: `MA · (1 ± pct/100)`.
pub fn envelope(ma: f64, pct: i64) -> (f64, f64) {
    let offset = ma * pct as f64 / 100.0;
    (ma + offset, ma - offset)
}

/// Moving average plus its envelope band at a given percentage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeLevels {
    pub ma: f64,
    pub upper: f64,
    pub lower: f64,
}

impl EnvelopeLevels {
    /// Compute the levels from candles; `None` when history is too short.
    pub fn from_candles(candles: &[Candle], period: usize, pct: i64) -> Option<Self> {
        let ma = ma_from_candles(candles, period)?;
        let (upper, lower) = envelope(ma, pct);
        Some(Self { ma, upper, lower })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candles_with_closes(closes: &[i64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                date: format!("202501{:02}", 28 - i),
                open: close,
                high: close + 50,
                low: close - 50,
                close,
                volume: 1_000,
            })
            .collect()
    }

    #[test]
    fn sma_uses_most_recent_first_prefix() {
        let prices = [100, 200, 300, 400];
        assert_eq!(sma(&prices, 2), Some(150.0));
        assert_eq!(sma(&prices, 4), Some(250.0));
    }

    #[test]
    fn sma_short_history_is_none() {
        assert_eq!(sma(&[100, 200], 3), None);
        assert_eq!(sma(&[], 1), None);
        assert_eq!(sma(&[100], 0), None);
    }

    #[test]
    fn envelope_bands() {
        let (upper, lower) = envelope(10_000.0, 20);
        assert!((upper - 12_000.0).abs() < f64::EPSILON);
        assert!((lower - 8_000.0).abs() < f64::EPSILON);

        let (upper, lower) = envelope(10_000.0, 19);
        assert!((upper - 11_900.0).abs() < f64::EPSILON);
        assert!((lower - 8_100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn levels_from_candles() {
        let candles = candles_with_closes(&[10_000; 25]);
        let levels = EnvelopeLevels::from_candles(&candles, 20, 20).unwrap();
        assert!((levels.ma - 10_000.0).abs() < f64::EPSILON);
        assert!((levels.lower - 8_000.0).abs() < f64::EPSILON);

        let short = candles_with_closes(&[10_000; 10]);
        assert!(EnvelopeLevels::from_candles(&short, 20, 20).is_none());
    }
}
