//! Pattern rules of the three-bar continuation setup.
//!
//! A setup is one counter-trend candle followed by three candles in the
//! direction of the EMA200 bias, with closes and MACD histogram both moving
//! strictly in that direction.

use mt5bot_core::{Bias, Candle, Side};
use mt5bot_indicators::IndicatorsSnapshot;
use rust_decimal::Decimal;

/// Number of candles the pattern spans.
pub const WINDOW: usize = 4;

/// Trend bias of a close relative to the long EMA.
pub fn compute_bias(close: Decimal, ema200: Option<Decimal>) -> Bias {
    match ema200 {
        Some(ema) if close > ema => Bias::Bullish,
        Some(ema) if close < ema => Bias::Bearish,
        _ => Bias::None,
    }
}

/// `|close - open| <= ratio * (high - low)`. A flat bar is a doji only when
/// its body is zero too.
pub fn is_doji(candle: &Candle, ratio: Decimal) -> bool {
    let range = candle.range();
    let body = candle.body();
    if range.is_zero() {
        return body.is_zero();
    }
    body <= ratio * range
}

/// Whether `values` are strictly increasing (or decreasing). Empty input is
/// never monotonic.
pub fn strictly_monotonic<I>(values: I, increasing: bool) -> bool
where
    I: IntoIterator<Item = Decimal>,
{
    let mut iter = values.into_iter();
    let Some(mut prev) = iter.next() else {
        return false;
    };
    for value in iter {
        let ok = if increasing { value > prev } else { value < prev };
        if !ok {
            return false;
        }
        prev = value;
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    pub side: Side,
    pub bias: Bias,
}

/// Apply the pattern rules to a 4-candle window and its aligned snapshots
/// (both oldest -> newest).
pub fn detect_pattern(
    window: &[Candle],
    snaps: &[IndicatorsSnapshot],
    doji_ratio: Decimal,
) -> Option<PatternMatch> {
    if window.len() != WINDOW || snaps.len() != WINDOW {
        return None;
    }

    let mut histogram = [Decimal::ZERO; WINDOW];
    for (slot, snap) in histogram.iter_mut().zip(snaps) {
        match (snap.ema200, snap.histogram) {
            (Some(_), Some(h)) => *slot = h,
            _ => return None,
        }
    }

    let (c1, c4) = (&window[0], &window[3]);
    let bias = compute_bias(c4.close, snaps[3].ema200);
    if bias == Bias::None {
        return None;
    }

    let doji_count = window[1..].iter().filter(|c| is_doji(c, doji_ratio)).count();
    if doji_count > 1 {
        return None;
    }

    let closes = window.iter().map(|c| c.close);
    let side = match bias {
        Bias::Bullish => {
            let shape = c1.is_bearish() && window[1..].iter().all(Candle::is_bullish);
            if !shape
                || !strictly_monotonic(closes, true)
                || !strictly_monotonic(histogram, true)
            {
                return None;
            }
            Side::Buy
        }
        Bias::Bearish => {
            let shape = c1.is_bullish() && window[1..].iter().all(Candle::is_bearish);
            if !shape
                || !strictly_monotonic(closes, false)
                || !strictly_monotonic(histogram, false)
            {
                return None;
            }
            Side::Sell
        }
        Bias::None => return None,
    };

    Some(PatternMatch { side, bias })
}

/// Stop price at the pattern extreme: lowest low for a BUY, highest high
/// for a SELL.
pub fn pattern_stop(side: Side, window: &[Candle]) -> Option<Decimal> {
    match side {
        Side::Buy => window.iter().map(|c| c.low).min(),
        Side::Sell => window.iter().map(|c| c.high).max(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;

    fn candle(minute: u32, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            symbol: "XAUUSD".into(),
            time: Utc.with_ymd_and_hms(2025, 3, 4, 10, minute, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: dec!(100),
        }
    }

    fn snap(ema: Option<Decimal>, hist: Option<Decimal>) -> IndicatorsSnapshot {
        IndicatorsSnapshot {
            ema200: ema,
            macd: hist,
            signal: hist.map(|_| Decimal::ZERO),
            histogram: hist,
            atr: Some(dec!(1.5)),
            bars_until_ready_ema200: 0,
            bars_until_ready_histogram: 0,
            recent_histogram: VecDeque::new(),
        }
    }

    fn bullish_window() -> Vec<Candle> {
        vec![
            candle(0, dec!(101), dec!(101.5), dec!(99.5), dec!(100)),
            candle(5, dec!(100), dec!(102), dec!(99.8), dec!(101.5)),
            candle(10, dec!(101.5), dec!(103), dec!(101), dec!(102.5)),
            candle(15, dec!(102.5), dec!(104), dec!(102), dec!(103.5)),
        ]
    }

    fn rising_snaps() -> Vec<IndicatorsSnapshot> {
        [dec!(-0.2), dec!(-0.1), dec!(0.1), dec!(0.3)]
            .into_iter()
            .map(|h| snap(Some(dec!(95)), Some(h)))
            .collect()
    }

    #[test]
    fn test_compute_bias() {
        assert_eq!(compute_bias(dec!(10), Some(dec!(9))), Bias::Bullish);
        assert_eq!(compute_bias(dec!(8), Some(dec!(9))), Bias::Bearish);
        assert_eq!(compute_bias(dec!(9), Some(dec!(9))), Bias::None);
        assert_eq!(compute_bias(dec!(9), None), Bias::None);
    }

    #[test]
    fn test_is_doji() {
        assert!(is_doji(&candle(0, dec!(10), dec!(11), dec!(9), dec!(10.1)), dec!(0.1)));
        assert!(!is_doji(&candle(0, dec!(10), dec!(11), dec!(9), dec!(10.5)), dec!(0.1)));
        // Flat bar
        assert!(is_doji(&candle(0, dec!(10), dec!(10), dec!(10), dec!(10)), dec!(0.1)));
    }

    #[test]
    fn test_strictly_monotonic() {
        assert!(strictly_monotonic([dec!(1), dec!(2), dec!(3)], true));
        assert!(!strictly_monotonic([dec!(1), dec!(2), dec!(2)], true));
        assert!(strictly_monotonic([dec!(3), dec!(2), dec!(1)], false));
        assert!(!strictly_monotonic(Vec::<Decimal>::new(), true));
        assert!(strictly_monotonic([dec!(5)], false));
    }

    #[test]
    fn test_bullish_setup_is_buy() {
        let found = detect_pattern(&bullish_window(), &rising_snaps(), dec!(0.1));
        assert_eq!(
            found,
            Some(PatternMatch {
                side: Side::Buy,
                bias: Bias::Bullish
            })
        );
        assert_eq!(pattern_stop(Side::Buy, &bullish_window()), Some(dec!(99.5)));
    }

    #[test]
    fn test_bearish_setup_is_sell() {
        let window = vec![
            candle(0, dec!(100), dec!(101.5), dec!(99.5), dec!(101)),
            candle(5, dec!(101), dec!(101.2), dec!(99), dec!(99.5)),
            candle(10, dec!(99.5), dec!(100), dec!(98), dec!(98.5)),
            candle(15, dec!(98.5), dec!(99), dec!(97), dec!(97.5)),
        ];
        let snaps: Vec<_> = [dec!(0.3), dec!(0.1), dec!(-0.1), dec!(-0.4)]
            .into_iter()
            .map(|h| snap(Some(dec!(105)), Some(h)))
            .collect();

        let found = detect_pattern(&window, &snaps, dec!(0.1)).unwrap();
        assert_eq!(found.side, Side::Sell);
        assert_eq!(pattern_stop(Side::Sell, &window), Some(dec!(101.5)));
    }

    #[test]
    fn test_flat_histogram_rejects() {
        let snaps: Vec<_> = [dec!(-0.2), dec!(0.1), dec!(0.1), dec!(0.3)]
            .into_iter()
            .map(|h| snap(Some(dec!(95)), Some(h)))
            .collect();
        assert_eq!(detect_pattern(&bullish_window(), &snaps, dec!(0.1)), None);
    }

    #[test]
    fn test_missing_indicator_rejects() {
        let mut snaps = rising_snaps();
        snaps[0] = snap(None, Some(dec!(-0.2)));
        assert_eq!(detect_pattern(&bullish_window(), &snaps, dec!(0.1)), None);

        let mut snaps = rising_snaps();
        snaps[2].histogram = None;
        assert_eq!(detect_pattern(&bullish_window(), &snaps, dec!(0.1)), None);
    }

    #[test]
    fn test_two_dojis_reject() {
        let mut window = bullish_window();
        // Tiny bodies, still bullish and still rising closes
        window[1] = candle(5, dec!(100), dec!(102), dec!(99), dec!(100.1));
        window[2] = candle(10, dec!(100.1), dec!(103), dec!(99), dec!(100.2));
        assert_eq!(detect_pattern(&window, &rising_snaps(), dec!(0.1)), None);

        // One doji is allowed
        let mut window = bullish_window();
        window[1] = candle(5, dec!(100), dec!(102), dec!(99), dec!(100.1));
        assert!(detect_pattern(&window, &rising_snaps(), dec!(0.1)).is_some());
    }

    #[test]
    fn test_bias_against_shape_rejects() {
        // Bullish shape below the EMA
        let snaps: Vec<_> = [dec!(-0.2), dec!(-0.1), dec!(0.1), dec!(0.3)]
            .into_iter()
            .map(|h| snap(Some(dec!(110)), Some(h)))
            .collect();
        assert_eq!(detect_pattern(&bullish_window(), &snaps, dec!(0.1)), None);
    }

    #[test]
    fn test_short_window_rejects() {
        let window = bullish_window();
        let snaps = rising_snaps();
        assert_eq!(detect_pattern(&window[1..], &snaps[1..], dec!(0.1)), None);
    }
}
