use crate::atr::Atr;
use crate::ema::Ema;
use crate::macd::Macd;
use crate::Indicator;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Periods used by [`IndicatorSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorSetConfig {
    pub ema_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub atr_period: usize,
    /// Length of the rolling histogram window kept in every snapshot.
    pub histogram_window: usize,
}

impl Default for IndicatorSetConfig {
    fn default() -> Self {
        Self {
            ema_period: 200,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            atr_period: 14,
            histogram_window: 4,
        }
    }
}

/// Indicator values for one closed candle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorsSnapshot {
    pub ema200: Option<Decimal>,
    pub macd: Option<Decimal>,
    pub signal: Option<Decimal>,
    pub histogram: Option<Decimal>,
    pub atr: Option<Decimal>,
    pub bars_until_ready_ema200: usize,
    pub bars_until_ready_histogram: usize,
    /// Last N histogram values, oldest -> newest.
    pub recent_histogram: VecDeque<Option<Decimal>>,
}

impl IndicatorsSnapshot {
    /// Both trend filter and momentum are available.
    pub fn is_ready(&self) -> bool {
        self.ema200.is_some() && self.histogram.is_some()
    }
}

/// EMA(200), MACD(12,26,9) and ATR(14) maintained over closed bars.
///
/// Candles must be fed in chronological order.
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    config: IndicatorSetConfig,
    ema: Ema,
    macd: Macd,
    atr: Atr,
    closes_seen: usize,
    recent_histogram: VecDeque<Option<Decimal>>,
}

impl IndicatorSet {
    pub fn new(config: IndicatorSetConfig) -> Self {
        let window = config.histogram_window.max(1);
        Self {
            ema: Ema::new(config.ema_period),
            macd: Macd::new(config.macd_fast, config.macd_slow, config.macd_signal),
            atr: Atr::new(config.atr_period),
            closes_seen: 0,
            recent_histogram: VecDeque::with_capacity(window),
            config,
        }
    }

    pub fn config(&self) -> &IndicatorSetConfig {
        &self.config
    }

    pub fn closes_seen(&self) -> usize {
        self.closes_seen
    }

    /// Consume one closed bar and return the snapshot after it.
    pub fn update(&mut self, high: Decimal, low: Decimal, close: Decimal) -> IndicatorsSnapshot {
        self.closes_seen += 1;

        let ema200 = self.ema.next(close);
        let macd = self.macd.next_output(close);
        let atr = self.atr.next_hlc(high, low, close);

        if self.recent_histogram.len() == self.config.histogram_window.max(1) {
            self.recent_histogram.pop_front();
        }
        self.recent_histogram.push_back(macd.histogram);

        IndicatorsSnapshot {
            ema200,
            macd: macd.macd,
            signal: macd.signal,
            histogram: macd.histogram,
            atr,
            bars_until_ready_ema200: self.config.ema_period.saturating_sub(self.closes_seen),
            bars_until_ready_histogram: self.macd.warmup_bars().saturating_sub(self.closes_seen),
            recent_histogram: self.recent_histogram.clone(),
        }
    }

    /// Feed historical bars (oldest -> newest) and return the last snapshot.
    pub fn warmup<I>(&mut self, bars: I) -> Option<IndicatorsSnapshot>
    where
        I: IntoIterator<Item = (Decimal, Decimal, Decimal)>,
    {
        bars.into_iter()
            .map(|(high, low, close)| self.update(high, low, close))
            .last()
    }

    pub fn reset(&mut self) {
        self.ema.reset();
        self.macd.reset();
        self.atr.reset();
        self.closes_seen = 0;
        self.recent_histogram.clear();
    }
}

impl Default for IndicatorSet {
    fn default() -> Self {
        Self::new(IndicatorSetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn small_config() -> IndicatorSetConfig {
        IndicatorSetConfig {
            ema_period: 5,
            macd_fast: 2,
            macd_slow: 3,
            macd_signal: 2,
            atr_period: 2,
            histogram_window: 3,
        }
    }

    #[test]
    fn test_readiness_counters_count_down_to_zero() {
        let mut set = IndicatorSet::new(small_config());
        let first = set.update(dec!(11), dec!(9), dec!(10));
        assert_eq!(first.bars_until_ready_ema200, 4);
        assert_eq!(first.bars_until_ready_histogram, 3);
        assert!(!first.is_ready());

        let mut last = first;
        for i in 0..6 {
            let close = dec!(10) + Decimal::from(i);
            last = set.update(close + dec!(1), close - dec!(1), close);
        }
        assert_eq!(last.bars_until_ready_ema200, 0);
        assert_eq!(last.bars_until_ready_histogram, 0);
        assert!(last.is_ready());
        assert!(last.atr.is_some());
    }

    #[test]
    fn test_histogram_window_is_bounded_and_ordered() {
        let mut set = IndicatorSet::new(small_config());
        let mut snaps = Vec::new();
        for i in 0..6 {
            let close = dec!(100) + Decimal::from(i * i);
            snaps.push(set.update(close, close, close));
        }

        let last = snaps.last().unwrap();
        assert_eq!(last.recent_histogram.len(), 3);
        let expected: Vec<_> = snaps[3..].iter().map(|s| s.histogram).collect();
        assert_eq!(last.recent_histogram.iter().copied().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_default_ema200_needs_200_bars() {
        let mut set = IndicatorSet::default();
        let snap = set
            .warmup((0..199).map(|_| (dec!(1.1), dec!(1.0), dec!(1.05))))
            .unwrap();
        assert_eq!(snap.ema200, None);
        assert_eq!(snap.bars_until_ready_ema200, 1);
        assert!(snap.histogram.is_some());

        let snap = set.update(dec!(1.1), dec!(1.0), dec!(1.05));
        assert_eq!(snap.ema200, Some(dec!(1.05)));
        assert_eq!(snap.bars_until_ready_ema200, 0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut set = IndicatorSet::new(small_config());
        set.warmup((0..10).map(|i| {
            let c = Decimal::from(i);
            (c, c, c)
        }));
        set.reset();
        assert_eq!(set.closes_seen(), 0);
        let snap = set.update(dec!(1), dec!(1), dec!(1));
        assert_eq!(snap.ema200, None);
        assert_eq!(snap.recent_histogram.len(), 1);
    }
}
