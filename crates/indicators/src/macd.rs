use crate::ema::Ema;
use crate::Indicator;
use rust_decimal::Decimal;

/// MACD (Moving Average Convergence Divergence).
///
/// - MACD line = fast EMA - slow EMA, available once both are seeded.
/// - Signal line = EMA of the MACD line, fed only with MACD values.
/// - Histogram = MACD - signal, available once the signal is seeded.
#[derive(Debug, Clone)]
pub struct Macd {
    fast_ema: Ema,
    slow_ema: Ema,
    signal_ema: Ema,
    last: MacdOutput,
}

/// MACD components after the latest update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MacdOutput {
    pub macd: Option<Decimal>,
    pub signal: Option<Decimal>,
    pub histogram: Option<Decimal>,
}

impl Macd {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> Self {
        assert!(fast_period < slow_period, "Fast period must be less than slow period");
        Self {
            fast_ema: Ema::new(fast_period),
            slow_ema: Ema::new(slow_period),
            signal_ema: Ema::new(signal_period),
            last: MacdOutput::default(),
        }
    }

    /// Standard MACD (12, 26, 9).
    pub fn default_periods() -> Self {
        Self::new(12, 26, 9)
    }

    pub fn output(&self) -> MacdOutput {
        self.last
    }

    /// Bars needed from an empty state until the histogram is available.
    pub fn warmup_bars(&self) -> usize {
        self.slow_ema.period() + self.signal_ema.period() - 1
    }

    /// Process the next close and return all components.
    pub fn next_output(&mut self, value: Decimal) -> MacdOutput {
        let fast = self.fast_ema.next(value);
        let slow = self.slow_ema.next(value);

        let macd = match (fast, slow) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        };

        let signal = match macd {
            Some(m) => self.signal_ema.next(m),
            None => self.signal_ema.value(),
        };

        let histogram = match (macd, signal) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        };

        self.last = MacdOutput {
            macd,
            signal,
            histogram,
        };
        self.last
    }
}

impl Indicator for Macd {
    fn next(&mut self, value: Decimal) -> Option<Decimal> {
        self.next_output(value).macd
    }

    fn reset(&mut self) {
        self.fast_ema.reset();
        self.slow_ema.reset();
        self.signal_ema.reset();
        self.last = MacdOutput::default();
    }

    fn period(&self) -> usize {
        self.slow_ema.period()
    }

    fn is_ready(&self) -> bool {
        self.last.histogram.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_macd_line_before_histogram() {
        let mut macd = Macd::new(2, 3, 2);
        assert_eq!(macd.next_output(dec!(1)), MacdOutput::default());
        assert_eq!(macd.next_output(dec!(2)).macd, None);

        // Fast EMA seeds on the 2nd value, slow on the 3rd.
        let third = macd.next_output(dec!(3));
        assert!(third.macd.is_some());
        assert_eq!(third.signal, None);
        assert_eq!(third.histogram, None);

        let fourth = macd.next_output(dec!(4));
        assert!(fourth.signal.is_some());
        assert!(fourth.histogram.is_some());
        assert!(macd.is_ready());
    }

    #[test]
    fn test_warmup_bars_matches_first_histogram() {
        let mut macd = Macd::default_periods();
        let needed = macd.warmup_bars();
        assert_eq!(needed, 34);

        for i in 1..needed {
            let out = macd.next_output(Decimal::from(100 + i));
            assert!(out.histogram.is_none(), "histogram ready too early at bar {}", i);
        }
        assert!(macd.next_output(dec!(200)).histogram.is_some());
    }

    #[test]
    fn test_flat_series_has_zero_histogram() {
        let mut macd = Macd::new(3, 7, 3);
        let mut last = MacdOutput::default();
        for _ in 0..10 {
            last = macd.next_output(dec!(50));
        }
        assert_eq!(last.macd, Some(Decimal::ZERO));
        assert_eq!(last.histogram, Some(Decimal::ZERO));
    }
}
