use crate::Indicator;
use rust_decimal::Decimal;

/// Exponential Moving Average (EMA).
///
/// Seeded with the SMA of the first `period` values; from then on
/// `ema = alpha * x + (1 - alpha) * prev` with `alpha = 2 / (period + 1)`.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    alpha: Decimal,
    value: Option<Decimal>,
    /// Values collected for the SMA seed, empty once seeded.
    seed: Vec<Decimal>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "EMA period must be > 0");
        let alpha = Decimal::TWO / (Decimal::from(period) + Decimal::ONE);
        Self {
            period,
            alpha,
            value: None,
            seed: Vec::with_capacity(period),
        }
    }

    pub fn value(&self) -> Option<Decimal> {
        self.value
    }

    pub fn alpha(&self) -> Decimal {
        self.alpha
    }

    /// Number of further values needed before the first output.
    pub fn seed_remaining(&self) -> usize {
        if self.value.is_some() {
            0
        } else {
            self.period - self.seed.len()
        }
    }
}

impl Indicator for Ema {
    fn next(&mut self, value: Decimal) -> Option<Decimal> {
        match self.value {
            None => {
                self.seed.push(value);
                if self.seed.len() == self.period {
                    let sum: Decimal = self.seed.iter().sum();
                    self.value = Some(sum / Decimal::from(self.period));
                    self.seed.clear();
                }
            }
            Some(prev) => {
                self.value = Some(self.alpha * value + (Decimal::ONE - self.alpha) * prev);
            }
        }

        self.value
    }

    fn reset(&mut self) {
        self.value = None;
        self.seed.clear();
    }

    fn period(&self) -> usize {
        self.period
    }

    fn is_ready(&self) -> bool {
        self.value.is_some()
    }
}
