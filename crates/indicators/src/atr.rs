use rust_decimal::Decimal;

/// Average True Range with Wilder smoothing.
///
/// The first value is the mean true range of the first `period` bars; after
/// that `atr = (prev * (period - 1) + tr) / period`.
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
    prev_close: Option<Decimal>,
    tr_sum: Decimal,
    tr_count: usize,
    value: Option<Decimal>,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "ATR period must be > 0");
        Self {
            period,
            prev_close: None,
            tr_sum: Decimal::ZERO,
            tr_count: 0,
            value: None,
        }
    }

    /// True range of a bar given the previous close. The first bar has no
    /// previous close, so its range is used.
    pub fn true_range(high: Decimal, low: Decimal, prev_close: Option<Decimal>) -> Decimal {
        let hl = high - low;
        match prev_close {
            Some(pc) => hl.max((high - pc).abs()).max((low - pc).abs()),
            None => hl,
        }
    }

    /// Feed one closed bar.
    pub fn next_hlc(&mut self, high: Decimal, low: Decimal, close: Decimal) -> Option<Decimal> {
        let tr = Self::true_range(high, low, self.prev_close);
        self.prev_close = Some(close);

        let period = Decimal::from(self.period);
        match self.value {
            None => {
                self.tr_sum += tr;
                self.tr_count += 1;
                if self.tr_count == self.period {
                    self.value = Some(self.tr_sum / period);
                }
            }
            Some(prev) => {
                self.value = Some((prev * (period - Decimal::ONE) + tr) / period);
            }
        }

        self.value
    }

    pub fn value(&self) -> Option<Decimal> {
        self.value
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    pub fn reset(&mut self) {
        self.prev_close = None;
        self.tr_sum = Decimal::ZERO;
        self.tr_count = 0;
        self.value = None;
    }
}
