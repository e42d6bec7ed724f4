use mt5bot_core::{Side, SymbolMeta};
use rust_decimal::prelude::*;
use tracing::debug;

/// Lot size for one trade and the cash amount it puts at risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LotSize {
    pub lot: Decimal,
    pub risk_used: Decimal,
}

impl LotSize {
    pub const ZERO: LotSize = LotSize {
        lot: Decimal::ZERO,
        risk_used: Decimal::ZERO,
    };
}

/// Slack for Decimal division rounding when comparing against the target.
const RISK_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 9);

/// Sizes positions from account balance and a fixed risk fraction, using
/// the symbol's tick value per tick size.
#[derive(Debug, Clone, Copy)]
pub struct PositionSizer {
    /// Fraction of balance risked per trade, e.g. 0.01 for 1%.
    risk_percentage: Decimal,
}

impl PositionSizer {
    pub fn new(risk_percentage: Decimal) -> Self {
        Self { risk_percentage }
    }

    pub fn risk_percentage(&self) -> Decimal {
        self.risk_percentage
    }

    /// Lot such that losing `|entry - stop_loss|` costs at most
    /// `balance * risk_percentage`, floored to the broker's lot step.
    ///
    /// `tick_value` is the cash value of one `tick_size` move for 1.0 lot.
    /// The broker minimum lot always wins, so `risk_used` can exceed the
    /// target when even the minimum lot is too large.
    pub fn compute_lot(
        &self,
        balance: Decimal,
        entry: Decimal,
        stop_loss: Decimal,
        meta: &SymbolMeta,
    ) -> LotSize {
        debug!(
            %balance,
            entry = %entry.round_dp(meta.digits),
            stop_loss = %stop_loss.round_dp(meta.digits),
            "Computing lot"
        );

        let risk_target = (balance * self.risk_percentage).max(Decimal::ZERO);
        if risk_target.is_zero() {
            return LotSize::ZERO;
        }

        let ticks = if meta.tick_size > Decimal::ZERO {
            (entry - stop_loss).abs() / meta.tick_size
        } else {
            Decimal::ZERO
        };
        let risk_per_lot = ticks * meta.tick_value;
        if risk_per_lot <= Decimal::ZERO {
            return LotSize::ZERO;
        }

        let raw_lot = risk_target / risk_per_lot;
        let mut lot = floor_to_step(raw_lot, meta.lot_step).max(meta.min_lot);
        let mut risk_used = lot * risk_per_lot;

        // Without a lot step the raw lot is already the target; stepping down
        // would never make progress.
        let stepped = meta.lot_step > Decimal::ZERO;
        while stepped && lot > meta.min_lot && risk_used > risk_target + RISK_TOLERANCE {
            lot -= meta.lot_step;
            if lot < meta.min_lot {
                lot = meta.min_lot;
                risk_used = lot * risk_per_lot;
                break;
            }
            risk_used = lot * risk_per_lot;
        }

        if meta.max_lot > Decimal::ZERO && lot > meta.max_lot {
            lot = floor_to_step(meta.max_lot, meta.lot_step);
            risk_used = lot * risk_per_lot;
        }

        if stepped {
            lot = lot.round_dp(decimals_from_step(meta.lot_step));
        }
        debug!(%lot, %risk_used, "Computed lot");
        LotSize { lot, risk_used }
    }
}

/// Price at which closing `lot` recovers the commission paid.
///
/// `commission_per_lot` is charged per side; `round_trip` doubles it.
#[allow(clippy::too_many_arguments)]
pub fn break_even_price(
    side: Side,
    entry: Decimal,
    lot: Decimal,
    digits: u32,
    tick_value: Decimal,
    tick_size: Decimal,
    commission_per_lot: Option<Decimal>,
    round_trip: bool,
) -> Decimal {
    let mut commission = commission_per_lot.unwrap_or_default() * lot;
    if round_trip {
        commission *= Decimal::TWO;
    }

    if tick_size <= Decimal::ZERO {
        return entry;
    }
    let pnl_per_unit = lot * (tick_value / tick_size);
    if pnl_per_unit <= Decimal::ZERO {
        return entry;
    }

    let offset = commission / pnl_per_unit;
    debug!(%commission, offset = %offset.round_dp(digits), "Break-even offset");

    match side {
        Side::Buy => entry + offset,
        Side::Sell => entry - offset,
    }
}

fn floor_to_step(lot: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return lot;
    }
    (lot / step).floor() * step
}

/// Decimal places implied by a lot step: 1 -> 0, 0.1 -> 1, 0.01 -> 2.
pub fn decimals_from_step(step: Decimal) -> u32 {
    step.normalize().scale()
}
