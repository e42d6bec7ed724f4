use mt5bot_core::{OrderPlan, Side, Signal, SymbolMeta};
use rust_decimal::Decimal;
use tracing::debug;

/// Turns a signal into an [`OrderPlan`] with a planned stop.
#[derive(Debug, Clone, Copy)]
pub struct OrderPlanner {
    rr: Decimal,
    /// Minimum stop distance as a multiple of ATR. Zero disables widening.
    atr_sl_multiplier: Decimal,
}

impl OrderPlanner {
    pub fn new(rr: Decimal, atr_sl_multiplier: Decimal) -> Self {
        Self {
            rr,
            atr_sl_multiplier: atr_sl_multiplier.max(Decimal::ZERO),
        }
    }

    pub fn rr(&self) -> Decimal {
        self.rr
    }

    /// Baseline stop is the signal's pattern extreme rounded to the symbol's
    /// digits, optionally pushed further away by ATR.
    ///
    /// `None` when the signal carries no stop. The take profit is a
    /// placeholder equal to the stop; execution derives the real one from the
    /// live entry.
    pub fn plan(&self, signal: &Signal, meta: &SymbolMeta) -> Option<OrderPlan> {
        let baseline = meta.round_price(signal.stop_loss?);
        let sl = match signal.entry {
            Some(reference) => self.widen_with_atr(signal.side, baseline, reference, signal.atr, meta),
            None => baseline,
        };
        debug!(symbol = %signal.symbol, side = %signal.side, %baseline, %sl, "Planned stop");

        Some(OrderPlan {
            symbol: signal.symbol.clone(),
            side: signal.side,
            rr: self.rr,
            planned_sl: sl,
            planned_tp: sl,
            signal_time: signal.candle_time,
            source_signal_id: Some(signal.id),
        })
    }

    /// Widen only: the result is never closer to `reference` than `sl`.
    fn widen_with_atr(
        &self,
        side: Side,
        sl: Decimal,
        reference: Decimal,
        atr: Option<Decimal>,
        meta: &SymbolMeta,
    ) -> Decimal {
        let Some(atr) = atr else {
            return sl;
        };
        if self.atr_sl_multiplier.is_zero() {
            return sl;
        }

        let atr_distance = atr * self.atr_sl_multiplier;
        let base_distance = (reference - sl).abs();
        if base_distance >= atr_distance {
            return sl;
        }

        let widened = meta.round_price(match side {
            Side::Buy => reference - atr_distance,
            Side::Sell => reference + atr_distance,
        });
        if (reference - widened).abs() < base_distance {
            return sl;
        }
        widened
    }
}
