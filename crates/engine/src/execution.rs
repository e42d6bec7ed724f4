use mt5bot_core::{
    BrokerError, Execution, MarketData, OrderPlan, OrderRequest, OrderResult, Side, SymbolMeta,
};
use mt5bot_risk::PositionSizer;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// What to do when the planned stop sits closer to the entry than the
/// broker's stops level allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NudgePolicy {
    /// Skip the trade.
    Off,
    /// Move the stop out to the minimum distance if that needs at most
    /// `nudge_factor` times the planned distance.
    #[default]
    Conservative,
    /// Always move the stop out to the minimum distance.
    Flexible,
}

impl FromStr for NudgePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(NudgePolicy::Off),
            "conservative" => Ok(NudgePolicy::Conservative),
            "flexible" => Ok(NudgePolicy::Flexible),
            other => Err(format!(
                "unknown nudge policy '{}', expected off, conservative or flexible",
                other
            )),
        }
    }
}

impl fmt::Display for NudgePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NudgePolicy::Off => write!(f, "off"),
            NudgePolicy::Conservative => write!(f, "conservative"),
            NudgePolicy::Flexible => write!(f, "flexible"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub nudge_policy: NudgePolicy,
    pub nudge_factor: Decimal,
    /// Allowed slippage in points.
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            nudge_policy: NudgePolicy::Conservative,
            nudge_factor: Decimal::new(15, 1),
            deviation: 20,
            magic: 0,
            comment: "mt5bot".to_string(),
        }
    }
}

/// Result of executing one plan.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Filled(OrderResult),
    /// The broker answered with a non-fill retcode.
    Rejected(OrderResult),
    /// Never sent; the reason says which check stopped it.
    Skipped(String),
}

/// Turns an [`OrderPlan`] into a sized market order against the live quote.
#[derive(Debug, Clone)]
pub struct ExecutionService {
    config: ExecutionConfig,
    sizer: PositionSizer,
}

impl ExecutionService {
    pub fn new(config: ExecutionConfig, sizer: PositionSizer) -> Self {
        Self { config, sizer }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Connection-level failures propagate as `Err`; everything that merely
    /// prevents this one trade comes back as [`ExecutionOutcome::Skipped`].
    pub async fn execute<B>(
        &self,
        broker: &mut B,
        plan: &OrderPlan,
    ) -> Result<ExecutionOutcome, BrokerError>
    where
        B: MarketData + Execution + ?Sized,
    {
        let symbol = plan.symbol.as_str();
        let meta = match broker.symbol_meta(symbol).await {
            Ok(meta) => meta,
            Err(e) if !e.is_connection_error() => {
                warn!(%symbol, error = %e, "Symbol meta not available; skipping order");
                return Ok(skip(format!("symbol meta unavailable: {}", e)));
            }
            Err(e) => return Err(e),
        };
        debug!(
            %symbol,
            side = %plan.side,
            rr = %plan.rr,
            planned_sl = %plan.planned_sl,
            "Received order plan"
        );

        let balance = match broker.account().await {
            Ok(account) => account.balance,
            Err(e) if !e.is_connection_error() => {
                warn!(%symbol, error = %e, "Account info not available; skipping order");
                return Ok(skip(format!("account info unavailable: {}", e)));
            }
            Err(e) => return Err(e),
        };
        let quote = match broker.quote(symbol).await {
            Ok(quote) => quote,
            Err(e) if !e.is_connection_error() => {
                warn!(%symbol, error = %e, "No live quote; skipping order");
                return Ok(skip(format!("no live quote: {}", e)));
            }
            Err(e) => return Err(e),
        };
        let entry = quote.entry_price(plan.side);

        if !stop_on_loss_side(plan.side, entry, plan.planned_sl) {
            info!(%symbol, %entry, sl = %plan.planned_sl, "Planned SL is on the wrong side of entry; skipping");
            return Ok(skip("stop loss on the wrong side of entry"));
        }

        let Some(sl) = apply_sl_nudge(
            self.config.nudge_policy,
            self.config.nudge_factor,
            plan.planned_sl,
            entry,
            plan.side,
            &meta,
        ) else {
            info!(%symbol, policy = %self.config.nudge_policy, "SL nudge policy rejected the trade");
            return Ok(skip("stop loss inside broker stops level"));
        };

        let tp = meta.round_price(take_profit(plan.side, entry, sl, plan.rr));
        let sl = meta.round_price(sl);

        let size = self.sizer.compute_lot(balance, entry, sl, &meta);
        if size.lot <= Decimal::ZERO {
            info!(%symbol, "Lot computed as 0; risk or distances invalid; skipping");
            return Ok(skip("computed lot is zero"));
        }

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side: plan.side,
            volume: size.lot,
            stop_loss: sl,
            take_profit: tp,
            deviation: self.config.deviation,
            magic: self.config.magic,
            comment: self.config.comment.clone(),
        };
        let result = match broker.send_market_order(&request).await {
            Ok(result) => result,
            Err(e) if !e.is_connection_error() => {
                warn!(%symbol, error = %e, "order_send failed; skipping order");
                return Ok(skip(format!("order send failed: {}", e)));
            }
            Err(e) => return Err(e),
        };

        if !result.is_filled() {
            info!(
                "Order rejected for {}: {}",
                symbol,
                result.reason.as_deref().unwrap_or("UNKNOWN")
            );
            return Ok(ExecutionOutcome::Rejected(result));
        }

        info!(
            risk_used = %size.risk_used,
            "{} order filled for {} (lot={}, entry={}, SL={}, TP={}, ticket={})",
            plan.side,
            symbol,
            result.lot,
            meta.round_price(result.entry_price),
            result.stop_loss,
            result.take_profit,
            result.ticket
        );
        Ok(ExecutionOutcome::Filled(result))
    }
}

fn skip(reason: impl Into<String>) -> ExecutionOutcome {
    ExecutionOutcome::Skipped(reason.into())
}

fn stop_on_loss_side(side: Side, entry: Decimal, sl: Decimal) -> bool {
    match side {
        Side::Buy => sl < entry,
        Side::Sell => sl > entry,
    }
}

/// Check the planned stop against `stops_level x tick_size` and move it out
/// if the policy allows. `None` means the trade must be skipped.
pub fn apply_sl_nudge(
    policy: NudgePolicy,
    factor: Decimal,
    planned_sl: Decimal,
    entry: Decimal,
    side: Side,
    meta: &SymbolMeta,
) -> Option<Decimal> {
    let min_distance = meta.min_stop_distance();
    let distance = (entry - planned_sl).abs();
    if distance >= min_distance {
        return Some(planned_sl);
    }

    match policy {
        NudgePolicy::Off => return None,
        NudgePolicy::Conservative => {
            if distance.is_zero() {
                return None;
            }
            let required = min_distance / distance;
            if required > factor.max(Decimal::ONE) {
                return None;
            }
        }
        NudgePolicy::Flexible => {}
    }

    Some(match side {
        Side::Buy => entry - min_distance,
        Side::Sell => entry + min_distance,
    })
}

/// Take profit at `rr` times the stop distance from `entry`.
pub fn take_profit(side: Side, entry: Decimal, sl: Decimal, rr: Decimal) -> Decimal {
    let risk = (entry - sl).abs();
    match side {
        Side::Buy => entry + rr * risk,
        Side::Sell => entry - rr * risk,
    }
}
