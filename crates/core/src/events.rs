use crate::models::*;
use serde::{Deserialize, Serialize};

/// Top-level event enum that flows through the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    MarketData(MarketDataEvent),
    Signal(Signal),
    Order(OrderEvent),
    System(SystemEvent),
}

/// Market data events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketDataEvent {
    /// A closed candle, `is_live` false when it was backfilled.
    Candle { candle: Candle, is_live: bool },
    Tick(Tick),
}

/// Order lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderEvent {
    Filled(OrderResult),
    Rejected(OrderResult),
    /// A signal that never reached the broker (guard, nudge policy, zero lot).
    Skipped { symbol: String, reason: String },
}

/// System lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemEvent {
    Started { message: String },
    Stopped { message: String },
    Connection(ConnectionState),
    Error { message: String },
    Info { message: String },
}
