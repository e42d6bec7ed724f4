//! MetaTrader 5 broker adapter.
//!
//! Communicates with MT5 via a socket bridge process that runs next to the
//! terminal and forwards calls to its Python API.

pub mod client;
pub mod protocol;

pub use client::{MetaTraderBroker, MetaTraderConfig};
