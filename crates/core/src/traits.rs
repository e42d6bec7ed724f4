use crate::models::*;
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Strategy Trait
// ---------------------------------------------------------------------------

/// A trading strategy that consumes closed candles and produces signals.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Unique identifier for this strategy.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Called once before the first candle.
    async fn on_start(&mut self) {}

    /// Seed internal state from historical closed candles (oldest -> newest)
    /// without emitting signals.
    fn warmup(&mut self, candles: &[Candle]);

    /// Called on every closed candle. `is_live` is false for backfilled bars.
    async fn on_candle(&mut self, candle: &Candle, is_live: bool) -> Vec<Signal>;

    /// Called after an order derived from one of this strategy's signals
    /// reached the broker.
    async fn on_order(&mut self, _result: &OrderResult) {}

    /// Called once on shutdown.
    async fn on_stop(&mut self) {}

    /// Reset internal state.
    fn reset(&mut self);
}

// ---------------------------------------------------------------------------
// Broker Traits
// ---------------------------------------------------------------------------

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// A platform call failed; `code`/`message` carry the platform's last error.
    #[error("{context} ({code}: {message})")]
    Platform {
        context: String,
        code: i32,
        message: String,
    },
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("MT5 is not initialized")]
    NotConnected,
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),
    #[error("Symbol {0} not found on server")]
    SymbolNotFound(String),
    #[error("Cannot select symbol {0}")]
    SymbolSelectFailed(String),
    #[error("Unsupported timeframe: {0}")]
    UnsupportedTimeframe(String),
    #[error("No live quote for {0}")]
    NoQuote(String),
    #[error("Order rejected: {0}")]
    OrderRejected(String),
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether the error means the link to the platform is gone and a
    /// reconnect is worth attempting.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionFailed(_) | BrokerError::NotConnected | BrokerError::Timeout(_)
        )
    }
}

/// Owns the lifecycle of the connection to the trading platform.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Connect and authenticate. Idempotent when already connected.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    /// Disconnect from the platform.
    async fn disconnect(&mut self) -> Result<(), BrokerError>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Verify the platform is reachable and connected to its trade server.
    async fn health_check(&mut self) -> Result<TerminalInfo, BrokerError>;
}

/// Retrieves and normalises live prices and candles.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Make sure the symbol exists and is selected in Market Watch.
    async fn ensure_symbol(&mut self, symbol: &str) -> Result<(), BrokerError>;

    async fn symbol_meta(&mut self, symbol: &str) -> Result<SymbolMeta, BrokerError>;

    /// Latest quote for the symbol.
    async fn quote(&mut self, symbol: &str) -> Result<Tick, BrokerError>;

    /// The most recent fully closed candle, if the server has any.
    async fn last_closed_candle(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<Candle>, BrokerError>;

    /// Up to `count` most recent closed candles, oldest -> newest.
    async fn recent_candles(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError>;

    /// Closed candles with `since_exclusive < epoch <= until_inclusive`,
    /// oldest -> newest.
    async fn candles_between(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        since_exclusive: i64,
        until_inclusive: i64,
    ) -> Result<Vec<Candle>, BrokerError>;
}

/// Translates trade intents into broker orders.
#[async_trait]
pub trait Execution: Send + Sync {
    async fn account(&mut self) -> Result<AccountState, BrokerError>;

    /// Open positions for the symbol.
    async fn positions(&mut self, symbol: &str) -> Result<Vec<Position>, BrokerError>;

    /// Send a market order. A broker-side rejection is an `Ok` result with
    /// `OrderStatus::Rejected`; `Err` means the request never completed.
    async fn send_market_order(&mut self, request: &OrderRequest)
        -> Result<OrderResult, BrokerError>;
}

/// A full broker adapter.
pub trait Broker: ConnectionManager + MarketData + Execution {}

impl<T: ConnectionManager + MarketData + Execution> Broker for T {}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

/// Decision of a pre-trade risk check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskDecision {
    /// Order is approved.
    Approved,
    /// Order is rejected with a reason.
    Rejected(String),
}
