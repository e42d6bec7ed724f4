use async_trait::async_trait;
use chrono::Utc;
use mt5bot_core::*;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

/// Return code the simulated trade server reports for a completed deal.
pub const RETCODE_DONE: u32 = 10009;

/// Configuration for the simulated broker.
#[derive(Debug, Clone)]
pub struct SimulatedBrokerConfig {
    /// Starting account balance.
    pub initial_balance: Decimal,
    /// Slippage in ticks applied against the order on every fill.
    pub slippage_ticks: Decimal,
    pub server: String,
    pub login: u64,
}

impl Default for SimulatedBrokerConfig {
    fn default() -> Self {
        Self {
            initial_balance: Decimal::new(10_000, 0),
            slippage_ticks: Decimal::ZERO,
            server: "Simulated-Demo".to_string(),
            login: 1000,
        }
    }
}

/// An in-memory broker with scripted market data.
///
/// Candles and quotes are pushed by the caller. Market orders fill at the
/// current ask (BUY) or bid (SELL) and open a position. Connection failures,
/// trade server loss and order rejections can be injected.
#[derive(Debug)]
pub struct SimulatedBroker {
    config: SimulatedBrokerConfig,
    state: ConnectionState,
    account: AccountState,
    symbols: HashMap<String, SymbolMeta>,
    candles: HashMap<(String, Timeframe), Vec<Candle>>,
    quotes: HashMap<String, Tick>,
    positions: Vec<Position>,
    sent_orders: Vec<OrderRequest>,
    next_ticket: u64,
    connect_attempts: u32,
    failing_connects: u32,
    trade_server_down: bool,
    pending_rejection: Option<(u32, String)>,
    pending_failure: Option<BrokerError>,
}

impl SimulatedBroker {
    pub fn new(config: SimulatedBrokerConfig) -> Self {
        let mut account = AccountState::new(config.initial_balance);
        account.login = config.login;
        account.server = config.server.clone();
        Self {
            config,
            state: ConnectionState::Disconnected,
            account,
            symbols: HashMap::new(),
            candles: HashMap::new(),
            quotes: HashMap::new(),
            positions: Vec::new(),
            sent_orders: Vec::new(),
            next_ticket: 1,
            connect_attempts: 0,
            failing_connects: 0,
            trade_server_down: false,
            pending_rejection: None,
            pending_failure: None,
        }
    }

    pub fn with_symbol(mut self, meta: SymbolMeta) -> Self {
        self.add_symbol(meta);
        self
    }

    pub fn add_symbol(&mut self, meta: SymbolMeta) {
        self.symbols.insert(meta.name.clone(), meta);
    }

    /// Append a closed candle. Candles must be pushed oldest -> newest.
    pub fn push_candle(&mut self, timeframe: Timeframe, candle: Candle) {
        self.candles
            .entry((candle.symbol.clone(), timeframe))
            .or_default()
            .push(candle);
    }

    pub fn set_quote(&mut self, tick: Tick) {
        self.quotes.insert(tick.symbol.clone(), tick);
    }

    pub fn set_balance(&mut self, balance: Decimal) {
        self.account.balance = balance;
        self.account.equity = balance;
        self.account.margin_free = balance;
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&mut self, n: u32) {
        self.failing_connects = n;
    }

    /// Simulate the terminal losing its trade server link.
    pub fn set_trade_server_down(&mut self, down: bool) {
        self.trade_server_down = down;
    }

    /// Drop the link to the terminal as if the process died.
    pub fn drop_connection(&mut self) {
        self.state = ConnectionState::Failed;
    }

    /// Reject the next market order with the given trade server code.
    pub fn reject_next_order(&mut self, retcode: u32, reason: impl Into<String>) {
        self.pending_rejection = Some((retcode, reason.into()));
    }

    /// Fail the next market order with `error` before it reaches the
    /// trade server.
    pub fn fail_next_order(&mut self, error: BrokerError) {
        self.pending_failure = Some(error);
    }

    /// Close every open position at its open price.
    pub fn close_all_positions(&mut self) {
        self.positions.clear();
    }

    pub fn open_positions(&self) -> &[Position] {
        &self.positions
    }

    /// Every market order request received, including rejected ones.
    pub fn sent_orders(&self) -> &[OrderRequest] {
        &self.sent_orders
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    fn require_connection(&self) -> Result<(), BrokerError> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn series(&self, symbol: &str, timeframe: Timeframe) -> &[Candle] {
        self.candles
            .get(&(symbol.to_string(), timeframe))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn fill_price(&self, tick: &Tick, side: Side, tick_size: Decimal) -> Decimal {
        let slippage = self.config.slippage_ticks * tick_size;
        match side {
            Side::Buy => tick.ask + slippage,
            Side::Sell => tick.bid - slippage,
        }
    }
}

impl Default for SimulatedBroker {
    fn default() -> Self {
        Self::new(SimulatedBrokerConfig::default())
    }
}

#[async_trait]
impl ConnectionManager for SimulatedBroker {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.connect_attempts += 1;
        if self.failing_connects > 0 {
            self.failing_connects -= 1;
            self.state = ConnectionState::Failed;
            return Err(BrokerError::Platform {
                context: "MT5 initialize failed.".to_string(),
                code: -10003,
                message: "IPC initialize failed".to_string(),
            });
        }
        self.state = ConnectionState::Connected;
        debug!(server = %self.config.server, "Simulated broker connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn health_check(&mut self) -> Result<TerminalInfo, BrokerError> {
        self.require_connection()?;
        if self.trade_server_down {
            return Err(BrokerError::ConnectionFailed(
                "Terminal is not connected to the trade server".to_string(),
            ));
        }
        Ok(TerminalInfo {
            name: "MetaTrader 5".to_string(),
            company: self.config.server.clone(),
            build: 4150,
            connected: true,
            trade_allowed: true,
        })
    }
}

#[async_trait]
impl MarketData for SimulatedBroker {
    async fn ensure_symbol(&mut self, symbol: &str) -> Result<(), BrokerError> {
        self.require_connection()?;
        let meta = self
            .symbols
            .get_mut(symbol)
            .ok_or_else(|| BrokerError::SymbolNotFound(symbol.to_string()))?;
        meta.visible = true;
        Ok(())
    }

    async fn symbol_meta(&mut self, symbol: &str) -> Result<SymbolMeta, BrokerError> {
        self.require_connection()?;
        self.symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::SymbolNotFound(symbol.to_string()))
    }

    async fn quote(&mut self, symbol: &str) -> Result<Tick, BrokerError> {
        self.require_connection()?;
        self.quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::NoQuote(symbol.to_string()))
    }

    async fn last_closed_candle(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<Candle>, BrokerError> {
        self.require_connection()?;
        Ok(self.series(symbol, timeframe).last().cloned())
    }

    async fn recent_candles(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        self.require_connection()?;
        let series = self.series(symbol, timeframe);
        let start = series.len().saturating_sub(count);
        Ok(series[start..].to_vec())
    }

    async fn candles_between(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        since_exclusive: i64,
        until_inclusive: i64,
    ) -> Result<Vec<Candle>, BrokerError> {
        self.require_connection()?;
        Ok(self
            .series(symbol, timeframe)
            .iter()
            .filter(|c| c.epoch() > since_exclusive && c.epoch() <= until_inclusive)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Execution for SimulatedBroker {
    async fn account(&mut self) -> Result<AccountState, BrokerError> {
        self.require_connection()?;
        Ok(self.account.clone())
    }

    async fn positions(&mut self, symbol: &str) -> Result<Vec<Position>, BrokerError> {
        self.require_connection()?;
        Ok(self
            .positions
            .iter()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn send_market_order(
        &mut self,
        request: &OrderRequest,
    ) -> Result<OrderResult, BrokerError> {
        self.require_connection()?;
        if let Some(error) = self.pending_failure.take() {
            return Err(error);
        }
        self.sent_orders.push(request.clone());

        if let Some((retcode, reason)) = self.pending_rejection.take() {
            return Ok(OrderResult::rejected(request, reason, Some(retcode)));
        }

        let tick = self
            .quotes
            .get(&request.symbol)
            .ok_or_else(|| BrokerError::NoQuote(request.symbol.clone()))?;
        let tick_size = self
            .symbols
            .get(&request.symbol)
            .map(|m| m.tick_size)
            .unwrap_or_default();
        let price = self.fill_price(tick, request.side, tick_size);
        let now = Utc::now();

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.positions.push(Position {
            ticket,
            symbol: request.symbol.clone(),
            side: request.side,
            volume: request.volume,
            open_price: price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            profit: Decimal::ZERO,
            opened_at: now,
        });

        Ok(OrderResult {
            symbol: request.symbol.clone(),
            side: request.side,
            lot: request.volume,
            entry_price: price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            ticket,
            time: now,
            status: OrderStatus::Filled,
            reason: None,
            retcode: Some(RETCODE_DONE),
        })
    }
}
