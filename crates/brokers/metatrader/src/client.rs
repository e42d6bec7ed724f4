use async_trait::async_trait;
use chrono::Utc;
use mt5bot_core::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::protocol::*;

/// Configuration for connecting to MetaTrader 5 through the socket bridge.
#[derive(Clone, Serialize, Deserialize)]
pub struct MetaTraderConfig {
    /// Bridge host address (e.g. "127.0.0.1").
    pub host: String,
    /// Port the bridge is listening on.
    pub port: u16,
    pub login: u64,
    pub password: String,
    pub server: String,
    /// Terminal executable the bridge should attach to.
    pub terminal_path: Option<String>,
    pub connect_timeout_ms: u64,
    /// Deadline for one request/response exchange.
    pub request_timeout_ms: u64,
    /// Timeout forwarded to the terminal's initialize/login calls.
    pub platform_timeout_ms: u64,
}

impl Default for MetaTraderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5556,
            login: 0,
            password: String::new(),
            server: String::new(),
            terminal_path: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            platform_timeout_ms: 5_000,
        }
    }
}

impl std::fmt::Debug for MetaTraderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaTraderConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &"********")
            .field("server", &self.server)
            .field("terminal_path", &self.terminal_path)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

/// MetaTrader 5 broker adapter.
///
/// Talks to a bridge process running next to the terminal over TCP using
/// length-prefixed JSON frames. One request is in flight at a time; replies
/// are matched by id and anything else on the wire is skipped.
pub struct MetaTraderBroker {
    config: MetaTraderConfig,
    stream: Option<TcpStream>,
    state: ConnectionState,
    next_id: u64,
    terminal: Option<TerminalInfo>,
    version: Option<TerminalVersion>,
}

impl MetaTraderBroker {
    pub fn new(config: MetaTraderConfig) -> Self {
        Self {
            config,
            stream: None,
            state: ConnectionState::Disconnected,
            next_id: UNSOLICITED_ID + 1,
            terminal: None,
            version: None,
        }
    }

    pub fn config(&self) -> &MetaTraderConfig {
        &self.config
    }

    /// Terminal info captured during the last successful connect.
    pub fn terminal(&self) -> Option<&TerminalInfo> {
        self.terminal.as_ref()
    }

    pub fn version(&self) -> Option<&TerminalVersion> {
        self.version.as_ref()
    }

    fn require_connected(&self) -> Result<(), BrokerError> {
        if self.state == ConnectionState::Connected && self.stream.is_some() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    /// Drop the socket after an I/O failure.
    fn mark_failed(&mut self, reason: &str) {
        warn!(%reason, "Lost connection to MetaTrader bridge");
        self.stream = None;
        self.state = ConnectionState::Failed;
    }

    /// Send one command and wait for the reply carrying the same id.
    async fn call(&mut self, command: Command) -> Result<Reply, BrokerError> {
        let id = self.next_id;
        self.next_id += 1;
        let name = command.name();
        let body = serde_json::to_vec(&Request { id, command })
            .map_err(|e| BrokerError::Protocol(format!("Serialization error: {}", e)))?;
        if body.len() > MAX_FRAME_LEN {
            return Err(BrokerError::Protocol(format!(
                "{} request of {} bytes exceeds frame limit",
                name,
                body.len()
            )));
        }

        let limit = Duration::from_millis(self.config.request_timeout_ms);
        let stream = self.stream.as_mut().ok_or(BrokerError::NotConnected)?;

        match timeout(limit, exchange(stream, &body, id)).await {
            Ok(Ok(result)) => {
                debug!(id, command = name, "Bridge call completed");
                result
            }
            Ok(Err(e)) => {
                self.mark_failed(&e.to_string());
                Err(BrokerError::ConnectionFailed(format!("{} failed: {}", name, e)))
            }
            Err(_) => {
                // A cancelled read may leave part of a frame on the socket.
                self.mark_failed(&format!("{} timed out", name));
                Err(BrokerError::Timeout(self.config.request_timeout_ms))
            }
        }
    }

    /// Run a call whose success is a boolean ack; failures become
    /// `Platform` errors tagged with `context`.
    async fn call_ack(&mut self, command: Command, context: &str) -> Result<(), BrokerError> {
        match self.call(command).await? {
            Reply::Ack(true) => Ok(()),
            Reply::Ack(false) => Err(BrokerError::Platform {
                context: context.to_string(),
                code: -1,
                message: "Unknown error".to_string(),
            }),
            other => Err(unexpected(context, other)),
        }
    }

    async fn handshake(&mut self) -> Result<(), BrokerError> {
        let stream = self.stream.as_mut().ok_or(BrokerError::NotConnected)?;
        let limit = Duration::from_millis(self.config.connect_timeout_ms);
        let frame = match timeout(limit, read_frame(&mut *stream)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => return Err(BrokerError::ConnectionFailed(format!("Read error: {}", e))),
            Err(_) => return Err(BrokerError::Timeout(self.config.connect_timeout_ms)),
        };
        match serde_json::from_slice::<Response>(&frame) {
            Ok(Response {
                reply: Reply::Hello { version },
                ..
            }) => info!("MetaTrader bridge v{} ready", version),
            Ok(Response {
                reply: Reply::Error { code, message },
                ..
            }) => {
                return Err(BrokerError::Platform {
                    context: "MT5 bridge refused connection.".to_string(),
                    code,
                    message,
                })
            }
            Ok(other) => {
                return Err(BrokerError::Protocol(format!(
                    "Unexpected initial message: {}",
                    other.reply.kind()
                )))
            }
            Err(e) => return Err(BrokerError::Protocol(format!("Deserialization error: {}", e))),
        }

        let init = Command::Initialize {
            terminal_path: self.config.terminal_path.clone(),
            timeout_ms: self.config.platform_timeout_ms,
            portable: false,
        };
        self.call_ack(init, "MT5 initialize failed.").await?;

        let login = Command::Login {
            login: self.config.login,
            password: self.config.password.clone(),
            server: self.config.server.clone(),
            timeout_ms: self.config.platform_timeout_ms,
        };
        if let Err(e) = self.call_ack(login, "MT5 login failed.").await {
            if let Err(shutdown_err) = self.call(Command::Shutdown).await {
                debug!(error = %shutdown_err, "Shutdown after failed login did not complete");
            }
            return Err(e);
        }
        info!(
            "MT5 initialized and logged in to server \"{}\" as login {}",
            self.config.server, self.config.login
        );

        let terminal = match self.call(Command::TerminalInfo).await? {
            Reply::TerminalInfo(dto) => TerminalInfo::from(dto),
            other => return Err(unexpected("Unable to retrieve MT5 terminal information.", other)),
        };
        let version = match self.call(Command::Version).await? {
            Reply::Version(release, build, date) => version_from_parts(release, build, date),
            other => return Err(unexpected("Unable to retrieve MT5 version.", other)),
        };
        info!("Connected to {}. Terminal version is {}.", terminal.name, version);

        self.terminal = Some(terminal);
        self.version = Some(version);
        Ok(())
    }

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfoDto, BrokerError> {
        self.require_connected()?;
        match self
            .call(Command::SymbolInfo {
                symbol: symbol.to_string(),
            })
            .await?
        {
            Reply::SymbolInfo(Some(info)) => Ok(info),
            Reply::SymbolInfo(None) => Err(BrokerError::SymbolNotFound(symbol.to_string())),
            other => Err(unexpected(&format!("symbol_info({}) failed.", symbol), other)),
        }
    }

    async fn rates(&mut self, symbol: &str, command: Command) -> Result<Vec<Candle>, BrokerError> {
        self.require_connected()?;
        match self.call(command).await? {
            Reply::Rates(rows) => rows
                .into_iter()
                .map(|r| {
                    let time = r.time;
                    r.into_candle(symbol)
                        .ok_or_else(|| BrokerError::Protocol(format!("Invalid bar time {}", time)))
                })
                .collect(),
            other => Err(unexpected(&format!("{} rates failed.", symbol), other)),
        }
    }
}

/// Write one request and read frames until the reply with `id` arrives.
async fn exchange(
    stream: &mut TcpStream,
    body: &[u8],
    id: u64,
) -> std::io::Result<Result<Reply, BrokerError>> {
    write_frame(&mut *stream, body).await?;
    loop {
        let frame = read_frame(&mut *stream).await?;
        match serde_json::from_slice::<Response>(&frame) {
            Ok(resp) if resp.id == id => return Ok(Ok(resp.reply)),
            Ok(resp) => {
                debug!(id = resp.id, reply = resp.reply.kind(), "Skipping unmatched frame");
            }
            Err(e) => {
                return Ok(Err(BrokerError::Protocol(format!(
                    "Deserialization error: {}",
                    e
                ))))
            }
        }
    }
}

fn unexpected(context: &str, reply: Reply) -> BrokerError {
    match reply {
        Reply::Error { code, message } => BrokerError::Platform {
            context: context.to_string(),
            code,
            message,
        },
        other => BrokerError::Protocol(format!("{} Unexpected reply: {}", context, other.kind())),
    }
}

fn tf_code(timeframe: Timeframe) -> Result<u32, BrokerError> {
    timeframe_code(timeframe).ok_or_else(|| BrokerError::UnsupportedTimeframe(timeframe.to_string()))
}

#[async_trait]
impl ConnectionManager for MetaTraderBroker {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        if self.require_connected().is_ok() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to MetaTrader at {}", addr);

        let limit = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match timeout(limit, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state = ConnectionState::Failed;
                return Err(BrokerError::ConnectionFailed(format!("TCP connect failed: {}", e)));
            }
            Err(_) => {
                self.state = ConnectionState::Failed;
                return Err(BrokerError::Timeout(self.config.connect_timeout_ms));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not set TCP_NODELAY");
        }
        self.stream = Some(stream);

        match self.handshake().await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.stream = None;
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        if self.stream.is_some() {
            if let Err(e) = self.call(Command::Shutdown).await {
                debug!(error = %e, "Bridge shutdown did not complete");
            }
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        if self.state != ConnectionState::Disconnected {
            info!("MT5 shutdown complete.");
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn health_check(&mut self) -> Result<TerminalInfo, BrokerError> {
        self.require_connected()?;
        match self
            .call(Command::Heartbeat {
                timestamp: Utc::now(),
            })
            .await?
        {
            Reply::Heartbeat { .. } => {}
            other => return Err(unexpected("Heartbeat failed.", other)),
        }

        let info = match self.call(Command::TerminalInfo).await? {
            Reply::TerminalInfo(dto) => TerminalInfo::from(dto),
            other => return Err(unexpected("Unable to retrieve MT5 terminal information.", other)),
        };
        if !info.connected {
            return Err(BrokerError::ConnectionFailed(
                "Terminal is not connected to the trade server".to_string(),
            ));
        }
        self.terminal = Some(info.clone());
        Ok(info)
    }
}

#[async_trait]
impl MarketData for MetaTraderBroker {
    async fn ensure_symbol(&mut self, symbol: &str) -> Result<(), BrokerError> {
        let info = self.symbol_info(symbol).await?;
        if !info.visible {
            let select = Command::SymbolSelect {
                symbol: symbol.to_string(),
                enable: true,
            };
            match self.call(select).await? {
                Reply::Ack(true) => {}
                _ => return Err(BrokerError::SymbolSelectFailed(symbol.to_string())),
            }
        }
        debug!("Symbol ensured: {}", symbol);
        Ok(())
    }

    async fn symbol_meta(&mut self, symbol: &str) -> Result<SymbolMeta, BrokerError> {
        Ok(self.symbol_info(symbol).await?.into())
    }

    async fn quote(&mut self, symbol: &str) -> Result<Tick, BrokerError> {
        self.require_connected()?;
        match self
            .call(Command::SymbolInfoTick {
                symbol: symbol.to_string(),
            })
            .await?
        {
            Reply::Tick(Some(dto)) => dto
                .into_tick(symbol)
                .ok_or_else(|| BrokerError::Protocol("Invalid tick time".to_string())),
            Reply::Tick(None) => Err(BrokerError::NoQuote(symbol.to_string())),
            other => Err(unexpected(&format!("Failed to retrieve {} info tick.", symbol), other)),
        }
    }

    async fn last_closed_candle(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<Candle>, BrokerError> {
        Ok(self.recent_candles(symbol, timeframe, 1).await?.pop())
    }

    async fn recent_candles(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        // Position 0 is the forming bar; start at 1 for closed bars only.
        let command = Command::CopyRatesFromPos {
            symbol: symbol.to_string(),
            timeframe: tf_code(timeframe)?,
            start_pos: 1,
            count: u32::try_from(count).unwrap_or(u32::MAX),
        };
        self.rates(symbol, command).await
    }

    async fn candles_between(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        since_exclusive: i64,
        until_inclusive: i64,
    ) -> Result<Vec<Candle>, BrokerError> {
        if until_inclusive <= since_exclusive {
            return Ok(Vec::new());
        }
        let command = Command::CopyRatesRange {
            symbol: symbol.to_string(),
            timeframe: tf_code(timeframe)?,
            date_from: since_exclusive + 1,
            date_to: until_inclusive,
        };
        let mut candles = self.rates(symbol, command).await?;
        candles.retain(|c| c.epoch() > since_exclusive && c.epoch() <= until_inclusive);
        Ok(candles)
    }
}

#[async_trait]
impl Execution for MetaTraderBroker {
    async fn account(&mut self) -> Result<AccountState, BrokerError> {
        self.require_connected()?;
        match self.call(Command::AccountInfo).await? {
            Reply::AccountInfo(dto) => Ok(dto.into()),
            other => Err(unexpected("Failed to retrieve account info.", other)),
        }
    }

    async fn positions(&mut self, symbol: &str) -> Result<Vec<Position>, BrokerError> {
        self.require_connected()?;
        match self
            .call(Command::PositionsGet {
                symbol: symbol.to_string(),
            })
            .await?
        {
            Reply::Positions(rows) => rows
                .into_iter()
                .map(|p| {
                    p.into_position()
                        .ok_or_else(|| BrokerError::Protocol("Invalid position time".to_string()))
                })
                .collect(),
            other => Err(unexpected(&format!("Failed to retrieve {} positions.", symbol), other)),
        }
    }

    async fn send_market_order(
        &mut self,
        request: &OrderRequest,
    ) -> Result<OrderResult, BrokerError> {
        let tick = self.quote(&request.symbol).await?;
        let price = tick.entry_price(request.side);

        let trade = TradeRequest {
            action: TRADE_ACTION_DEAL,
            symbol: request.symbol.clone(),
            volume: request.volume,
            kind: match request.side {
                Side::Buy => ORDER_TYPE_BUY,
                Side::Sell => ORDER_TYPE_SELL,
            },
            price,
            sl: request.stop_loss,
            tp: request.take_profit,
            deviation: request.deviation,
            magic: request.magic,
            comment: request.comment.clone(),
            type_time: ORDER_TIME_GTC,
            type_filling: ORDER_FILLING_IOC,
        };

        let result = match self.call(Command::OrderSend { request: trade }).await? {
            Reply::OrderResult(result) => result,
            other => return Err(unexpected("order_send failed.", other)),
        };

        if !is_filled_retcode(result.retcode) {
            warn!(
                symbol = %request.symbol,
                retcode = result.retcode,
                comment = %result.comment,
                "Order rejected by trade server"
            );
            return Ok(OrderResult::rejected(
                request,
                result.comment,
                Some(result.retcode),
            ));
        }

        Ok(OrderResult {
            symbol: request.symbol.clone(),
            side: request.side,
            lot: if result.volume > Decimal::ZERO {
                result.volume
            } else {
                request.volume
            },
            entry_price: if result.price > Decimal::ZERO {
                result.price
            } else {
                price
            },
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            ticket: if result.order != 0 { result.order } else { result.deal },
            time: Utc::now(),
            status: OrderStatus::Filled,
            reason: None,
            retcode: Some(result.retcode),
        })
    }
}
