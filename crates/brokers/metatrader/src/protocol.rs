//! Wire protocol spoken with the MT5 bridge.
//!
//! Every frame is a 4-byte big-endian length followed by a UTF-8 JSON body.
//! The client sends [`Request`]s; the bridge answers each with a
//! [`Response`] echoing the request id. Id 0 is reserved for unsolicited
//! frames such as the `hello` sent on accept.

use chrono::{DateTime, Utc};
use mt5bot_core::{
    AccountState, Candle, Position, Side, SymbolMeta, TerminalInfo, TerminalVersion, Tick,
    Timeframe,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Id of frames the bridge sends on its own.
pub const UNSOLICITED_ID: u64 = 0;

// MT5 trade constants
pub const TRADE_ACTION_DEAL: u32 = 1;
pub const ORDER_TYPE_BUY: u32 = 0;
pub const ORDER_TYPE_SELL: u32 = 1;
pub const ORDER_TIME_GTC: u32 = 0;
pub const ORDER_FILLING_IOC: u32 = 1;
pub const POSITION_TYPE_BUY: u32 = 0;
pub const TRADE_RETCODE_DONE: u32 = 10009;
pub const TRADE_RETCODE_DONE_PARTIAL: u32 = 10010;

/// MT5 `TIMEFRAME_*` constant for a timeframe.
pub fn timeframe_code(timeframe: Timeframe) -> Option<u32> {
    if !timeframe.is_supported() {
        return None;
    }
    Some(match timeframe {
        Timeframe::Minute(n) => n,
        Timeframe::Hour(n) => 0x4000 | n,
        Timeframe::Daily => 0x4018,
        Timeframe::Weekly => 0x8001,
        Timeframe::Monthly => 0xC001,
    })
}

pub fn is_filled_retcode(retcode: u32) -> bool {
    retcode == TRADE_RETCODE_DONE || retcode == TRADE_RETCODE_DONE_PARTIAL
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Calls the bridge forwards to the `MetaTrader5` terminal API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Initialize {
        terminal_path: Option<String>,
        timeout_ms: u64,
        portable: bool,
    },
    Login {
        login: u64,
        password: String,
        server: String,
        timeout_ms: u64,
    },
    Shutdown,
    TerminalInfo,
    Version,
    SymbolInfo {
        symbol: String,
    },
    SymbolSelect {
        symbol: String,
        enable: bool,
    },
    CopyRatesFromPos {
        symbol: String,
        timeframe: u32,
        start_pos: u32,
        count: u32,
    },
    CopyRatesRange {
        symbol: String,
        timeframe: u32,
        date_from: i64,
        date_to: i64,
    },
    SymbolInfoTick {
        symbol: String,
    },
    AccountInfo,
    PositionsGet {
        symbol: String,
    },
    OrderSend {
        request: TradeRequest,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Initialize { .. } => "initialize",
            Command::Login { .. } => "login",
            Command::Shutdown => "shutdown",
            Command::TerminalInfo => "terminal_info",
            Command::Version => "version",
            Command::SymbolInfo { .. } => "symbol_info",
            Command::SymbolSelect { .. } => "symbol_select",
            Command::CopyRatesFromPos { .. } => "copy_rates_from_pos",
            Command::CopyRatesRange { .. } => "copy_rates_range",
            Command::SymbolInfoTick { .. } => "symbol_info_tick",
            Command::AccountInfo => "account_info",
            Command::PositionsGet { .. } => "positions_get",
            Command::OrderSend { .. } => "order_send",
            Command::Heartbeat { .. } => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub reply: Reply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Reply {
    Hello { version: String },
    /// Boolean result of initialize/login/symbol_select/shutdown.
    Ack(bool),
    TerminalInfo(TerminalInfoDto),
    /// `(release, build, date)`
    Version(u32, u32, String),
    /// `None` when the symbol does not exist on the server.
    SymbolInfo(Option<SymbolInfoDto>),
    Rates(Vec<RateDto>),
    Tick(Option<TickDto>),
    AccountInfo(AccountInfoDto),
    Positions(Vec<PositionDto>),
    OrderResult(TradeResultDto),
    Heartbeat { timestamp: DateTime<Utc> },
    /// The terminal's `last_error()` after a failed call.
    Error { code: i32, message: String },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Hello { .. } => "hello",
            Reply::Ack(_) => "ack",
            Reply::TerminalInfo(_) => "terminal_info",
            Reply::Version(..) => "version",
            Reply::SymbolInfo(_) => "symbol_info",
            Reply::Rates(_) => "rates",
            Reply::Tick(_) => "tick",
            Reply::AccountInfo(_) => "account_info",
            Reply::Positions(_) => "positions",
            Reply::OrderResult(_) => "order_result",
            Reply::Heartbeat { .. } => "heartbeat",
            Reply::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalInfoDto {
    pub name: String,
    pub company: String,
    pub build: u32,
    pub connected: bool,
    pub trade_allowed: bool,
}

impl From<TerminalInfoDto> for TerminalInfo {
    fn from(dto: TerminalInfoDto) -> Self {
        TerminalInfo {
            name: dto.name,
            company: dto.company,
            build: dto.build,
            connected: dto.connected,
            trade_allowed: dto.trade_allowed,
        }
    }
}

pub fn version_from_parts(release: u32, build: u32, date: String) -> TerminalVersion {
    TerminalVersion {
        release,
        build,
        date,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfoDto {
    pub name: String,
    pub digits: u32,
    pub point: Decimal,
    pub trade_tick_value: Decimal,
    pub trade_tick_size: Decimal,
    pub volume_step: Decimal,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
    pub trade_contract_size: Decimal,
    pub trade_stops_level: u32,
    pub trade_freeze_level: u32,
    pub visible: bool,
    /// Time of the last quote, epoch seconds.
    #[serde(default)]
    pub time: i64,
}

impl From<SymbolInfoDto> for SymbolMeta {
    fn from(dto: SymbolInfoDto) -> Self {
        SymbolMeta {
            name: dto.name,
            digits: dto.digits,
            tick_size: dto.point,
            tick_value: dto.trade_tick_value,
            lot_step: dto.volume_step,
            min_lot: dto.volume_min,
            max_lot: dto.volume_max,
            contract_size: dto.trade_contract_size,
            stops_level: dto.trade_stops_level,
            freeze_level: dto.trade_freeze_level,
            visible: dto.visible,
        }
    }
}

/// One row of `copy_rates_*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateDto {
    /// Bar open time, epoch seconds.
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub tick_volume: u64,
    #[serde(default)]
    pub spread: i32,
    #[serde(default)]
    pub real_volume: u64,
}

impl RateDto {
    pub fn into_candle(self, symbol: &str) -> Option<Candle> {
        Some(Candle {
            symbol: symbol.to_string(),
            time: DateTime::from_timestamp(self.time, 0)?,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: Decimal::from(self.tick_volume),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickDto {
    pub time: i64,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: u64,
}

impl TickDto {
    pub fn into_tick(self, symbol: &str) -> Option<Tick> {
        Some(Tick {
            symbol: symbol.to_string(),
            time: DateTime::from_timestamp(self.time, 0)?,
            bid: self.bid,
            ask: self.ask,
            last: self.last,
            volume: Decimal::from(self.volume),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfoDto {
    pub login: u64,
    pub name: String,
    pub server: String,
    pub currency: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub margin_free: Decimal,
    pub leverage: u32,
}

impl From<AccountInfoDto> for AccountState {
    fn from(dto: AccountInfoDto) -> Self {
        AccountState {
            login: dto.login,
            name: dto.name,
            server: dto.server,
            currency: dto.currency,
            balance: dto.balance,
            equity: dto.equity,
            margin: dto.margin,
            margin_free: dto.margin_free,
            leverage: dto.leverage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionDto {
    pub ticket: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: u32,
    pub volume: Decimal,
    pub price_open: Decimal,
    pub sl: Decimal,
    pub tp: Decimal,
    pub profit: Decimal,
    pub time: i64,
}

impl PositionDto {
    pub fn into_position(self) -> Option<Position> {
        Some(Position {
            ticket: self.ticket,
            side: if self.kind == POSITION_TYPE_BUY {
                Side::Buy
            } else {
                Side::Sell
            },
            symbol: self.symbol,
            volume: self.volume,
            open_price: self.price_open,
            stop_loss: self.sl,
            take_profit: self.tp,
            profit: self.profit,
            opened_at: DateTime::from_timestamp(self.time, 0)?,
        })
    }
}

/// `MqlTradeRequest` subset used for market orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub action: u32,
    pub symbol: String,
    pub volume: Decimal,
    #[serde(rename = "type")]
    pub kind: u32,
    pub price: Decimal,
    pub sl: Decimal,
    pub tp: Decimal,
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
    pub type_time: u32,
    pub type_filling: u32,
}

/// `MqlTradeResult` subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResultDto {
    pub retcode: u32,
    pub deal: u64,
    pub order: u64,
    pub volume: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub comment: String,
}

/// Frame a message with a 4-byte length prefix (big-endian). Messages over
/// [`MAX_FRAME_LEN`] are refused, matching what `read_frame` accepts.
pub fn frame_message(msg: &[u8]) -> std::io::Result<Vec<u8>> {
    let len = u32::try_from(msg.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| oversized(msg.len()))?;
    let mut framed = Vec::with_capacity(4 + msg.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(msg);
    Ok(framed)
}

fn oversized(len: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("frame of {} bytes exceeds limit", len),
    )
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame_message(body)?).await?;
    writer.flush().await
}

pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(oversized(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_timeframe_codes() {
        assert_eq!(timeframe_code(Timeframe::Minute(5)), Some(5));
        assert_eq!(timeframe_code(Timeframe::Hour(1)), Some(0x4001));
        assert_eq!(timeframe_code(Timeframe::Hour(4)), Some(0x4004));
        assert_eq!(timeframe_code(Timeframe::Daily), Some(0x4018));
        assert_eq!(timeframe_code(Timeframe::Weekly), Some(0x8001));
        assert_eq!(timeframe_code(Timeframe::Monthly), Some(0xC001));
        assert_eq!(timeframe_code(Timeframe::Minute(7)), None);
    }

    #[test]
    fn test_request_wire_shape() {
        let req = Request {
            id: 7,
            command: Command::SymbolSelect {
                symbol: "EURUSD".into(),
                enable: true,
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["command"]["type"], "symbol_select");
        assert_eq!(json["command"]["symbol"], "EURUSD");

        let json = serde_json::to_value(Command::Shutdown).unwrap();
        assert_eq!(json, serde_json::json!({"type": "shutdown"}));
    }

    #[test]
    fn test_reply_accepts_numeric_prices() {
        let raw = r#"{"id":3,"reply":{"type":"tick","data":
            {"time":1741082400,"bid":1.08412,"ask":"1.08415","last":0,"volume":3}}}"#;
        let resp: Response = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.id, 3);
        let Reply::Tick(Some(tick)) = resp.reply else {
            panic!("expected tick reply");
        };
        let tick = tick.into_tick("EURUSD").unwrap();
        assert_eq!(tick.bid, dec!(1.08412));
        assert_eq!(tick.ask, dec!(1.08415));
    }

    #[test]
    fn test_version_and_error_replies() {
        let resp: Response = serde_json::from_str(
            r#"{"id":2,"reply":{"type":"version","data":[500,4150,"13 Jan 2025"]}}"#,
        )
        .unwrap();
        let Reply::Version(release, build, date) = resp.reply else {
            panic!("expected version reply");
        };
        assert_eq!(
            version_from_parts(release, build, date).to_string(),
            "5.00 build 4150 (13 Jan 2025)"
        );

        let resp: Response = serde_json::from_str(
            r#"{"id":1,"reply":{"type":"error","data":{"code":-6,"message":"Terminal: Authorization failed"}}}"#,
        )
        .unwrap();
        assert!(matches!(resp.reply, Reply::Error { code: -6, .. }));
    }

    #[test]
    fn test_rate_into_candle() {
        let rate = RateDto {
            time: 1_741_082_400,
            open: dec!(2900.1),
            high: dec!(2901),
            low: dec!(2899.5),
            close: dec!(2900.7),
            tick_volume: 120,
            spread: 15,
            real_volume: 0,
        };
        let candle = rate.into_candle("XAUUSD").unwrap();
        assert_eq!(candle.epoch(), 1_741_082_400);
        assert_eq!(candle.volume, dec!(120));
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"{\"x\":1}").await.unwrap();
        let body = read_frame(&mut b).await.unwrap();
        assert_eq!(body, b"{\"x\":1}");
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_oversized_message_is_not_written() {
        let body = vec![b' '; MAX_FRAME_LEN + 1];
        assert!(frame_message(&body).is_err());

        let (mut a, _b) = tokio::io::duplex(64);
        let err = write_frame(&mut a, &body).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let framed = frame_message(b"{}").unwrap();
        assert_eq!(framed, vec![0, 0, 0, 2, b'{', b'}']);
    }
}
