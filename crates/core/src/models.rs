use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Symbol
// ---------------------------------------------------------------------------

/// Broker-side description of a tradeable symbol (e.g. EURUSD, XAUUSD).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub name: String,
    /// Number of decimal places prices are quoted with.
    pub digits: u32,
    /// Minimum price movement (MT5 "point").
    pub tick_size: Decimal,
    /// Cash value of one `tick_size` move for 1.0 lot.
    pub tick_value: Decimal,
    pub lot_step: Decimal,
    pub min_lot: Decimal,
    /// Zero when the broker reports no upper bound.
    pub max_lot: Decimal,
    pub contract_size: Decimal,
    /// Minimum SL/TP distance from the current price, in points.
    pub stops_level: u32,
    /// Distance in points inside which orders can't be modified.
    pub freeze_level: u32,
    /// Whether the symbol is shown in Market Watch.
    pub visible: bool,
}

impl SymbolMeta {
    /// Round a price to the symbol's digits (half away from zero).
    pub fn round_price(&self, price: Decimal) -> Decimal {
        price.round_dp_with_strategy(self.digits, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Minimum stop distance in price units.
    pub fn min_stop_distance(&self) -> Decimal {
        Decimal::from(self.stops_level) * self.tick_size
    }
}

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// A single OHLC bar. `time` is the bar's open time in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Tick volume.
    pub volume: Decimal,
}

impl Candle {
    /// Bar open time as integer epoch seconds.
    pub fn epoch(&self) -> i64 {
        self.time.timestamp()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// High-low range, never negative.
    pub fn range(&self) -> Decimal {
        (self.high - self.low).max(Decimal::ZERO)
    }

    pub fn body(&self) -> Decimal {
        (self.close - self.open).abs()
    }
}

/// A single live quote (bid/ask/last).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: Decimal,
}

impl Tick {
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    /// The price a market order on `side` would be filled at.
    pub fn entry_price(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }
}

/// Timeframe for bars. Only the timeframes MT5 supports are representable
/// through [`Timeframe::from_minutes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    Minute(u32),
    Hour(u32),
    Daily,
    Weekly,
    Monthly,
}

impl Timeframe {
    const MINUTES: [u32; 11] = [1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30];
    const HOURS: [u32; 7] = [1, 2, 3, 4, 6, 8, 12];

    /// Map a minute count to its canonical timeframe (60 -> H1, 1440 -> D1).
    pub fn from_minutes(minutes: u32) -> Option<Self> {
        match minutes {
            m if Self::MINUTES.contains(&m) => Some(Timeframe::Minute(m)),
            1440 => Some(Timeframe::Daily),
            m if m % 60 == 0 && Self::HOURS.contains(&(m / 60)) => Some(Timeframe::Hour(m / 60)),
            _ => None,
        }
    }

    pub fn is_supported(&self) -> bool {
        match self {
            Timeframe::Minute(n) => Self::MINUTES.contains(n),
            Timeframe::Hour(n) => Self::HOURS.contains(n),
            Timeframe::Daily | Timeframe::Weekly | Timeframe::Monthly => true,
        }
    }

    /// Fixed length in minutes. Weekly and monthly bars have none.
    pub fn minutes(&self) -> Option<u32> {
        match self {
            Timeframe::Minute(n) => Some(*n),
            Timeframe::Hour(n) => Some(n * 60),
            Timeframe::Daily => Some(1440),
            Timeframe::Weekly | Timeframe::Monthly => None,
        }
    }

    pub fn as_seconds(&self) -> Option<i64> {
        self.minutes().map(|m| i64::from(m) * 60)
    }

    /// Human-readable, hyphenated form, e.g. "5-minute" or "4-hour".
    pub fn humanize(&self) -> String {
        match self {
            Timeframe::Minute(n) => format!("{}-minute", n),
            Timeframe::Hour(n) => format!("{}-hour", n),
            Timeframe::Daily => "1-day".to_string(),
            Timeframe::Weekly => "1-week".to_string(),
            Timeframe::Monthly => "1-month".to_string(),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Minute(n) => write!(f, "M{}", n),
            Timeframe::Hour(n) => write!(f, "H{}", n),
            Timeframe::Daily => write!(f, "D1"),
            Timeframe::Weekly => write!(f, "W1"),
            Timeframe::Monthly => write!(f, "MN1"),
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Trend bias of the market relative to the long EMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Bias {
    Bullish,
    Bearish,
    None,
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bias::Bullish => write!(f, "BULLISH"),
            Bias::Bearish => write!(f, "BEARISH"),
            Bias::None => write!(f, "NONE"),
        }
    }
}

/// A trade signal tied to a specific closed candle. Pure detection result,
/// no execution details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub bias: Bias,
    /// Open time of the candle whose close confirmed the signal.
    pub candle_time: DateTime<Utc>,
    pub timeframe: Timeframe,
    /// Reference price (close of the confirming candle).
    pub entry: Option<Decimal>,
    /// Pattern extreme the stop is derived from.
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// ATR at the confirming candle, when available.
    pub atr: Option<Decimal>,
    /// False when the signal was detected on a backfilled bar.
    pub is_live: bool,
    pub strategy_id: String,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Plan produced from a signal before execution.
///
/// Prices are rounded to symbol digits. The lot is not part of the plan since
/// it depends on the live quote; `planned_tp` is a placeholder equal to the
/// stop until execution recomputes it from the live entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlan {
    pub symbol: String,
    pub side: Side,
    /// Reward-to-risk ratio.
    pub rr: Decimal,
    pub planned_sl: Decimal,
    pub planned_tp: Decimal,
    pub signal_time: DateTime<Utc>,
    pub source_signal_id: Option<Uuid>,
}

/// A market order request as sent to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Maximum accepted slippage in points.
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Filled,
    Rejected,
    Error,
}

/// Execution result reported by the broker adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub symbol: String,
    pub side: Side,
    pub lot: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub ticket: u64,
    pub time: DateTime<Utc>,
    pub status: OrderStatus,
    pub reason: Option<String>,
    /// Broker trade server return code, when the broker reports one.
    pub retcode: Option<u32>,
}

impl OrderResult {
    /// A rejection for `request` that never produced a deal.
    pub fn rejected(request: &OrderRequest, reason: impl Into<String>, retcode: Option<u32>) -> Self {
        Self {
            symbol: request.symbol.clone(),
            side: request.side,
            lot: request.volume,
            entry_price: Decimal::ZERO,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            ticket: 0,
            time: Utc::now(),
            status: OrderStatus::Rejected,
            reason: Some(reason.into()),
            retcode,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

// ---------------------------------------------------------------------------
// Positions & Account
// ---------------------------------------------------------------------------

/// An open position on the trade server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub profit: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// Snapshot of the trading account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
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

impl AccountState {
    pub fn new(balance: Decimal) -> Self {
        Self {
            login: 0,
            name: String::new(),
            server: String::new(),
            currency: "USD".to_string(),
            balance,
            equity: balance,
            margin: Decimal::ZERO,
            margin_free: balance,
            leverage: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal & Connection
// ---------------------------------------------------------------------------

/// Information reported by the MT5 terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub name: String,
    pub company: String,
    pub build: u32,
    /// Whether the terminal is connected to the trade server.
    pub connected: bool,
    pub trade_allowed: bool,
}

/// Terminal version as reported by `version()`: (release, build, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalVersion {
    pub release: u32,
    pub build: u32,
    pub date: String,
}

impl fmt::Display for TerminalVersion {
    /// Formats as e.g. `5.00 build 4150 (13 Jan 2025)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02} build {} ({})",
            self.release / 100,
            self.release % 100,
            self.build,
            self.date
        )
    }
}

/// Lifecycle state of a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}
