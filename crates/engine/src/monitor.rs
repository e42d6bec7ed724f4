use crate::error::EngineError;
use mt5bot_core::{BrokerError, Candle, MarketData, Timeframe};
use tracing::{info, warn};

/// A closed candle handed to the strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedCandle {
    pub candle: Candle,
    /// Only the newest bar of a poll is live; backfilled bars are stale.
    pub is_live: bool,
}

/// Detects newly closed candles for one symbol.
///
/// Remembers the epoch of the last processed bar so every bar is handed out
/// exactly once, and backfills bars missed between polls oldest -> newest.
#[derive(Debug, Clone)]
pub struct CandleMonitor {
    symbol: String,
    timeframe: Timeframe,
    timeframe_sec: i64,
    /// Bars to replay on the first poll. 0 only sets the pointer.
    bootstrap_bars: usize,
    last_seen: Option<i64>,
}

impl CandleMonitor {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        bootstrap_bars: usize,
    ) -> Result<Self, EngineError> {
        let timeframe_sec = timeframe
            .as_seconds()
            .ok_or_else(|| EngineError::UnsupportedTimeframe(timeframe.to_string()))?;
        Ok(Self {
            symbol: symbol.into(),
            timeframe,
            timeframe_sec,
            bootstrap_bars,
            last_seen: None,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_seen(&self) -> Option<i64> {
        self.last_seen
    }

    /// Mark everything up to `epoch` as processed, e.g. after warmup.
    pub fn prime(&mut self, epoch: i64) {
        self.last_seen = Some(epoch);
    }

    pub async fn poll<M>(&mut self, market: &mut M) -> Result<Vec<ClosedCandle>, BrokerError>
    where
        M: MarketData + ?Sized,
    {
        let Some(last) = market
            .last_closed_candle(&self.symbol, self.timeframe)
            .await?
        else {
            warn!(symbol = %self.symbol, "No closed candle available");
            return Ok(Vec::new());
        };
        let last_epoch = last.epoch();

        let bars = match self.last_seen {
            None if self.bootstrap_bars == 0 => {
                self.last_seen = Some(last_epoch);
                return Ok(Vec::new());
            }
            None => {
                let bars_back = i64::try_from(self.bootstrap_bars - 1).unwrap_or(i64::MAX);
                let span = bars_back.saturating_mul(self.timeframe_sec);
                let since = last_epoch.saturating_sub(span).saturating_sub(1);
                market
                    .candles_between(&self.symbol, self.timeframe, since, last_epoch)
                    .await?
            }
            Some(seen) if last_epoch <= seen => return Ok(Vec::new()),
            Some(seen) => {
                let backfill = market
                    .candles_between(&self.symbol, self.timeframe, seen, last_epoch)
                    .await?;
                if backfill.is_empty() {
                    vec![last]
                } else {
                    backfill
                }
            }
        };

        let newest = bars.last().map(Candle::epoch);
        let closed = bars
            .into_iter()
            .map(|candle| {
                log_candle(&candle);
                self.last_seen = Some(candle.epoch());
                ClosedCandle {
                    is_live: Some(candle.epoch()) == newest,
                    candle,
                }
            })
            .collect();
        Ok(closed)
    }
}

fn log_candle(candle: &Candle) {
    info!(
        "Candle {} {} closed | O={} H={} L={} C={} Volume={}",
        candle.symbol,
        candle.time.format("%Y-%m-%d %H:%M:%S"),
        candle.open,
        candle.high,
        candle.low,
        candle.close,
        candle.volume
    );
}
