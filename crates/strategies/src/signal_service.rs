use crate::three_bar::{self, WINDOW};
use async_trait::async_trait;
use mt5bot_core::*;
use mt5bot_indicators::{IndicatorSet, IndicatorSetConfig, IndicatorsSnapshot};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreeBarConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Body/range ratio at or below which a candle counts as a doji.
    pub doji_ratio: Decimal,
    #[serde(default)]
    pub indicators: IndicatorSetConfig,
}

impl ThreeBarConfig {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            doji_ratio: dec!(0.1),
            indicators: IndicatorSetConfig::default(),
        }
    }
}

/// Three-bar continuation strategy.
///
/// Keeps the last four closed candles and their indicator snapshots and
/// checks the pattern rules on every new close.
#[derive(Debug)]
pub struct ThreeBarStrategy {
    id: String,
    config: ThreeBarConfig,
    indicators: IndicatorSet,
    candles: VecDeque<Candle>,
    snaps: VecDeque<IndicatorsSnapshot>,
}

impl ThreeBarStrategy {
    pub fn new(config: ThreeBarConfig) -> Self {
        Self {
            id: format!("three_bar_{}_{}", config.symbol, config.timeframe),
            indicators: IndicatorSet::new(config.indicators),
            candles: VecDeque::with_capacity(WINDOW),
            snaps: VecDeque::with_capacity(WINDOW),
            config,
        }
    }

    pub fn config(&self) -> &ThreeBarConfig {
        &self.config
    }

    /// Snapshot of the most recent closed candle, if any.
    pub fn last_snapshot(&self) -> Option<&IndicatorsSnapshot> {
        self.snaps.back()
    }

    /// Push one closed candle through the indicators and the sliding window.
    fn consume(&mut self, candle: &Candle) {
        let snap = self.indicators.update(candle.high, candle.low, candle.close);
        if self.candles.len() == WINDOW {
            self.candles.pop_front();
            self.snaps.pop_front();
        }
        self.candles.push_back(candle.clone());
        self.snaps.push_back(snap);
    }

    fn evaluate(&mut self, is_live: bool) -> Option<Signal> {
        if self.candles.len() < WINDOW {
            return None;
        }

        let window = self.candles.make_contiguous();
        let snaps = self.snaps.make_contiguous();
        let found = three_bar::detect_pattern(window, snaps, self.config.doji_ratio)?;

        let c4 = &window[WINDOW - 1];
        Some(Signal {
            id: Uuid::new_v4(),
            symbol: self.config.symbol.clone(),
            side: found.side,
            bias: found.bias,
            candle_time: c4.time,
            timeframe: self.config.timeframe,
            entry: Some(c4.close),
            stop_loss: three_bar::pattern_stop(found.side, window),
            take_profit: None,
            atr: snaps[WINDOW - 1].atr,
            is_live,
            strategy_id: self.id.clone(),
        })
    }
}

#[async_trait]
impl Strategy for ThreeBarStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Three-Bar Continuation"
    }

    fn warmup(&mut self, candles: &[Candle]) {
        let symbol = self.config.symbol.clone();
        for candle in candles.iter().filter(|c| c.symbol == symbol) {
            self.consume(candle);
        }
        if let Some(snap) = self.snaps.back() {
            debug!(
                symbol = %self.config.symbol,
                bars = candles.len(),
                ema_in = snap.bars_until_ready_ema200,
                histogram_in = snap.bars_until_ready_histogram,
                "Indicators warmed up"
            );
        }
    }

    async fn on_candle(&mut self, candle: &Candle, is_live: bool) -> Vec<Signal> {
        if candle.symbol != self.config.symbol {
            return Vec::new();
        }

        self.consume(candle);
        let Some(signal) = self.evaluate(is_live) else {
            return Vec::new();
        };

        let freshness = if signal.is_live { "LIVE" } else { "STALE" };
        info!(
            "Signal {} {} at {} ({})",
            signal.side,
            signal.symbol,
            signal.candle_time.format("%Y-%m-%d %H:%M:%S"),
            freshness
        );
        vec![signal]
    }

    fn reset(&mut self) {
        self.indicators.reset();
        self.candles.clear();
        self.snaps.clear();
    }
}
