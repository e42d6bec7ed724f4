//! Live trading loop for one symbol.
//!
//! Bootstrap connects and warms the strategy up; afterwards every candle
//! close runs: health check, candle monitor, strategy, position guard,
//! order planner, execution.

use crate::connection::{connect_with_retry, ReconnectPolicy};
use crate::error::EngineError;
use crate::execution::{ExecutionOutcome, ExecutionService};
use crate::monitor::CandleMonitor;
use crate::planner::OrderPlanner;
use crate::scheduler::CandleCloseHandler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mt5bot_core::*;
use mt5bot_risk::PositionGuard;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TraderConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Closed bars fed to the strategy before going live.
    pub warmup_bars: usize,
    /// Bars the monitor replays on its first poll when warmup is disabled.
    pub bootstrap_bars: usize,
    pub reconnect: ReconnectPolicy,
}

impl TraderConfig {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            warmup_bars: 300,
            bootstrap_bars: 10,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

pub struct LiveTrader<B, S> {
    config: TraderConfig,
    broker: B,
    strategy: S,
    planner: OrderPlanner,
    execution: ExecutionService,
    guard: PositionGuard,
    monitor: Option<CandleMonitor>,
    meta: Option<SymbolMeta>,
    had_position: bool,
    events: Option<mpsc::Sender<Event>>,
}

impl<B, S> LiveTrader<B, S>
where
    B: Broker,
    S: Strategy,
{
    pub fn new(
        config: TraderConfig,
        broker: B,
        strategy: S,
        planner: OrderPlanner,
        execution: ExecutionService,
        guard: PositionGuard,
    ) -> Self {
        Self {
            config,
            broker,
            strategy,
            planner,
            execution,
            guard,
            monitor: None,
            meta: None,
            had_position: false,
            events: None,
        }
    }

    /// Publish lifecycle, candle, signal and order events on `events`.
    pub fn with_events(mut self, events: mpsc::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn guard(&self) -> &PositionGuard {
        &self.guard
    }

    pub fn symbol_meta(&self) -> Option<&SymbolMeta> {
        self.meta.as_ref()
    }

    pub async fn bootstrap(&mut self) -> Result<SymbolMeta, EngineError> {
        info!("Bootstrapping bot...");
        let symbol = self.config.symbol.clone();
        let timeframe = self.config.timeframe;
        if !timeframe.is_supported() {
            return Err(BrokerError::UnsupportedTimeframe(timeframe.to_string()).into());
        }

        self.emit(Event::System(SystemEvent::Connection(ConnectionState::Connecting)));
        connect_with_retry(&mut self.broker, &self.config.reconnect).await?;
        self.emit(Event::System(SystemEvent::Connection(ConnectionState::Connected)));

        self.broker.ensure_symbol(&symbol).await?;
        let meta = self.broker.symbol_meta(&symbol).await?;
        info!(
            "Symbol ready: {} (digits={}, tick_size={}, tick_value={}, lot_step={}, min_lot={}, stops_level={}, freeze_level={})",
            meta.name,
            meta.digits,
            meta.round_price(meta.tick_size),
            meta.tick_value,
            meta.lot_step,
            meta.min_lot,
            meta.stops_level,
            meta.freeze_level
        );

        self.strategy.on_start().await;
        let mut monitor = CandleMonitor::new(&symbol, timeframe, self.config.bootstrap_bars)?;
        if self.config.warmup_bars > 0 {
            let history = self
                .broker
                .recent_candles(&symbol, timeframe, self.config.warmup_bars)
                .await?;
            info!(bars = history.len(), "Warming up {}", self.strategy.name());
            self.strategy.warmup(&history);
            if let Some(last) = history.last() {
                monitor.prime(last.epoch());
            }
        }
        self.monitor = Some(monitor);

        self.had_position = !self.broker.positions(&symbol).await?.is_empty();
        self.meta = Some(meta.clone());

        info!("Bootstrap complete.");
        self.emit(Event::System(SystemEvent::Started {
            message: format!("{} on {} {}", self.strategy.name(), symbol, timeframe),
        }));
        Ok(meta)
    }

    /// Process everything that closed since the last call.
    pub async fn process_close(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.monitor.is_none() {
            return Err(EngineError::NotBootstrapped);
        }
        self.ensure_healthy().await?;
        self.track_position_close(now).await?;

        let closed = match self.monitor.as_mut() {
            Some(monitor) => monitor.poll(&mut self.broker).await?,
            None => return Err(EngineError::NotBootstrapped),
        };

        for bar in closed {
            self.emit(Event::MarketData(MarketDataEvent::Candle {
                candle: bar.candle.clone(),
                is_live: bar.is_live,
            }));
            let signals = self.strategy.on_candle(&bar.candle, bar.is_live).await;
            for signal in signals {
                self.emit(Event::Signal(signal.clone()));
                if !signal.is_live {
                    debug!(symbol = %signal.symbol, time = %signal.candle_time, "Stale signal not traded");
                    continue;
                }
                self.handle_signal(&signal, now).await?;
            }
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.strategy.on_stop().await;
        self.broker.disconnect().await?;
        info!("Trader stopped");
        self.emit(Event::System(SystemEvent::Stopped {
            message: "shutdown".to_string(),
        }));
        Ok(())
    }

    /// Reconnect when the terminal or its trade server link is gone.
    async fn ensure_healthy(&mut self) -> Result<(), EngineError> {
        let err = match self.broker.health_check().await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_connection_error() => e,
            Err(e) => return Err(e.into()),
        };

        warn!(error = %err, "MT5 health check failed. Reconnecting");
        self.emit(Event::System(SystemEvent::Connection(ConnectionState::Connecting)));
        if let Err(e) = self.broker.disconnect().await {
            debug!(error = %e, "Disconnect before reconnect failed");
        }
        match connect_with_retry(&mut self.broker, &self.config.reconnect).await {
            Ok(()) => {
                self.broker.ensure_symbol(&self.config.symbol).await?;
                self.emit(Event::System(SystemEvent::Connection(ConnectionState::Connected)));
                Ok(())
            }
            Err(e) => {
                self.emit(Event::System(SystemEvent::Connection(ConnectionState::Failed)));
                Err(e)
            }
        }
    }

    /// Start the freeze window when a previously open position is gone.
    async fn track_position_close(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let open = !self.broker.positions(&self.config.symbol).await?.is_empty();
        if self.had_position && !open {
            self.guard.mark_position_closed(now);
            self.emit(Event::System(SystemEvent::Info {
                message: format!("Position on {} closed", self.config.symbol),
            }));
        }
        self.had_position = open;
        Ok(())
    }

    async fn handle_signal(&mut self, signal: &Signal, now: DateTime<Utc>) -> Result<(), EngineError> {
        let open = self.broker.positions(&signal.symbol).await?.len();
        if let RiskDecision::Rejected(reason) = self.guard.evaluate(open, now) {
            info!(symbol = %signal.symbol, %reason, "Signal not traded");
            self.emit_skip(&signal.symbol, reason);
            return Ok(());
        }

        let meta = match &self.meta {
            Some(meta) => meta,
            None => return Err(EngineError::NotBootstrapped),
        };
        let Some(plan) = self.planner.plan(signal, meta) else {
            warn!(symbol = %signal.symbol, "Signal has no stop loss; not traded");
            self.emit_skip(&signal.symbol, "signal has no stop loss".to_string());
            return Ok(());
        };

        match self.execution.execute(&mut self.broker, &plan).await? {
            ExecutionOutcome::Filled(result) => {
                self.had_position = true;
                self.strategy.on_order(&result).await;
                self.emit(Event::Order(OrderEvent::Filled(result)));
            }
            ExecutionOutcome::Rejected(result) => {
                self.strategy.on_order(&result).await;
                self.emit(Event::Order(OrderEvent::Rejected(result)));
            }
            ExecutionOutcome::Skipped(reason) => self.emit_skip(&signal.symbol, reason),
        }
        Ok(())
    }

    fn emit_skip(&self, symbol: &str, reason: String) {
        self.emit(Event::Order(OrderEvent::Skipped {
            symbol: symbol.to_string(),
            reason,
        }));
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                debug!("Event channel full or closed; event dropped");
            }
        }
    }
}

#[async_trait]
impl<B, S> CandleCloseHandler for LiveTrader<B, S>
where
    B: Broker,
    S: Strategy,
{
    async fn on_candle_close(&mut self, close_time: DateTime<Utc>) -> Result<(), EngineError> {
        debug!(close = %close_time, "Candle close");
        self.process_close(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionConfig, NudgePolicy};
    use chrono::TimeZone;
    use mt5bot_brokers_common::SimulatedBroker;
    use mt5bot_risk::PositionSizer;
    use mt5bot_strategies::{ThreeBarConfig, ThreeBarStrategy};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const BASE: i64 = 1_741_000_200;
    const M5: Timeframe = Timeframe::Minute(5);

    /// Emits a BUY signal for every candle it sees.
    #[derive(Default)]
    struct AlwaysBuy {
        warmed: usize,
        orders: usize,
    }

    #[async_trait]
    impl Strategy for AlwaysBuy {
        fn id(&self) -> &str {
            "always_buy"
        }

        fn name(&self) -> &str {
            "Always Buy"
        }

        fn warmup(&mut self, candles: &[Candle]) {
            self.warmed += candles.len();
        }

        async fn on_candle(&mut self, candle: &Candle, is_live: bool) -> Vec<Signal> {
            vec![Signal {
                id: Default::default(),
                symbol: candle.symbol.clone(),
                side: Side::Buy,
                bias: Bias::Bullish,
                candle_time: candle.time,
                timeframe: M5,
                entry: Some(candle.close),
                stop_loss: Some(candle.close - dec!(10)),
                take_profit: None,
                atr: None,
                is_live,
                strategy_id: "always_buy".into(),
            }]
        }

        async fn on_order(&mut self, _result: &OrderResult) {
            self.orders += 1;
        }

        fn reset(&mut self) {}
    }

    fn meta() -> SymbolMeta {
        SymbolMeta {
            name: "XAUUSD".into(),
            digits: 2,
            tick_size: dec!(0.01),
            tick_value: dec!(1),
            lot_step: dec!(0.01),
            min_lot: dec!(0.01),
            max_lot: dec!(100),
            contract_size: dec!(100),
            stops_level: 10,
            freeze_level: 0,
            visible: false,
        }
    }

    fn bar(i: i64) -> Candle {
        let close = dec!(2000) + Decimal::from(i);
        Candle {
            symbol: "XAUUSD".into(),
            time: Utc.timestamp_opt(BASE + i * 300, 0).unwrap(),
            open: close - dec!(1),
            high: close + dec!(1),
            low: close - dec!(2),
            close,
            volume: dec!(100),
        }
    }

    fn broker(bars: i64) -> SimulatedBroker {
        let mut broker = SimulatedBroker::default().with_symbol(meta());
        for i in 0..bars {
            broker.push_candle(M5, bar(i));
        }
        broker.set_quote(Tick {
            symbol: "XAUUSD".into(),
            time: Utc::now(),
            bid: dec!(2100.00),
            ask: dec!(2100.20),
            last: dec!(2100.10),
            volume: dec!(1),
        });
        broker
    }

    fn config(warmup_bars: usize) -> TraderConfig {
        TraderConfig {
            warmup_bars,
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                max_attempts: 3,
            },
            ..TraderConfig::new("XAUUSD", M5)
        }
    }

    fn trader<S: Strategy>(
        broker: SimulatedBroker,
        strategy: S,
        warmup_bars: usize,
        freeze_hours: Option<f64>,
    ) -> LiveTrader<SimulatedBroker, S> {
        LiveTrader::new(
            config(warmup_bars),
            broker,
            strategy,
            OrderPlanner::new(dec!(1.5), dec!(0)),
            ExecutionService::new(
                ExecutionConfig {
                    nudge_policy: NudgePolicy::Conservative,
                    ..ExecutionConfig::default()
                },
                PositionSizer::new(dec!(0.01)),
            ),
            PositionGuard::with_freeze_hours(freeze_hours),
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_bootstrap_connects_selects_and_warms_up() {
        let mut t = trader(broker(50), AlwaysBuy::default(), 30, None);
        let meta = t.bootstrap().await.unwrap();

        assert_eq!(meta.name, "XAUUSD");
        assert!(t.broker().is_connected());
        assert_eq!(t.strategy().warmed, 30);
        // Warmup bars are not replayed as closes
        t.process_close(Utc::now()).await.unwrap();
        assert!(t.broker().sent_orders().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_retries_connection() {
        let mut b = broker(5);
        b.fail_next_connects(2);
        let mut t = trader(b, AlwaysBuy::default(), 5, None);
        t.bootstrap().await.unwrap();
        assert_eq!(t.broker().connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_bootstrap_fails_for_unknown_symbol() {
        let mut t = trader(SimulatedBroker::default(), AlwaysBuy::default(), 5, None);
        let err = t.bootstrap().await.unwrap_err();
        assert!(matches!(err, EngineError::Broker(BrokerError::SymbolNotFound(_))));
    }

    #[tokio::test]
    async fn test_process_before_bootstrap_is_an_error() {
        let mut t = trader(broker(5), AlwaysBuy::default(), 5, None);
        assert!(matches!(
            t.process_close(Utc::now()).await,
            Err(EngineError::NotBootstrapped)
        ));
    }

    #[tokio::test]
    async fn test_live_close_places_one_order() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut t = trader(broker(20), AlwaysBuy::default(), 20, None).with_events(tx);
        t.bootstrap().await.unwrap();
        drain(&mut rx);

        t.broker_mut().push_candle(M5, bar(20));
        t.process_close(Utc::now()).await.unwrap();

        let sent = t.broker().sent_orders();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].side, Side::Buy);
        // Planned SL 2010, entry 2100.20 -> distance 90.20, TP at 1.5R
        assert_eq!(sent[0].stop_loss, dec!(2010.00));
        assert_eq!(sent[0].take_profit, dec!(2235.50));
        assert_eq!(t.strategy().orders, 1);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::MarketData(MarketDataEvent::Candle { is_live: true, .. }))));
        assert!(events.iter().any(|e| matches!(e, Event::Signal(_))));
        assert!(events.iter().any(|e| matches!(e, Event::Order(OrderEvent::Filled(_)))));
    }

    #[tokio::test]
    async fn test_backfilled_signals_are_not_traded_and_guard_blocks_second_entry() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut t = trader(broker(20), AlwaysBuy::default(), 20, None).with_events(tx);
        t.bootstrap().await.unwrap();

        for i in 20..23 {
            t.broker_mut().push_candle(M5, bar(i));
        }
        t.process_close(Utc::now()).await.unwrap();
        // Only the newest of three backfilled bars is live
        assert_eq!(t.broker().sent_orders().len(), 1);

        t.broker_mut().push_candle(M5, bar(23));
        t.process_close(Utc::now()).await.unwrap();
        assert_eq!(t.broker().sent_orders().len(), 1);

        let skipped = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, Event::Order(OrderEvent::Skipped { .. })))
            .count();
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn test_freeze_window_after_position_closes() {
        let mut t = trader(broker(20), AlwaysBuy::default(), 20, Some(2.0));
        t.bootstrap().await.unwrap();

        t.broker_mut().push_candle(M5, bar(20));
        t.process_close(Utc::now()).await.unwrap();
        assert_eq!(t.broker().sent_orders().len(), 1);

        t.broker_mut().close_all_positions();
        t.broker_mut().push_candle(M5, bar(21));
        t.process_close(Utc::now()).await.unwrap();

        assert!(t.guard().last_closed_at().is_some());
        assert_eq!(t.broker().sent_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_when_trade_server_link_is_lost() {
        let mut t = trader(broker(20), AlwaysBuy::default(), 20, None);
        t.bootstrap().await.unwrap();

        t.broker_mut().drop_connection();
        t.broker_mut().push_candle(M5, bar(20));
        t.process_close(Utc::now()).await.unwrap();

        assert!(t.broker().is_connected());
        assert_eq!(t.broker().connect_attempts(), 2);
        assert_eq!(t.broker().sent_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_reports_reconnect_failure() {
        let mut t = trader(broker(20), AlwaysBuy::default(), 20, None);
        t.bootstrap().await.unwrap();

        t.broker_mut().drop_connection();
        t.broker_mut().fail_next_connects(10);
        let err = t.on_candle_close(Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngineError::ReconnectExhausted { .. }));
    }

    #[tokio::test]
    async fn test_three_bar_strategy_warms_up_from_history() {
        let strategy = ThreeBarStrategy::new(ThreeBarConfig::new("XAUUSD", M5));
        let mut t = trader(broker(60), strategy, 60, None);
        t.bootstrap().await.unwrap();

        let snap = t.strategy().last_snapshot().unwrap();
        assert!(snap.macd.is_some());
        assert!(snap.ema200.is_none());
        assert_eq!(snap.bars_until_ready_ema200, 140);
    }
}
