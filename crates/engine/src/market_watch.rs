use crate::error::EngineError;
use mt5bot_core::{BrokerError, Event, MarketData, MarketDataEvent, Tick};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Polls the live quote of one symbol and reports changes.
#[derive(Debug, Clone)]
pub struct MarketWatch {
    symbol: String,
    interval: Duration,
    last: Option<Tick>,
}

impl MarketWatch {
    pub fn new(symbol: impl Into<String>, interval: Duration) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            last: None,
        }
    }

    pub fn last(&self) -> Option<&Tick> {
        self.last.as_ref()
    }

    /// Fetch the quote once. `Some` only when bid or ask moved.
    pub async fn poll_once<M>(&mut self, market: &mut M) -> Result<Option<Tick>, BrokerError>
    where
        M: MarketData + ?Sized,
    {
        let tick = market.quote(&self.symbol).await?;
        let changed = self
            .last
            .as_ref()
            .map_or(true, |prev| prev.bid != tick.bid || prev.ask != tick.ask);
        if !changed {
            return Ok(None);
        }
        self.last = Some(tick.clone());
        Ok(Some(tick))
    }

    /// Emit a tick event on every quote change until `shutdown` turns true.
    /// Missing quotes are logged and skipped; losing the connection ends the
    /// loop with an error.
    pub async fn run<M>(
        &mut self,
        market: &mut M,
        events: mpsc::Sender<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError>
    where
        M: MarketData + ?Sized,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            match self.poll_once(market).await {
                Ok(Some(tick)) => {
                    debug!(symbol = %tick.symbol, bid = %tick.bid, ask = %tick.ask, "Quote changed");
                    let event = Event::MarketData(MarketDataEvent::Tick(tick));
                    if events.send(event).await.is_err() {
                        return Err(EngineError::ChannelClosed);
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_connection_error() => return Err(e.into()),
                Err(e) => warn!(symbol = %self.symbol, error = %e, "Quote unavailable"),
            }
        }
        Ok(())
    }
}
