use crate::clock::SessionWindow;
use crate::error::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use mt5bot_core::Timeframe;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Receives a callback shortly after every candle close inside the session.
#[async_trait]
pub trait CandleCloseHandler: Send {
    async fn on_candle_close(&mut self, close_time: DateTime<Utc>) -> Result<(), EngineError>;
}

/// What the scheduler waits for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Outside the session: sleep until it starts.
    SessionStart(DateTime<FixedOffset>),
    /// Inside the session: the next candle close and the instant to fire at
    /// (close plus buffer).
    CandleClose {
        close: DateTime<FixedOffset>,
        fire_at: DateTime<FixedOffset>,
    },
}

impl Wake {
    pub fn at(&self) -> DateTime<FixedOffset> {
        match self {
            Wake::SessionStart(at) => *at,
            Wake::CandleClose { fire_at, .. } => *fire_at,
        }
    }
}

/// Drives a [`CandleCloseHandler`] on candle boundaries within a
/// [`SessionWindow`].
#[derive(Debug, Clone)]
pub struct Scheduler {
    window: SessionWindow,
    timeframe: Timeframe,
    close_buffer: Duration,
}

impl Scheduler {
    pub fn new(
        window: SessionWindow,
        timeframe: Timeframe,
        close_buffer: Duration,
    ) -> Result<Self, EngineError> {
        if timeframe.as_seconds().is_none() {
            return Err(EngineError::UnsupportedTimeframe(timeframe.to_string()));
        }
        Ok(Self {
            window,
            timeframe,
            close_buffer,
        })
    }

    pub fn window(&self) -> &SessionWindow {
        &self.window
    }

    pub fn next_wake(&self, now: DateTime<Utc>) -> Result<Wake, EngineError> {
        if !self.window.in_session(now) {
            return Ok(Wake::SessionStart(self.window.next_session_start(now)));
        }
        let close = self
            .window
            .next_aligned_close(now, self.timeframe)
            .ok_or_else(|| EngineError::UnsupportedTimeframe(self.timeframe.to_string()))?;
        let buffer = chrono::Duration::from_std(self.close_buffer)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Ok(Wake::CandleClose {
            close,
            fire_at: close + buffer,
        })
    }

    /// Run until `shutdown` turns true. Handler errors are logged and the
    /// loop carries on with the next candle.
    pub async fn run<H>(
        &self,
        handler: &mut H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError>
    where
        H: CandleCloseHandler + ?Sized,
    {
        info!(
            "Starting scheduler: active Mon to Fri {:02}:00 to {:02}:00 ({})",
            self.window.start_hour,
            self.window.end_hour,
            self.window.tz_label()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            let wake = self.next_wake(now)?;
            if let Wake::SessionStart(at) = wake {
                info!(
                    "Out of session. Sleeping until next session start: {}",
                    at.format("%Y-%m-%d %H:%M:%S %:z")
                );
            }

            let delay = (wake.at().with_timezone(&Utc) - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match wake {
                Wake::SessionStart(at) => {
                    info!(
                        "Start of today's session: {}",
                        at.format("%Y-%m-%d %H:%M:%S %:z")
                    );
                }
                Wake::CandleClose { close, .. } => {
                    if let Err(e) = handler.on_candle_close(close.with_timezone(&Utc)).await {
                        error!("on_candle_close failed: {}", e);
                    }
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }
}
