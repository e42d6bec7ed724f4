pub mod clock;
pub mod connection;
pub mod error;
pub mod execution;
pub mod market_watch;
pub mod monitor;
pub mod planner;
pub mod scheduler;
pub mod trader;

pub use clock::SessionWindow;
pub use connection::{connect_with_retry, ReconnectPolicy};
pub use error::EngineError;
pub use execution::{ExecutionConfig, ExecutionOutcome, ExecutionService, NudgePolicy};
pub use market_watch::MarketWatch;
pub use monitor::{CandleMonitor, ClosedCandle};
pub use planner::OrderPlanner;
pub use scheduler::{CandleCloseHandler, Scheduler, Wake};
pub use trader::{LiveTrader, TraderConfig};
