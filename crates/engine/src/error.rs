use mt5bot_core::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("Gave up connecting after {attempts} attempt(s): {last}")]
    ReconnectExhausted { attempts: u32, last: BrokerError },
    #[error("Unsupported timeframe for scheduling: {0}")]
    UnsupportedTimeframe(String),
    #[error("Trader is not bootstrapped")]
    NotBootstrapped,
    #[error("Event channel closed")]
    ChannelClosed,
}

impl EngineError {
    /// Whether the underlying broker link is gone.
    pub fn is_connection_error(&self) -> bool {
        match self {
            EngineError::Broker(e) => e.is_connection_error(),
            EngineError::ReconnectExhausted { .. } => true,
            _ => false,
        }
    }
}
