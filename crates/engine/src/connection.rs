use crate::error::EngineError;
use mt5bot_core::{BrokerError, ConnectionManager};
use std::time::Duration;
use tracing::{info, warn};

/// Exponential backoff for (re)connecting to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts including the first. 0 retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

/// Connect, retrying with backoff until the policy gives up.
pub async fn connect_with_retry<C>(
    conn: &mut C,
    policy: &ReconnectPolicy,
) -> Result<(), EngineError>
where
    C: ConnectionManager + ?Sized,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let err: BrokerError = match conn.connect().await {
            Ok(()) => {
                if attempts > 1 {
                    info!(attempts, "Reconnected to MT5");
                }
                return Ok(());
            }
            Err(e) => e,
        };

        if policy.exhausted(attempts) {
            return Err(EngineError::ReconnectExhausted {
                attempts,
                last: err,
            });
        }
        let delay = policy.delay_for(attempts - 1);
        warn!(
            attempt = attempts,
            error = %err,
            "Connection attempt failed. Retrying in {:?}",
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mt5bot_brokers_common::SimulatedBroker;

    fn fast() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let mut broker = SimulatedBroker::default();
        broker.fail_next_connects(2);
        connect_with_retry(&mut broker, &fast()).await.unwrap();
        assert!(broker.is_connected());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mut broker = SimulatedBroker::default();
        broker.fail_next_connects(10);
        let err = connect_with_retry(&mut broker, &fast()).await.unwrap_err();
        match err {
            EngineError::ReconnectExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, BrokerError::Platform { code: -10003, .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(broker.connect_attempts(), 3);
    }
}
