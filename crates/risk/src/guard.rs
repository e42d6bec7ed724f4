use chrono::{DateTime, Duration, Utc};
use mt5bot_core::RiskDecision;
use tracing::info;

/// Allows at most one open position per symbol and optionally blocks new
/// entries for a while after a position closes.
///
/// The freeze timestamp lives in memory only and is lost on restart.
#[derive(Debug, Clone, Default)]
pub struct PositionGuard {
    freeze: Option<Duration>,
    last_closed_at: Option<DateTime<Utc>>,
}

impl PositionGuard {
    pub fn new(freeze: Option<Duration>) -> Self {
        Self {
            freeze,
            last_closed_at: None,
        }
    }

    /// Freeze window given in (fractional) hours. Non-positive or NaN
    /// disables it; anything beyond chrono's range freezes indefinitely.
    pub fn with_freeze_hours(hours: Option<f64>) -> Self {
        let freeze = hours.filter(|h| *h > 0.0).map(|h| {
            Duration::try_milliseconds((h * 3_600_000.0).round() as i64).unwrap_or(Duration::MAX)
        });
        Self::new(freeze)
    }

    pub fn freeze(&self) -> Option<Duration> {
        self.freeze
    }

    pub fn last_closed_at(&self) -> Option<DateTime<Utc>> {
        self.last_closed_at
    }

    /// End of the freeze window. `Some(None)` means the window runs past
    /// the representable range.
    fn freeze_until(&self) -> Option<Option<DateTime<Utc>>> {
        let (freeze, closed) = self.freeze.zip(self.last_closed_at)?;
        Some(closed.checked_add_signed(freeze))
    }

    pub fn is_in_freeze(&self, now: DateTime<Utc>) -> bool {
        match self.freeze_until() {
            Some(Some(until)) => now < until,
            Some(None) => true,
            None => false,
        }
    }

    /// Start the freeze window at `closed_at`.
    pub fn mark_position_closed(&mut self, closed_at: DateTime<Utc>) {
        info!(closed_at = %closed_at, "Position closed");
        self.last_closed_at = Some(closed_at);
    }

    /// Pre-trade check given the number of positions currently open on the
    /// symbol.
    pub fn evaluate(&self, open_positions: usize, now: DateTime<Utc>) -> RiskDecision {
        if open_positions > 0 {
            return RiskDecision::Rejected(format!(
                "{} position(s) already open",
                open_positions
            ));
        }
        if self.is_in_freeze(now) {
            let until = match self.freeze_until() {
                Some(Some(until)) => until.to_rfc3339(),
                _ => "further notice".to_string(),
            };
            return RiskDecision::Rejected(format!("In freeze window until {}", until));
        }
        RiskDecision::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_open_position_blocks_entry() {
        let guard = PositionGuard::default();
        assert!(matches!(guard.evaluate(1, t(10, 0)), RiskDecision::Rejected(_)));
        assert_eq!(guard.evaluate(0, t(10, 0)), RiskDecision::Approved);
    }

    #[test]
    fn test_freeze_starts_after_close() {
        let mut guard = PositionGuard::with_freeze_hours(Some(1.5));
        assert!(!guard.is_in_freeze(t(10, 0)));

        guard.mark_position_closed(t(10, 0));
        assert!(guard.is_in_freeze(t(11, 29)));
        assert!(matches!(guard.evaluate(0, t(11, 0)), RiskDecision::Rejected(_)));
        assert!(!guard.is_in_freeze(t(11, 30)));
        assert_eq!(guard.evaluate(0, t(11, 30)), RiskDecision::Approved);
    }

    #[test]
    fn test_no_freeze_configured() {
        let mut guard = PositionGuard::with_freeze_hours(None);
        guard.mark_position_closed(t(10, 0));
        assert!(!guard.is_in_freeze(t(10, 1)));
        assert!(PositionGuard::with_freeze_hours(Some(0.0)).freeze().is_none());
        assert!(PositionGuard::with_freeze_hours(Some(f64::NAN)).freeze().is_none());
    }

    #[test]
    fn test_huge_freeze_blocks_without_overflow() {
        for hours in [1e12, f64::INFINITY] {
            let mut guard = PositionGuard::with_freeze_hours(Some(hours));
            guard.mark_position_closed(t(10, 0));
            assert!(guard.is_in_freeze(t(23, 59)));
            match guard.evaluate(0, t(12, 0)) {
                RiskDecision::Rejected(reason) => assert!(reason.contains("freeze")),
                other => panic!("expected rejection, got {:?}", other),
            }
        }
    }
}
