//! Trading session window and candle-close arithmetic in the session's
//! local time.
//!
//! Sessions run Monday to Friday. When `end_hour <= start_hour` the session
//! is overnight: the hours after local midnight up to `end_hour` belong to
//! the previous weekday's session.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Offset, Timelike, Utc};
use mt5bot_core::Timeframe;

/// Active trading hours in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    /// Inclusive local start hour (0-23).
    pub start_hour: u32,
    /// Exclusive local end hour (0-23).
    pub end_hour: u32,
    pub utc_offset_hours: i32,
}

impl Default for SessionWindow {
    fn default() -> Self {
        Self {
            start_hour: 7,
            end_hour: 3,
            utc_offset_hours: 7,
        }
    }
}

impl SessionWindow {
    pub fn new(start_hour: u32, end_hour: u32, utc_offset_hours: i32) -> Self {
        Self {
            start_hour,
            end_hour,
            utc_offset_hours,
        }
    }

    pub fn tz(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    /// Label such as "UTC+07:00" for log lines.
    pub fn tz_label(&self) -> String {
        format!("UTC{}", self.tz())
    }

    pub fn is_overnight(&self) -> bool {
        self.end_hour <= self.start_hour
    }

    pub fn local(&self, dt: DateTime<Utc>) -> DateTime<FixedOffset> {
        dt.with_timezone(&self.tz())
    }

    pub fn in_session(&self, dt: DateTime<Utc>) -> bool {
        let local = self.local(dt);
        let h = local.hour();
        if !self.is_overnight() {
            return is_weekday(&local) && (self.start_hour..self.end_hour).contains(&h);
        }
        if is_weekday(&local) && h >= self.start_hour {
            return true;
        }
        is_weekday(&(local - Duration::days(1))) && h < self.end_hour
    }

    /// Local start of the session containing `dt`, or `None` outside one.
    pub fn session_start_for(&self, dt: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
        if !self.in_session(dt) {
            return None;
        }
        let local = self.local(dt);
        if !self.is_overnight() || local.hour() >= self.start_hour {
            return Some(at_hour(local, self.start_hour));
        }

        let mut prev = local - Duration::days(1);
        while !is_weekday(&prev) {
            prev -= Duration::days(1);
        }
        Some(at_hour(prev, self.start_hour))
    }

    /// Next local session start after `dt`. Inside a session this is the start
    /// of the following one.
    pub fn next_session_start(&self, dt: DateTime<Utc>) -> DateTime<FixedOffset> {
        if let Some(current) = self.session_start_for(dt) {
            return self.next_weekday_start(current);
        }

        let local = self.local(dt);
        let today_start = at_hour(local, self.start_hour);
        if is_weekday(&local) && local < today_start {
            return today_start;
        }
        if self.is_overnight()
            && is_weekday(&local)
            && (self.end_hour..self.start_hour).contains(&local.hour())
        {
            return today_start;
        }
        self.next_weekday_start(local)
    }

    fn next_weekday_start(&self, after: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let mut day = at_hour(after + Duration::days(1), self.start_hour);
        while !is_weekday(&day) {
            day += Duration::days(1);
        }
        day
    }

    /// Next candle boundary strictly after `dt`, aligned to local midnight.
    /// `None` for timeframes without a fixed length.
    pub fn next_aligned_close(
        &self,
        dt: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Option<DateTime<FixedOffset>> {
        let step = timeframe.as_seconds()?;
        let local = self.local(dt);
        let midnight = at_hour(local, 0);
        let elapsed = (local - midnight).num_seconds();
        Some(midnight + Duration::seconds((elapsed / step + 1) * step))
    }
}

fn is_weekday<Tz: chrono::TimeZone>(dt: &DateTime<Tz>) -> bool {
    dt.weekday().num_days_from_monday() < 5
}

/// `dt`'s local date at `hour`:00:00.
fn at_hour(dt: DateTime<FixedOffset>, hour: u32) -> DateTime<FixedOffset> {
    let since_midnight = Duration::seconds(i64::from(dt.num_seconds_from_midnight()))
        + Duration::nanoseconds(i64::from(dt.nanosecond()));
    dt - since_midnight + Duration::hours(i64::from(hour))
}
