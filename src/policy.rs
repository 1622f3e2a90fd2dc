//! Booking-window policy: weekdays only, within opening hours, never on a
//! blocked calendar date.
//!
//! Everything here is pure. The caller supplies "now" and a blocked-date
//! predicate, so the same rules serve the create paths, the availability
//! search and tests with a fixed clock.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Timelike, Utc, Weekday};

use crate::engine::EngineError;
use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::{Ms, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    /// First hour (local) a reservation may start.
    pub open_hour: u32,
    /// Reservations must end no later than `close_hour:00` (local).
    pub close_hour: u32,
    /// Offset of the lab's local time from UTC.
    pub utc_offset_secs: i32,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            open_hour: 7,
            close_hour: 21,
            utc_offset_secs: 0,
        }
    }
}

impl BookingPolicy {
    pub fn new(open_hour: u32, close_hour: u32, utc_offset_secs: i32) -> Result<Self, String> {
        if open_hour >= close_hour || close_hour > 23 {
            return Err(format!(
                "invalid opening hours {open_hour}:00-{close_hour}:00"
            ));
        }
        if FixedOffset::east_opt(utc_offset_secs).is_none() {
            return Err(format!("invalid utc offset {utc_offset_secs}s"));
        }
        Ok(Self {
            open_hour,
            close_hour,
            utc_offset_secs,
        })
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn local(&self, t: Ms) -> Option<DateTime<FixedOffset>> {
        DateTime::from_timestamp_millis(t).map(|utc| utc.with_timezone(&self.offset()))
    }

    /// Calendar date of `t` in the lab's local time.
    pub fn local_date(&self, t: Ms) -> Option<NaiveDate> {
        self.local(t).map(|dt| dt.date_naive())
    }

    /// Check a requested window. Rejections are `Validation` errors, except
    /// timestamps outside the supported range which are `LimitExceeded`.
    pub fn validate(
        &self,
        span: &Span,
        now: Ms,
        is_blocked: impl Fn(NaiveDate) -> bool,
    ) -> Result<(), EngineError> {
        if span.start >= span.end {
            return Err(EngineError::Validation(
                "start must be before end".into(),
            ));
        }
        if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if span.start < now {
            return Err(EngineError::Validation(
                "reservation cannot start in the past".into(),
            ));
        }

        let (start, end) = match (self.local(span.start), self.local(span.end)) {
            (Some(s), Some(e)) => (s, e),
            _ => return Err(EngineError::LimitExceeded("timestamp out of range")),
        };

        if matches!(start.weekday(), Weekday::Sat | Weekday::Sun) {
            return Err(EngineError::Validation(
                "reservations are only allowed Monday to Friday".into(),
            ));
        }

        let past_closing = end.date_naive() != start.date_naive()
            || end.hour() > self.close_hour
            || (end.hour() == self.close_hour
                && (end.minute() > 0 || end.second() > 0 || end.nanosecond() > 0));
        if start.hour() < self.open_hour || past_closing {
            return Err(EngineError::Validation(format!(
                "reservations are only allowed between {}:00 and {}:00",
                self.open_hour, self.close_hour
            )));
        }

        if is_blocked(start.date_naive()) {
            return Err(EngineError::Validation(format!(
                "{} is blocked by administration",
                start.date_naive()
            )));
        }

        Ok(())
    }
}
