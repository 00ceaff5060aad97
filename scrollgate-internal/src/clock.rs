//! Wall-clock source shared by the rate limiter, the token ledger and the session cache.
//!
//! Production code uses [`Clock::System`]. Tests construct a [`Clock::Manual`] and move it
//! forward explicitly, which makes window expiry, burst decay and month rollover deterministic.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};

#[derive(Clone, Debug, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn manual(start: DateTime<Utc>) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start.timestamp_millis())))
    }

    pub fn now_millis(&self) -> i64 {
        match self {
            Clock::System => Utc::now().timestamp_millis(),
            Clock::Manual(millis) => millis.load(Ordering::SeqCst),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Manual(millis) => DateTime::from_timestamp_millis(millis.load(Ordering::SeqCst))
                .unwrap_or(DateTime::UNIX_EPOCH),
        }
    }

    /// Moves a manual clock forward. No-op for the system clock.
    pub fn advance(&self, by: Duration) {
        if let Clock::Manual(millis) = self {
            let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
            millis.fetch_add(by, Ordering::SeqCst);
        }
    }

    /// Jumps a manual clock to `to`. No-op for the system clock.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Clock::Manual(millis) = self {
            millis.store(to.timestamp_millis(), Ordering::SeqCst);
        }
    }

    /// Calendar month of the current instant, as `YYYY-MM` in UTC.
    pub fn current_month(&self) -> String {
        calendar_month(self.now())
    }
}

pub fn calendar_month(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// First instant of the calendar month containing `at`.
pub fn month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(at)
}

/// Returns true if `month` is a well-formed `YYYY-MM` calendar month.
pub fn is_valid_month(month: &str) -> bool {
    month.len() == 7 && chrono::NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").is_ok()
}
