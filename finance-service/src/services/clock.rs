//! Time source and billing-month arithmetic.

use crate::models::BillingPeriod;
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use std::sync::RwLock;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A settable clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        match self.now.write() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let next = self.now() + by;
        self.set(next);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Maps instants to billing periods in the property's local time.
#[derive(Debug, Clone, Copy)]
pub struct BillingCalendar {
    offset: FixedOffset,
    due_day: u32,
}

impl BillingCalendar {
    /// Offsets outside +/-14h fall back to UTC.
    pub fn new(utc_offset_minutes: i32, due_day: u32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        Self { offset, due_day }
    }

    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    pub fn period_at(&self, at: DateTime<Utc>) -> BillingPeriod {
        BillingPeriod::containing(self.local_date(at))
    }

    /// The instant local midnight on the 1st of `period` begins.
    pub fn period_start(&self, period: BillingPeriod) -> DateTime<Utc> {
        let midnight = period.first_day().and_hms_opt(0, 0, 0).unwrap_or_default();
        self.offset
            .from_local_datetime(&midnight)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    }

    pub fn default_due_date(&self, period: BillingPeriod) -> NaiveDate {
        period.day(self.due_day)
    }
}
