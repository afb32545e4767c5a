use chrono::{DateTime, Datelike, Duration, FixedOffset, Months, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::model::{Frequency, RetentionTier};

/// A calendar period whose close promotes a backup to the matching tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Day,
    Week,
    Month,
    Year,
}

impl Period {
    /// Largest first, so a backup reaching yearly is not re-examined for
    /// smaller boundaries in the same pass.
    pub const ALL: [Period; 4] = [Period::Year, Period::Month, Period::Week, Period::Day];

    pub fn tier(self) -> RetentionTier {
        match self {
            Period::Day => RetentionTier::Daily,
            Period::Week => RetentionTier::Weekly,
            Period::Month => RetentionTier::Monthly,
            Period::Year => RetentionTier::Yearly,
        }
    }

    pub fn start(self, at: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        match self {
            Period::Day => start_of_day(at),
            Period::Week => start_of_week(at),
            Period::Month => start_of_month(at),
            Period::Year => start_of_year(at),
        }
    }

    /// Start of the period after the one beginning at `start`.
    pub fn next_start(self, start: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let days = match self {
            Period::Day => 1,
            Period::Week => 7,
            Period::Month => 32,
            Period::Year => 366,
        };
        self.start(start + Duration::days(days))
    }

    /// Whether `at` falls inside the last stretch of its period, where the
    /// latest backup is treated as the period's representative.
    pub fn is_closing(self, at: DateTime<FixedOffset>) -> bool {
        match self {
            Period::Day => at.hour() >= 23,
            Period::Week => at.weekday() == Weekday::Sun,
            Period::Month => is_last_day_of_month(at),
            Period::Year => at.month() == 12 && at.day() == 31,
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Period::Day => write!(f, "day"),
            Period::Week => write!(f, "week"),
            Period::Month => write!(f, "month"),
            Period::Year => write!(f, "year"),
        }
    }
}

/// Tier assigned to a backup created at `at`.
pub fn initial_tier(at: DateTime<FixedOffset>) -> RetentionTier {
    Period::ALL
        .into_iter()
        .find(|period| period.is_closing(at))
        .map(Period::tier)
        .unwrap_or(RetentionTier::Hourly)
}

pub fn is_last_day_of_month(at: DateTime<FixedOffset>) -> bool {
    (at + Duration::days(1)).month() != at.month()
}

pub fn start_of_day(at: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    at - Duration::seconds(at.num_seconds_from_midnight() as i64)
        - Duration::nanoseconds(at.nanosecond() as i64)
}

/// Weeks start on Monday.
pub fn start_of_week(at: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    start_of_day(at) - Duration::days(at.weekday().num_days_from_monday() as i64)
}

pub fn start_of_month(at: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    start_of_day(at) - Duration::days(at.day0() as i64)
}

pub fn start_of_year(at: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    start_of_day(at) - Duration::days(at.ordinal0() as i64)
}

/// Records of `tier` created before the returned instant are prunable.
/// `keep` is the number of whole periods retained before the current one.
pub fn prune_cutoff(tier: RetentionTier, now: DateTime<FixedOffset>, keep: u32) -> Option<DateTime<Utc>> {
    let cutoff = match tier {
        RetentionTier::Hourly => Some(start_of_day(now)),
        RetentionTier::Daily => Some(start_of_day(now) - Duration::days(keep as i64)),
        RetentionTier::Weekly => Some(start_of_week(now) - Duration::weeks(keep as i64)),
        RetentionTier::Monthly => start_of_month(now).checked_sub_months(Months::new(keep)),
        RetentionTier::Yearly => start_of_year(now).checked_sub_months(Months::new(keep.saturating_mul(12))),
    };
    cutoff.map(|c| c.with_timezone(&Utc))
}

fn start_of_hour(at: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    at - Duration::seconds((at.minute() * 60 + at.second()) as i64)
        - Duration::nanoseconds(at.nanosecond() as i64)
}

impl Frequency {
    /// First fire time strictly after `after`: on the hour, at hours that are
    /// a multiple of the frequency (00/06/12/18 for `6h`, midnight for `24h`).
    pub fn next_fire(&self, after: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let step = self.hours();
        let mut candidate = start_of_hour(after) + Duration::hours(1);
        while candidate.hour() % step != 0 {
            candidate += Duration::hours(1);
        }
        candidate
    }
}

/// A fixed local time of day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyAt {
    pub hour: u32,
    pub minute: u32,
}

impl Default for DailyAt {
    fn default() -> Self {
        Self { hour: 2, minute: 0 }
    }
}

impl DailyAt {
    pub fn next_fire(&self, after: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let today = start_of_day(after)
            + Duration::hours(self.hour.min(23) as i64)
            + Duration::minutes(self.minute.min(59) as i64);
        if today > after {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

impl std::fmt::Display for DailyAt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}
