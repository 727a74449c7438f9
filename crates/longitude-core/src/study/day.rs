//! Study-day arithmetic.
//!
//! A study day runs from `cutoff_hour` local time to `cutoff_hour` the next
//! day. Readings before the cutoff belong to the previous calendar date.
//! Both endpoints of a day difference are normalized the same way, so the
//! result only changes when a cutoff boundary is crossed.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

use crate::clock::Clock;

/// Returned by [`experiment_day`] when there is no start date.
/// Negative days are invalid, never "the day before day 0".
pub const NO_ACTIVE_STUDY_DAY: i64 = -1;

/// Calendar date a local reading belongs to, given the cutoff hour.
pub fn normalized_day(local: NaiveDateTime, cutoff_hour: u32) -> NaiveDate {
    let date = local.date();
    if local.hour() < cutoff_hour {
        date.pred_opt().unwrap_or(date)
    } else {
        date
    }
}

/// Whole study days from `start` to `now`, both local readings.
pub fn days_between(start: NaiveDateTime, now: NaiveDateTime, cutoff_hour: u32) -> i64 {
    (normalized_day(now, cutoff_hour) - normalized_day(start, cutoff_hour)).num_days()
}

/// Current study day, or [`NO_ACTIVE_STUDY_DAY`] without a start date.
pub fn experiment_day(start: Option<DateTime<Utc>>, clock: &dyn Clock, cutoff_hour: u32) -> i64 {
    experiment_day_at(start, clock.now(), clock, cutoff_hour)
}

/// Study day at `now` for a study started at `start`.
pub fn experiment_day_at(
    start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    clock: &dyn Clock,
    cutoff_hour: u32,
) -> i64 {
    match start {
        Some(start) => days_between(clock.to_local(start), clock.to_local(now), cutoff_hour),
        None => NO_ACTIVE_STUDY_DAY,
    }
}

/// Whether `instant` falls on the current study day.
pub fn happened_today(instant: DateTime<Utc>, clock: &dyn Clock, cutoff_hour: u32) -> bool {
    experiment_day(Some(instant), clock, cutoff_hour) == 0
}

/// The next local `cutoff_hour:00` strictly after `local_now`.
pub fn next_cutoff_after(local_now: NaiveDateTime, cutoff_hour: u32) -> NaiveDateTime {
    let cutoff = NaiveTime::from_hms_opt(cutoff_hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = local_now.date().and_time(cutoff);
    if local_now >= today {
        today
            .checked_add_days(Days::new(1))
            .unwrap_or(today)
    } else {
        today
    }
}
