//! Local-day arithmetic for the lifecycle run.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::Ms;

/// Resolve local midnight of `date` in `tz`. When midnight is skipped by a
/// DST jump, the first valid instant of the day is used.
fn local_midnight(date: NaiveDate, tz: Tz) -> Option<DateTime<Tz>> {
    let mut wall = date.and_time(NaiveTime::MIN);
    for _ in 0..4 {
        if let Some(t) = wall.and_local_timezone(tz).earliest() {
            return Some(t);
        }
        wall += chrono::Duration::minutes(30);
    }
    None
}

/// Instant at which the local day containing `now` began, as Unix ms.
pub fn start_of_local_day(now: Ms, tz: Tz) -> Ms {
    let Some(utc) = Utc.timestamp_millis_opt(now).single() else {
        return now;
    };
    let today = utc.with_timezone(&tz).date_naive();
    match local_midnight(today, tz) {
        Some(t) => t.timestamp_millis(),
        None => {
            tracing::error!(%tz, %today, "cannot resolve local midnight, using current time");
            now
        }
    }
}

/// Time left until the next local midnight after `now`. Never zero.
pub fn duration_until_next_midnight(now: DateTime<Utc>, tz: Tz) -> Duration {
    let local = now.with_timezone(&tz);
    let tomorrow = local.date_naive() + chrono::Duration::days(1);
    let target = local_midnight(tomorrow, tz).unwrap_or_else(|| {
        tracing::error!(%tz, "cannot resolve next local midnight, retrying in an hour");
        local + chrono::Duration::hours(1)
    });
    let left = target.signed_duration_since(local);
    if left.num_milliseconds() <= 0 {
        Duration::from_secs(60)
    } else {
        left.to_std().unwrap_or(Duration::from_secs(60))
    }
}
