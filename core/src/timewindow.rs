//! Local-calendar windows expressed as UTC query bounds.
//!
//! Every day boundary is computed in the user's stored IANA zone, never in
//! the server's local zone.

use chrono::{DateTime, Days, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::models::DEFAULT_TIMEZONE;

pub const DEFAULT_TZ: Tz = chrono_tz::America::New_York;

/// About a century.
pub const MAX_LOOKBACK_DAYS: u32 = 36_525;

/// Resolve a stored zone name, falling back to [`DEFAULT_TZ`].
#[must_use]
pub fn resolve_tz(name: Option<&str>) -> Tz {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(n) => n.parse::<Tz>().unwrap_or_else(|_| {
            tracing::warn!("invalid time zone '{n}', using {DEFAULT_TIMEZONE}");
            DEFAULT_TZ
        }),
        None => DEFAULT_TZ,
    }
}

/// UTC instant of local midnight starting `day`. A midnight inside a DST gap
/// resolves to the first valid local instant after it.
#[must_use]
pub fn local_midnight(tz: Tz, day: NaiveDate) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::MIN);
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return dt.with_timezone(&Utc);
    }
    (1..=4)
        .filter_map(|h| {
            tz.from_local_datetime(&(naive + Duration::hours(h)))
                .earliest()
        })
        .next()
        .map_or_else(|| Utc.from_utc_datetime(&naive), |dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    tz: Tz,
}

impl TimeWindow {
    #[must_use]
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    #[must_use]
    pub fn from_name(name: Option<&str>) -> Self {
        Self::new(resolve_tz(name))
    }

    #[must_use]
    pub fn tz(&self) -> Tz {
        self.tz
    }

    #[must_use]
    pub fn local_day(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    #[must_use]
    pub fn local_time(&self, instant: DateTime<Utc>) -> NaiveTime {
        instant.with_timezone(&self.tz).time()
    }

    /// `[local midnight, next local midnight)` for `day`, in UTC.
    #[must_use]
    pub fn day_bounds(&self, day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let next = day.succ_opt().unwrap_or(day);
        (local_midnight(self.tz, day), local_midnight(self.tz, next))
    }

    /// From local midnight `days_back` days before today, up to `now`.
    /// Lookback is capped at [`MAX_LOOKBACK_DAYS`].
    #[must_use]
    pub fn window_bounds(&self, days_back: u32, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let today = self.local_day(now);
        let days_back = days_back.min(MAX_LOOKBACK_DAYS);
        let start_day = today
            .checked_sub_days(Days::new(u64::from(days_back)))
            .unwrap_or(today);
        (local_midnight(self.tz, start_day), now)
    }

    /// Rolling window of the last `hours`, ignoring calendar days.
    #[must_use]
    pub fn rolling_since(&self, hours: u32, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - Duration::hours(i64::from(hours)), now)
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::new(DEFAULT_TZ)
    }
}
