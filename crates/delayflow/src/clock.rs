use std::time::Duration;

use chrono::{DateTime, Local, LocalResult, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Which wall clock the process runs its job timestamps on.
///
/// Workers never ask the database for the time; every `run_at`, `locked_at`
/// and expiry comparison uses this process-local clock, so all workers in a
/// fleet must have their clocks synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMode {
    Utc,
    Local,
    Zone(Tz),
}

impl TimeMode {
    /// Accepts `utc`, `local`, or an IANA zone name like `America/Chicago`.
    pub fn parse(value: &str) -> Option<TimeMode> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        if value.eq_ignore_ascii_case("utc") {
            return Some(TimeMode::Utc);
        }
        if value.eq_ignore_ascii_case("local") {
            return Some(TimeMode::Local);
        }
        value.parse::<Tz>().ok().map(TimeMode::Zone)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    mode: TimeMode,
}

impl Clock {
    pub fn new(mode: TimeMode) -> Self {
        Self { mode }
    }

    /// The current instant. All modes agree on it; the mode only governs
    /// how instants are rendered for backends that store naive timestamps.
    pub fn db_time_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Current wall-clock time in the configured zone, truncated to whole
    /// seconds. MySQL `DATETIME` keeps second precision only, so every
    /// value bound on that path goes through this.
    pub fn wall_now(&self) -> NaiveDateTime {
        self.to_wall(self.db_time_now())
    }

    /// Renders an instant as a naive wall-clock value in the configured
    /// zone, truncated to whole seconds.
    pub fn to_wall(&self, at: DateTime<Utc>) -> NaiveDateTime {
        let at = at.with_nanosecond(0).unwrap_or(at);
        match self.mode {
            TimeMode::Utc => at.naive_utc(),
            TimeMode::Local => at.with_timezone(&Local).naive_local(),
            TimeMode::Zone(tz) => at.with_timezone(&tz).naive_local(),
        }
    }

    /// Reads a naive wall-clock value back as an instant. An ambiguous
    /// local time (DST fold) resolves to the earlier instant; a gapped one
    /// falls back to reading the value as UTC.
    pub fn from_wall(&self, wall: NaiveDateTime) -> DateTime<Utc> {
        match self.mode {
            TimeMode::Utc => Utc.from_utc_datetime(&wall),
            TimeMode::Local => resolve(Local.from_local_datetime(&wall), wall),
            TimeMode::Zone(tz) => resolve(tz.from_local_datetime(&wall), wall),
        }
    }
}

fn resolve<Z: TimeZone>(result: LocalResult<DateTime<Z>>, wall: NaiveDateTime) -> DateTime<Utc> {
    match result {
        LocalResult::Single(at) => at.with_timezone(&Utc),
        LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
        LocalResult::None => Utc.from_utc_datetime(&wall),
    }
}

/// `now - max_run_time`, the instant before which a held lock counts as
/// abandoned. Saturates instead of wrapping for absurd lease durations.
pub fn lock_cutoff(now: DateTime<Utc>, max_run_time: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(max_run_time)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_utc_local_and_named_zones() {
        assert_eq!(TimeMode::parse("UTC"), Some(TimeMode::Utc));
        assert_eq!(TimeMode::parse("local"), Some(TimeMode::Local));
        assert_eq!(
            TimeMode::parse("America/Chicago"),
            Some(TimeMode::Zone(chrono_tz::America::Chicago))
        );
        assert_eq!(TimeMode::parse(""), None);
        assert_eq!(TimeMode::parse("Mars/Olympus_Mons"), None);
    }

    #[test]
    fn wall_values_are_whole_seconds() {
        let clock = Clock::new(TimeMode::Utc);
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap()
            + chrono::Duration::milliseconds(789);
        assert_eq!(
            clock.to_wall(at),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap().naive_utc()
        );
    }

    #[test]
    fn wall_round_trips_in_a_named_zone() {
        let clock = Clock::new(TimeMode::Zone(chrono_tz::America::Chicago));
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 18, 0, 0).unwrap();
        let wall = clock.to_wall(at);
        // Chicago is UTC-5 in June.
        assert_eq!(wall.format("%H:%M:%S").to_string(), "13:00:00");
        assert_eq!(clock.from_wall(wall), at);
    }

    #[test]
    fn cutoff_saturates_on_oversized_leases() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            lock_cutoff(now, Duration::from_secs(3600)),
            Utc.with_ymd_and_hms(2023, 12, 31, 23, 0, 0).unwrap()
        );
        assert_eq!(
            lock_cutoff(now, Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MIN_UTC
        );
    }
}
