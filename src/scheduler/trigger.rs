//! Trigger kinds and their next-fire computation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone};

use super::cron::CronExpr;

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Every period, starting one period after installation.
    Interval(Duration),
    /// Once per day at a local wall-clock time.
    Daily(NaiveTime),
    /// Per a five-field cron expression, in local time.
    Cron(CronExpr),
}

impl Trigger {
    /// Next wall-clock firing strictly after `after`. Interval triggers are
    /// driven by the runtime timer instead and return `None`.
    pub fn next_wall_clock<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match self {
            Trigger::Interval(_) => None,
            Trigger::Daily(time) => next_daily_after(after, *time),
            Trigger::Cron(cron) => cron.next_after(after),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval(every) => write!(f, "every {:?}", every),
            Trigger::Daily(time) => write!(f, "daily at {}", time.format("%H:%M")),
            Trigger::Cron(cron) => write!(f, "cron '{}'", cron),
        }
    }
}

/// Parse a strict `HH:MM` time of day.
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

/// The next occurrence of `time` strictly after `after`. A day on which the
/// local time does not exist (DST gap) is skipped.
pub fn next_daily_after<Tz: TimeZone>(after: &DateTime<Tz>, time: NaiveTime) -> Option<DateTime<Tz>> {
    let tz = after.timezone();
    let mut date = after.date_naive();
    for _ in 0..3 {
        if let Some(candidate) = tz.from_local_datetime(&date.and_time(time)).earliest() {
            if candidate > *after {
                return Some(candidate);
            }
        }
        date = date.succ_opt()?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("08:30"), NaiveTime::from_hms_opt(8, 30, 0));
        assert_eq!(parse_time_of_day("8:05"), NaiveTime::from_hms_opt(8, 5, 0));
        assert_eq!(parse_time_of_day(" 23:59 "), NaiveTime::from_hms_opt(23, 59, 0));
        for bad in ["24:00", "12:60", "1230", "12:3", "-1:30", "ab:cd", "", "123:00", "+1:30"] {
            assert_eq!(parse_time_of_day(bad), None, "{bad}");
        }
    }

    #[test]
    fn test_next_daily_same_day_and_rollover() {
        let time = NaiveTime::from_hms_opt(8, 0, 0).unwrap();

        let before = Utc.with_ymd_and_hms(2024, 5, 1, 7, 59, 0).unwrap();
        assert_eq!(
            next_daily_after(&before, time),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap())
        );

        // Exactly at the firing time: the next one is tomorrow.
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        assert_eq!(
            next_daily_after(&at, time),
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_interval_has_no_wall_clock() {
        let trigger = Trigger::Interval(Duration::from_secs(60));
        assert_eq!(trigger.next_wall_clock(&Utc::now()), None);
        assert_eq!(trigger.to_string(), "every 60s");
    }

    #[test]
    fn test_display() {
        let daily = Trigger::Daily(NaiveTime::from_hms_opt(6, 5, 0).unwrap());
        assert_eq!(daily.to_string(), "daily at 06:05");
        let cron = Trigger::Cron(CronExpr::parse("0 */3 * * *").unwrap());
        assert_eq!(cron.to_string(), "cron '0 */3 * * *'");
    }
}
