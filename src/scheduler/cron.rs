//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Timelike};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field} field '{value}'")]
    Field { field: &'static str, value: String },
    #[error("expression can never fire")]
    NeverFires,
}

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Days searched ahead before giving up on finding a match.
const SEARCH_HORIZON_DAYS: u32 = 366 * 5;

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    name_offset: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], name_offset: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], name_offset: 0 };
const DAY_OF_MONTH: FieldSpec =
    FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], name_offset: 0 };
const MONTH: FieldSpec =
    FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES, name_offset: 1 };
// 7 is accepted as Sunday and folded onto 0.
const DAY_OF_WEEK: FieldSpec =
    FieldSpec { name: "day-of-week", min: 0, max: 7, names: &DAY_NAMES, name_offset: 0 };

/// A parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        let cron = Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], &MINUTE)?,
            hours: parse_field(fields[1], &HOUR)?,
            days_of_month: parse_field(fields[2], &DAY_OF_MONTH)?,
            months: parse_field(fields[3], &MONTH)?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        };

        if !cron.can_fire() {
            return Err(CronError::NeverFires);
        }
        Ok(cron)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The first matching minute strictly after `after`, in `after`'s zone.
    ///
    /// Local times that do not exist (DST gaps) are skipped; ambiguous ones
    /// resolve to their earliest instant.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let local = after.naive_local();
        let start = local.date().and_hms_opt(local.hour(), local.minute(), 0)?
            + ChronoDuration::minutes(1);

        let mut date = start.date();
        for _ in 0..SEARCH_HORIZON_DAYS {
            if self.matches_date(date) {
                let first_day = date == start.date();
                for hour in bits(self.hours).filter(|h| !first_day || *h >= start.hour()) {
                    let same_hour = first_day && hour == start.hour();
                    for minute in bits(self.minutes).filter(|m| !same_hour || *m >= start.minute()) {
                        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
                        let candidate = tz.from_local_datetime(&date.and_time(time)).earliest();
                        if let Some(candidate) = candidate {
                            if candidate > *after {
                                return Some(candidate);
                            }
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        if self.months & (1 << date.month()) == 0 {
            return false;
        }
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    fn can_fire(&self) -> bool {
        if !self.dom_restricted || self.dow_restricted {
            return true;
        }
        bits(self.months).any(|month| {
            let longest = match month {
                2 => 29,
                4 | 6 | 9 | 11 => 30,
                _ => 31,
            };
            bits(self.days_of_month).any(|day| day <= longest)
        })
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn bits(mask: u64) -> impl Iterator<Item = u32> {
    (0..64u32).filter(move |i| mask & (1 << i) != 0)
}

fn parse_field(value: &str, spec: &FieldSpec) -> Result<u64, CronError> {
    let invalid = || CronError::Field {
        field: spec.name,
        value: value.to_string(),
    };

    let mut mask = 0u64;
    for part in value.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(lo, spec).ok_or_else(invalid)?, parse_value(hi, spec).ok_or_else(invalid)?)
        } else {
            let v = parse_value(range, spec).ok_or_else(invalid)?;
            // `5/15` means "from 5 to the end, every 15".
            if step.is_some() { (v, spec.max) } else { (v, v) }
        };

        if lo > hi || lo < spec.min || hi > spec.max {
            return Err(invalid());
        }

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            mask |= 1 << v;
        }
    }
    Ok(mask)
}

fn parse_value(token: &str, spec: &FieldSpec) -> Option<u32> {
    if let Ok(v) = token.parse::<u32>() {
        return Some(v);
    }
    spec.names
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .map(|idx| idx as u32 + spec.name_offset)
}
