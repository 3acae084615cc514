//! Router probe schedules and their textual encoding.
//!
//! Encoding: `daily:HH:MM[,HH:MM...]`, `interval:<N><s|m|h>`, `cron:<expr>`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::{parse_time_of_day, CronError, CronExpr, Trigger};

/// Upper bound on time-of-day entries in one daily schedule.
pub const MAX_DAILY_TIMES: usize = 24;

/// Schedule validation and parse errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("interval must be greater than zero")]
    InvalidInterval,
    #[error("daily schedule needs at least one time")]
    EmptyDaily,
    #[error("daily schedule has {0} times, at most 24 allowed")]
    TooManyDailyTimes(usize),
    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("cron expression is empty")]
    EmptyCron,
    #[error("invalid cron expression '{expr}': {source}")]
    InvalidCron {
        expr: String,
        #[source]
        source: CronError,
    },
    #[error("malformed schedule '{0}'")]
    Malformed(String),
}

/// When a router's probes run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScheduleSpec {
    Interval(Duration),
    Daily(BTreeSet<NaiveTime>),
    Cron(String),
}

impl ScheduleSpec {
    pub fn daily<I, S>(times: I) -> Result<Self, ScheduleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let times = times
            .into_iter()
            .map(|t| {
                let t = t.as_ref();
                parse_time_of_day(t).ok_or_else(|| ScheduleError::InvalidTime(t.to_string()))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        let spec = ScheduleSpec::Daily(times);
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.triggers().map(|_| ())
    }

    /// Validate and expand into scheduler triggers, one per daily time.
    pub fn triggers(&self) -> Result<Vec<Trigger>, ScheduleError> {
        match self {
            ScheduleSpec::Interval(every) => {
                if every.is_zero() {
                    return Err(ScheduleError::InvalidInterval);
                }
                Ok(vec![Trigger::Interval(*every)])
            }
            ScheduleSpec::Daily(times) => {
                if times.is_empty() {
                    return Err(ScheduleError::EmptyDaily);
                }
                if times.len() > MAX_DAILY_TIMES {
                    return Err(ScheduleError::TooManyDailyTimes(times.len()));
                }
                Ok(times.iter().copied().map(Trigger::Daily).collect())
            }
            ScheduleSpec::Cron(expr) => {
                if expr.trim().is_empty() {
                    return Err(ScheduleError::EmptyCron);
                }
                let cron = CronExpr::parse(expr).map_err(|source| ScheduleError::InvalidCron {
                    expr: expr.clone(),
                    source,
                })?;
                Ok(vec![Trigger::Cron(cron)])
            }
        }
    }
}

impl FromStr for ScheduleSpec {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ScheduleError::Malformed(s.to_string());
        let (kind, rest) = s.trim().split_once(':').ok_or_else(malformed)?;
        let rest = rest.trim();

        let spec = match kind.trim().to_ascii_lowercase().as_str() {
            "daily" => ScheduleSpec::Daily(
                rest.split(',')
                    .map(|t| parse_time_of_day(t).ok_or_else(|| ScheduleError::InvalidTime(t.trim().to_string())))
                    .collect::<Result<_, _>>()?,
            ),
            "interval" => ScheduleSpec::Interval(parse_interval(rest).ok_or_else(malformed)?),
            "cron" => ScheduleSpec::Cron(rest.split_whitespace().collect::<Vec<_>>().join(" ")),
            _ => return Err(malformed()),
        };
        spec.validate()?;
        Ok(spec)
    }
}

fn parse_interval(s: &str) -> Option<Duration> {
    let unit = s.chars().last()?;
    let multiplier = match unit.to_ascii_lowercase() {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        _ => return None,
    };
    let digits = &s[..s.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    Some(Duration::from_secs(n.checked_mul(multiplier)?))
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Interval(every) => {
                let secs = every.as_secs();
                if secs > 0 && secs % 3600 == 0 {
                    write!(f, "interval:{}h", secs / 3600)
                } else if secs > 0 && secs % 60 == 0 {
                    write!(f, "interval:{}m", secs / 60)
                } else {
                    write!(f, "interval:{}s", secs)
                }
            }
            ScheduleSpec::Daily(times) => {
                let times: Vec<String> = times.iter().map(|t| t.format("%H:%M").to_string()).collect();
                write!(f, "daily:{}", times.join(","))
            }
            ScheduleSpec::Cron(expr) => write!(f, "cron:{}", expr),
        }
    }
}

impl TryFrom<String> for ScheduleSpec {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScheduleSpec> for String {
    fn from(spec: ScheduleSpec) -> Self {
        spec.to_string()
    }
}
