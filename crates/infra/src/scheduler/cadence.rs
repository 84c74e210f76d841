//! Recurrence rules and occurrence arithmetic (pure, no I/O).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use super::ScheduleError;

/// Look-back windows tried, smallest first, when searching the latest cron
/// occurrence. Bounds the work for dense expressions after long outages.
const CRON_SEARCH_WINDOWS: [i64; 5] = [
    60,
    60 * 60,
    24 * 60 * 60,
    32 * 24 * 60 * 60,
    367 * 24 * 60 * 60,
];

/// When a recurring definition fires.
#[derive(Clone)]
pub enum Cadence {
    /// Cron expression (5 fields, or 6/7 with seconds and year)
    Cron {
        expression: String,
        schedule: cron::Schedule,
    },
    /// Fixed interval, aligned to the Unix epoch
    Every(Duration),
}

impl Cadence {
    pub fn cron(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(ScheduleError::InvalidCron {
                    expression: expression.to_string(),
                    reason: format!("expected 5 to 7 fields, found {n}"),
                });
            }
        };

        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Cadence::Cron {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn every(interval: Duration) -> Result<Self, ScheduleError> {
        if interval.as_millis() == 0 {
            return Err(ScheduleError::InvalidInterval);
        }
        Ok(Cadence::Every(interval))
    }

    /// Latest occurrence in `(after, now]`, if any.
    ///
    /// Missed occurrences collapse into this single one.
    pub fn latest_occurrence(
        &self,
        after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if now <= after {
            return None;
        }

        match self {
            Cadence::Every(interval) => {
                let step = interval.as_millis() as i64;
                let now_ms = now.timestamp_millis();
                let latest_ms = now_ms - now_ms.rem_euclid(step);
                (latest_ms > after.timestamp_millis())
                    .then(|| from_millis(latest_ms))
                    .flatten()
            }
            Cadence::Cron { schedule, .. } => {
                for window in CRON_SEARCH_WINDOWS {
                    let start = (now - chrono::Duration::seconds(window)).max(after);
                    if let Some(found) = last_in(schedule, start, now) {
                        return Some(found);
                    }
                    if start == after {
                        return None;
                    }
                }
                last_in(schedule, after, now)
            }
        }
    }
}

/// Next occurrence strictly after `after`.
pub fn next_occurrence(cadence: &Cadence, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match cadence {
        Cadence::Every(interval) => {
            let step = interval.as_millis() as i64;
            let after_ms = after.timestamp_millis();
            from_millis((after_ms.div_euclid(step) + 1) * step)
        }
        Cadence::Cron { schedule, .. } => schedule.after(&after).next(),
    }
}

fn last_in(
    schedule: &cron::Schedule,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule.after(&start).take_while(|t| *t <= now).last()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

impl fmt::Debug for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Cron { expression, .. } => f.debug_tuple("Cron").field(expression).finish(),
            Cadence::Every(interval) => f.debug_tuple("Every").field(interval).finish(),
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Cron { expression, .. } => f.write_str(expression),
            Cadence::Every(interval) => write!(f, "every {interval:?}"),
        }
    }
}
