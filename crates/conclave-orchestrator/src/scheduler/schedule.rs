use chrono::{DateTime, Utc};
use conclave_core::{ConclaveError, ConclaveResult};
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 86_400);

/// When a job fires: a cron expression or a fixed interval.
///
/// Serialized as the source string it was parsed from.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron {
        source: String,
        schedule: Box<cron::Schedule>,
    },
    Interval {
        source: String,
        every: Duration,
    },
}

impl Schedule {
    /// Parse `"@every 30m"`, `"every 90s"`, a 5-field cron expression
    /// (seconds field implied), or a 6-/7-field cron expression.
    pub fn parse(raw: &str) -> ConclaveResult<Self> {
        let source = raw.trim().to_string();
        let lower = source.to_ascii_lowercase();
        if let Some(rest) = lower
            .strip_prefix("@every ")
            .or_else(|| lower.strip_prefix("every "))
        {
            let every = parse_interval(rest.trim())?;
            return Ok(Schedule::Interval { source, every });
        }

        let expression = match source.split_whitespace().count() {
            _ if source.starts_with('@') => source.clone(),
            5 => crontab_to_cron(&source)?,
            6 | 7 => source.clone(),
            n => {
                return Err(ConclaveError::Config(format!(
                    "Invalid schedule '{source}': expected 5, 6 or 7 cron fields, got {n}"
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&expression).map_err(|e| {
            ConclaveError::Config(format!("Invalid cron expression '{source}': {e}"))
        })?;
        Ok(Schedule::Cron {
            source,
            schedule: Box::new(schedule),
        })
    }

    pub fn source(&self) -> &str {
        match self {
            Schedule::Cron { source, .. } | Schedule::Interval { source, .. } => source,
        }
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { schedule, .. } => schedule.after(&after).next(),
            Schedule::Interval { every, .. } => {
                chrono::Duration::from_std(*every)
                    .ok()
                    .and_then(|d| after.checked_add_signed(d))
            }
        }
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.source() == other.source()
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.source())
    }
}

impl serde::Serialize for Schedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.source())
    }
}

impl<'de> serde::Deserialize<'de> for Schedule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Schedule::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// `"90s"`, `"30m"`, `"2h"`, `"1d"`, or bare seconds.
fn parse_interval(raw: &str) -> ConclaveResult<Duration> {
    let invalid = || ConclaveError::Config(format!("Invalid interval '{raw}'"));
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let multiplier = match unit.trim() {
        "s" | "sec" | "secs" => 1,
        "m" | "min" | "mins" => 60,
        "h" | "hr" | "hrs" => 3_600,
        "d" | "day" | "days" => 86_400,
        _ => return Err(invalid()),
    };
    if value == 0 {
        return Err(ConclaveError::Config(format!(
            "Interval '{raw}' must be greater than zero"
        )));
    }
    let every = value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .filter(|every| *every <= MAX_INTERVAL)
        .ok_or_else(|| {
            ConclaveError::Config(format!(
                "Interval '{raw}' exceeds the maximum of {} days",
                MAX_INTERVAL.as_secs() / 86_400
            ))
        })?;
    Ok(every)
}

/// Crontab `min hour dom month dow` to the seconds-first form. Crontab
/// weekdays run 0-7 with Sunday as 0 and 7; the cron crate counts 1-7 from
/// Sunday.
fn crontab_to_cron(source: &str) -> ConclaveResult<String> {
    let fields: Vec<&str> = source.split_whitespace().collect();
    let weekdays = fields[4]
        .split(',')
        .map(|item| crontab_weekday_item(source, item))
        .collect::<ConclaveResult<Vec<_>>>()?
        .join(",");
    Ok(format!(
        "0 {} {} {} {} {weekdays}",
        fields[0], fields[1], fields[2], fields[3]
    ))
}

fn crontab_weekday_item(source: &str, item: &str) -> ConclaveResult<String> {
    let invalid = || ConclaveError::Config(format!("Invalid day of week '{item}' in '{source}'"));
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };
    let shift = |day: &str| -> ConclaveResult<String> {
        if !day.chars().all(|c| c.is_ascii_digit()) {
            // Names and `*` mean the same thing in both dialects.
            return Ok(day.to_string());
        }
        match day.parse::<u8>().map_err(|_| invalid())? {
            day @ 0..=6 => Ok((day + 1).to_string()),
            7 => Ok("1".to_string()),
            _ => Err(invalid()),
        }
    };
    let shifted = match base.split_once('-') {
        // `n-7` ends on Sunday, which wraps to the start of the week.
        Some((start, "7")) if step.is_none() && start != "0" => {
            format!("{}-7,1", shift(start)?)
        }
        Some((_, "7")) if step.is_none() => "*".to_string(),
        Some((_, "7")) => return Err(invalid()),
        Some((start, end)) => format!("{}-{}", shift(start)?, shift(end)?),
        None => shift(base)?,
    };
    Ok(match step {
        Some(step) => format!("{shifted}/{step}"),
        None => shifted,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_interval_forms() {
        let every = Schedule::parse("@every 30m").unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(every.next_after(t0).unwrap(), t0 + chrono::Duration::minutes(30));

        let bare = Schedule::parse("every 90").unwrap();
        assert_eq!(bare.next_after(t0).unwrap(), t0 + chrono::Duration::seconds(90));
    }

    #[test]
    fn test_five_field_cron_is_normalized() {
        let schedule = Schedule::parse("*/5 * * * *").unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 30).unwrap();
        let next = schedule.next_after(t0).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap());
        assert_eq!(schedule.source(), "*/5 * * * *");
    }

    #[test]
    fn test_crontab_weekdays_skip_the_weekend() {
        let saturday = Utc.with_ymd_and_hms(2026, 1, 3, 8, 0, 0).unwrap();
        let weekdays = Schedule::parse("0 7 * * 1-5").unwrap();
        assert_eq!(
            weekdays.next_after(saturday).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 5, 7, 0, 0).unwrap()
        );
        let friday = Utc.with_ymd_and_hms(2026, 1, 9, 8, 0, 0).unwrap();
        assert_eq!(
            weekdays.next_after(friday).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 12, 7, 0, 0).unwrap()
        );

        let sunday = Utc.with_ymd_and_hms(2026, 1, 4, 9, 0, 0).unwrap();
        for source in ["0 9 * * 0", "0 9 * * 7", "0 9 * * Sun"] {
            let schedule = Schedule::parse(source).unwrap();
            assert_eq!(schedule.next_after(saturday).unwrap(), sunday, "{source}");
        }
        let late_saturday = Utc.with_ymd_and_hms(2026, 1, 3, 10, 0, 0).unwrap();
        let weekend = Schedule::parse("0 9 * * 6-7").unwrap();
        assert_eq!(weekend.next_after(late_saturday).unwrap(), sunday);
        assert!(Schedule::parse("0 9 * * 8").is_err());
    }

    #[test]
    fn test_interval_above_maximum_rejected() {
        assert!(Schedule::parse("every 9000000000000s").is_err());
        assert!(Schedule::parse("@every 18446744073709551615d").is_err());
        assert!(Schedule::parse("every 367d").is_err());
        let longest = Schedule::parse("every 366d").unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(longest.next_after(t0).unwrap(), t0 + chrono::Duration::days(366));
        assert!(longest.next_after(DateTime::<Utc>::MAX_UTC).is_none());
    }

    #[test]
    fn test_seven_field_cron() {
        let schedule = Schedule::parse("0 0 12 * * * *").unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(t0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_invalid_schedules() {
        assert!(Schedule::parse("every 0s").is_err());
        assert!(Schedule::parse("every 5 fortnights").is_err());
        assert!(Schedule::parse("* *").is_err());
        assert!(Schedule::parse("99 * * * *").is_err());
    }

    #[test]
    fn test_serde_as_source_string() {
        let schedule = Schedule::parse("@every 2h").unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        assert_eq!(json, "\"@every 2h\"");
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
        assert!(serde_json::from_str::<Schedule>("\"nonsense\"").is_err());
    }
}
