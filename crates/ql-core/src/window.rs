//! Day-of-week and time-of-day windows that gate policies and rules.

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeWindowError {
    #[error("invalid location '{location}': {message}")]
    InvalidLocation { location: String, message: String },
    #[error("invalid time format '{value}' (expected HH:MM)")]
    InvalidTime { value: String },
}

/// A window as written in a policy document.
///
/// `days` entries match a weekday when they are at least three letters long
/// and a case-insensitive prefix of its English name. The time range only
/// applies when both ends are set; `start_time > end_time` wraps midnight.
/// Times are evaluated in `location` (an IANA zone name), or UTC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A [`TimeWindow`] with its zone resolved and times parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledWindow {
    days: Vec<String>,
    range: Option<(u32, u32)>,
    zone: Option<Tz>,
}

const fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn minute_of_day(value: &str) -> Result<u32, TimeWindowError> {
    let time = NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| {
        TimeWindowError::InvalidTime {
            value: value.to_string(),
        }
    })?;
    Ok(time.hour() * 60 + time.minute())
}

impl TimeWindow {
    pub fn compile(&self) -> Result<CompiledWindow, TimeWindowError> {
        let zone = match self.location.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) => Some(name.parse::<Tz>().map_err(|e| {
                TimeWindowError::InvalidLocation {
                    location: name.to_string(),
                    message: e.to_string(),
                }
            })?),
        };

        let range = match (self.start_time.as_deref(), self.end_time.as_deref()) {
            (Some(start), Some(end)) if !start.is_empty() && !end.is_empty() => {
                Some((minute_of_day(start)?, minute_of_day(end)?))
            }
            _ => None,
        };

        let days = self
            .days
            .iter()
            .map(|d| d.trim().to_lowercase())
            .collect();

        Ok(CompiledWindow { days, range, zone })
    }

    /// Compiles and checks the window in one step.
    pub fn matches(&self, at: DateTime<Utc>) -> Result<bool, TimeWindowError> {
        Ok(self.compile()?.matches(at))
    }
}

impl CompiledWindow {
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        let (weekday, minute) = match self.zone {
            Some(zone) => {
                let local = at.with_timezone(&zone);
                (local.weekday(), local.hour() * 60 + local.minute())
            }
            None => (at.weekday(), at.hour() * 60 + at.minute()),
        };

        if !self.days.is_empty() {
            let name = weekday_name(weekday);
            let day_matches = self
                .days
                .iter()
                .any(|d| d.len() >= 3 && name.starts_with(d.as_str()));
            if !day_matches {
                return false;
            }
        }

        match self.range {
            Some((start, end)) if start <= end => minute >= start && minute <= end,
            Some((start, end)) => !(minute < start && minute > end),
            None => true,
        }
    }
}

/// A missing window always matches.
pub fn window_matches(window: Option<&CompiledWindow>, at: DateTime<Utc>) -> bool {
    window.is_none_or(|w| w.matches(at))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        // January 6th 2025 is a Monday.
        Utc.with_ymd_and_hms(2025, 1, day, hour, minute, 0).unwrap()
    }

    fn window(days: &[&str], start: Option<&str>, end: Option<&str>) -> TimeWindow {
        TimeWindow {
            days: days.iter().map(ToString::to_string).collect(),
            start_time: start.map(Into::into),
            end_time: end.map(Into::into),
            location: None,
        }
    }

    #[test]
    fn day_prefix_matches_case_insensitively() {
        let w = window(&["Mon"], None, None);
        assert!(w.matches(at(6, 12, 0)).unwrap());
        assert!(!w.matches(at(7, 12, 0)).unwrap());

        let w = window(&[" MONDAY ", "wed"], None, None);
        assert!(w.matches(at(6, 12, 0)).unwrap());
        assert!(w.matches(at(8, 12, 0)).unwrap());
        assert!(!w.matches(at(9, 12, 0)).unwrap());
    }

    #[test]
    fn short_day_names_never_match() {
        let w = window(&["mo"], None, None);
        assert!(!w.matches(at(6, 12, 0)).unwrap());
    }

    #[test]
    fn normal_range_is_inclusive() {
        let w = window(&[], Some("09:00"), Some("17:00"));
        assert!(w.matches(at(6, 9, 0)).unwrap());
        assert!(w.matches(at(6, 17, 0)).unwrap());
        assert!(!w.matches(at(6, 17, 1)).unwrap());
        assert!(!w.matches(at(6, 8, 59)).unwrap());
    }

    #[test]
    fn cross_midnight_range() {
        let w = window(&[], Some("22:00"), Some("06:00"));
        assert!(w.matches(at(6, 23, 0)).unwrap());
        assert!(w.matches(at(6, 4, 0)).unwrap());
        assert!(!w.matches(at(6, 12, 0)).unwrap());
    }

    #[test]
    fn half_open_range_is_ignored() {
        let w = window(&[], Some("22:00"), None);
        assert!(w.matches(at(6, 12, 0)).unwrap());
    }

    #[test]
    fn location_shifts_the_clock() {
        // 03:00 UTC on Tuesday is 22:00 Monday in New York.
        let w = TimeWindow {
            location: Some("America/New_York".into()),
            ..window(&["mon"], Some("21:00"), Some("23:00"))
        };
        assert!(w.matches(at(7, 3, 0)).unwrap());
        assert!(!w.matches(at(6, 22, 0)).unwrap());
    }

    #[test]
    fn invalid_location_is_an_error() {
        let w = TimeWindow {
            location: Some("Mars/Olympus_Mons".into()),
            ..TimeWindow::default()
        };
        assert!(matches!(
            w.matches(at(6, 12, 0)),
            Err(TimeWindowError::InvalidLocation { .. })
        ));
    }

    #[test]
    fn invalid_time_is_an_error() {
        let w = window(&[], Some("25:99"), Some("06:00"));
        assert_eq!(
            w.matches(at(6, 12, 0)).unwrap_err(),
            TimeWindowError::InvalidTime {
                value: "25:99".into()
            }
        );
    }

    #[test]
    fn missing_window_matches() {
        assert!(window_matches(None, at(6, 12, 0)));
    }
}
