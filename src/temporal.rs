//! Observation cycles: year / day-of-year keys and processing cadence.

use crate::error::{Error, Result};
use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Gregorian leap year rule.
pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Number of days in `year` (365 or 366).
pub fn days_in_year(year: i32) -> u32 {
    if is_leap_year(year) {
        366
    } else {
        365
    }
}

/// Processing track. Each cadence has its own imagery set and its own status/fact rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Daily,
    Weekly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(Cadence::Daily),
            "weekly" | "week" | "7d" => Ok(Cadence::Weekly),
            other => Err(format!("unknown cadence '{}', expected daily or weekly", other)),
        }
    }
}

/// One observation cycle, identified by year and day-of-year.
///
/// Construction validates the day against the year, so day 366 only exists in leap years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemporalKey {
    year: i32,
    day: u32,
}

impl TemporalKey {
    pub fn new(year: i32, day: u32) -> Result<Self> {
        if day == 0 || day > days_in_year(year) {
            return Err(Error::InvalidTemporalKey { year, day });
        }
        Ok(Self { year, day })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn day(&self) -> u32 {
        self.day
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            day: date.ordinal(),
        }
    }

    /// Calendar date of this key.
    pub fn date(&self) -> Result<NaiveDate> {
        NaiveDate::from_yo_opt(self.year, self.day).ok_or(Error::InvalidTemporalKey {
            year: self.year,
            day: self.day,
        })
    }

    /// The following day, rolling over into the next year after the last day.
    pub fn next(&self) -> Self {
        if self.day < days_in_year(self.year) {
            Self {
                year: self.year,
                day: self.day + 1,
            }
        } else {
            Self {
                year: self.year + 1,
                day: 1,
            }
        }
    }

    /// All keys from `start` to `end`, inclusive. Empty when `start > end`.
    pub fn range(start: TemporalKey, end: TemporalKey) -> Vec<TemporalKey> {
        let mut keys = Vec::new();
        let mut current = start;
        while current <= end {
            keys.push(current);
            current = current.next();
        }
        keys
    }

    /// The seven-day window a weekly composite starting on this key covers.
    pub fn weekly_window(&self) -> Result<(TemporalKey, TemporalKey)> {
        let start = self.date()?;
        let end = start
            .checked_add_days(Days::new(6))
            .ok_or(Error::InvalidTemporalKey {
                year: self.year,
                day: self.day,
            })?;
        Ok((*self, TemporalKey::from_date(end)))
    }

    /// Key a scheduled trigger would pick on `today`.
    ///
    /// Daily runs target the previous day. Weekly runs target the Sunday that closes the
    /// previous week.
    pub fn scheduled(cadence: Cadence, today: NaiveDate) -> Result<Self> {
        let back = match cadence {
            Cadence::Daily => 1,
            Cadence::Weekly => u64::from(today.weekday().num_days_from_monday()) + 1,
        };
        let date = today
            .checked_sub_days(Days::new(back))
            .ok_or_else(|| Error::InvalidTemporalKey {
                year: today.year(),
                day: today.ordinal(),
            })?;
        Ok(Self::from_date(date))
    }
}

impl fmt::Display for TemporalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.year, self.day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leap_years() {
        assert!(is_leap_year(2024));
        assert!(is_leap_year(2000));
        assert!(!is_leap_year(1900));
        assert!(!is_leap_year(2023));
        assert_eq!(days_in_year(2024), 366);
        assert_eq!(days_in_year(2025), 365);
    }

    #[test]
    fn test_day_366_only_in_leap_year() {
        assert!(TemporalKey::new(2024, 366).is_ok());
        assert!(TemporalKey::new(2025, 366).is_err());
        assert!(TemporalKey::new(2025, 0).is_err());
    }

    #[test]
    fn test_range_across_leap_year_end() {
        let start = TemporalKey::new(2024, 366).unwrap();
        let end = TemporalKey::new(2025, 2).unwrap();
        let keys: Vec<String> = TemporalKey::range(start, end)
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(keys, vec!["2024 366", "2025 1", "2025 2"]);
    }

    #[test]
    fn test_range_across_non_leap_year_end() {
        let start = TemporalKey::new(2023, 364).unwrap();
        let end = TemporalKey::new(2024, 1).unwrap();
        let keys = TemporalKey::range(start, end);
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[1], TemporalKey::new(2023, 365).unwrap());
    }

    #[test]
    fn test_empty_range() {
        let start = TemporalKey::new(2024, 10).unwrap();
        let end = TemporalKey::new(2024, 9).unwrap();
        assert!(TemporalKey::range(start, end).is_empty());
    }

    #[test]
    fn test_weekly_window_crosses_year() {
        let key = TemporalKey::new(2023, 362).unwrap();
        let (start, end) = key.weekly_window().unwrap();
        assert_eq!(start, key);
        assert_eq!(end, TemporalKey::new(2024, 3).unwrap());
    }

    #[test]
    fn test_scheduled_keys() {
        // Wednesday 2024-03-06
        let today = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        let daily = TemporalKey::scheduled(Cadence::Daily, today).unwrap();
        assert_eq!(daily, TemporalKey::from_date(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()));

        let weekly = TemporalKey::scheduled(Cadence::Weekly, today).unwrap();
        assert_eq!(weekly, TemporalKey::from_date(NaiveDate::from_ymd_opt(2024, 3, 3).unwrap()));
    }

    #[test]
    fn test_cadence_parse() {
        assert_eq!("daily".parse::<Cadence>().unwrap(), Cadence::Daily);
        assert_eq!("WEEKLY".parse::<Cadence>().unwrap(), Cadence::Weekly);
        assert!("monthly".parse::<Cadence>().is_err());
    }
}
