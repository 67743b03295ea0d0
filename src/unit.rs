//! Time units for limit definitions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const NAMED_UNITS: &[(u64, &[&str])] = &[
    (1, &["second", "seconds", "secs", "sec", "s"]),
    (60, &["minute", "minutes", "mins", "min", "m"]),
    (60 * 60, &["hour", "hours", "hrs", "hr", "h"]),
    (60 * 60 * 24, &["day", "days", "d"]),
];

/// Error returned when a unit cannot be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    #[error("unknown unit {0:?}")]
    Unknown(String),
    #[error("unit must be a positive number of seconds")]
    NotPositive,
}

/// The window over which a limit's `value` is counted.
///
/// Accepts the recognized names (`second`, `minute`, `hour`, `day`, plus common
/// abbreviations) or a bare positive integer number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeUnit(u64);

impl TimeUnit {
    pub const SECOND: TimeUnit = TimeUnit(1);
    pub const MINUTE: TimeUnit = TimeUnit(60);
    pub const HOUR: TimeUnit = TimeUnit(60 * 60);
    pub const DAY: TimeUnit = TimeUnit(60 * 60 * 24);

    /// Build a unit from a number of seconds.
    pub fn from_secs(secs: u64) -> Result<Self, UnitError> {
        if secs == 0 {
            return Err(UnitError::NotPositive);
        }
        Ok(Self(secs))
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl FromStr for TimeUnit {
    type Err = UnitError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            let secs = raw.parse::<u64>().map_err(|_| UnitError::Unknown(raw.to_string()))?;
            return Self::from_secs(secs);
        }
        let lowered = raw.to_ascii_lowercase();
        NAMED_UNITS
            .iter()
            .find(|(_, names)| names.contains(&lowered.as_str()))
            .map(|(secs, _)| TimeUnit(*secs))
            .ok_or_else(|| UnitError::Unknown(raw.to_string()))
    }
}

impl fmt::Display for TimeUnit {
    /// Canonical name when one exists, else the number of seconds.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NAMED_UNITS.iter().find(|(secs, _)| *secs == self.0) {
            Some((_, names)) => f.write_str(names[0]),
            None => write!(f, "{}", self.0),
        }
    }
}
