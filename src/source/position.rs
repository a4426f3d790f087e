use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PositionError {
    #[error("log position '{0}' is not of the form '<seconds>:<ordinal>'")]
    Format(String),

    #[error("invalid numeric component in log position '{value}': {source}")]
    Number {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// A point in the operation log.
///
/// Positions are (seconds, ordinal) pairs: the wall-clock second the entry
/// was written plus a counter that orders entries written within the same
/// second. Comparison is lexicographic, so the derived `Ord` is the log
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPosition {
    seconds: u32,
    ordinal: u32,
}

impl LogPosition {
    /// Sorts before every real entry; a cursor opened here reads the whole
    /// retained log.
    pub const MIN: LogPosition = LogPosition::new(0, 0);

    pub const fn new(seconds: u32, ordinal: u32) -> Self {
        Self { seconds, ordinal }
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// True when `self` comes strictly later in the log than `other`.
    pub fn is_after(&self, other: &LogPosition) -> bool {
        self > other
    }

    /// Wall-clock time of the entry, if representable.
    pub fn wall_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(i64::from(self.seconds), 0).single()
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds, self.ordinal)
    }
}

impl FromStr for LogPosition {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (secs, ord) = trimmed
            .split_once(':')
            .ok_or_else(|| PositionError::Format(trimmed.to_string()))?;

        let parse = |part: &str| {
            part.parse::<u32>().map_err(|source| PositionError::Number {
                value: trimmed.to_string(),
                source,
            })
        };

        Ok(Self::new(parse(secs)?, parse(ord)?))
    }
}

impl Serialize for LogPosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LogPosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
