//! Time-related facilities.
//!
//! A [`Timeline`] is the single logical time source of the framework: it
//! produces [`Timestamp`]s carrying the UTC and local datetimes along with
//! the number of seconds elapsed since a configurable origin (the Unix epoch
//! by default). All run-control timestamps go through a timeline, so that
//! tests can pin the origin and reason about the seconds reading.

use std::fmt;

use chrono::{DateTime, Local, SecondsFormat, Utc};

/// A timezone-aware timestamp latched from a [`Timeline`].
#[derive(Debug, Clone, PartialEq)]
pub struct Timestamp {
    /// The datetime in the UTC time zone.
    pub utc: DateTime<Utc>,
    /// The datetime in the local time zone.
    pub local: DateTime<Local>,
    /// Seconds elapsed since the origin of the parent timeline.
    pub seconds: f64,
}

impl Timestamp {
    /// String representation of the UTC datetime, with microsecond precision.
    pub fn utc_datetime_string(&self) -> String {
        self.utc.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// String representation of the local datetime, with microsecond
    /// precision.
    pub fn local_datetime_string(&self) -> String {
        self.local.to_rfc3339_opts(SecondsFormat::Micros, false)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.local_datetime_string())
    }
}

/// A continuous timeline with a configurable origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    origin: DateTime<Utc>,
}

impl Timeline {
    /// Create a timeline with the origin at the Unix epoch.
    pub fn new() -> Self {
        Self {
            origin: DateTime::UNIX_EPOCH,
        }
    }

    /// Create a timeline with a custom origin.
    pub fn with_origin(origin: DateTime<Utc>) -> Self {
        Self { origin }
    }

    /// The timeline origin.
    pub fn origin(&self) -> DateTime<Utc> {
        self.origin
    }

    /// Latch the current time into a [`Timestamp`].
    pub fn latch(&self) -> Timestamp {
        let utc = Utc::now();
        let seconds = (utc - self.origin)
            .num_microseconds()
            .map(|microseconds| microseconds as f64 * 1.0e-6)
            .unwrap_or(f64::MAX);
        Timestamp {
            utc,
            local: utc.with_timezone(&Local),
            seconds,
        }
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}
