//! Expiry coercion
//!
//! Registrations carry an optional, loosely typed expiry. Coercion turns it
//! into an [`Expiry`], and it never fails: missing or unreadable input means
//! the destination never expires.

use chrono::{
    DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};

use crate::error::{Error, Result};
use crate::registry::Expiry;

/// Expiry as supplied by a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryInput {
    /// Free-form text, interpreted by an [`ExpiryParser`]
    Text(String),
    /// An absolute instant
    At(DateTime<Utc>),
    /// A wall-clock date and time in the local timezone
    Local(NaiveDateTime),
    /// A date; the time defaults to the end of that day
    Date(NaiveDate),
    /// A time of day; the date defaults to today
    Time(NaiveTime),
}

impl From<&str> for ExpiryInput {
    fn from(s: &str) -> Self {
        ExpiryInput::Text(s.to_string())
    }
}

impl From<String> for ExpiryInput {
    fn from(s: String) -> Self {
        ExpiryInput::Text(s)
    }
}

impl From<DateTime<Utc>> for ExpiryInput {
    fn from(dt: DateTime<Utc>) -> Self {
        ExpiryInput::At(dt)
    }
}

impl From<DateTime<FixedOffset>> for ExpiryInput {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        ExpiryInput::At(dt.with_timezone(&Utc))
    }
}

impl From<NaiveDateTime> for ExpiryInput {
    fn from(dt: NaiveDateTime) -> Self {
        ExpiryInput::Local(dt)
    }
}

impl From<NaiveDate> for ExpiryInput {
    fn from(date: NaiveDate) -> Self {
        ExpiryInput::Date(date)
    }
}

impl From<NaiveTime> for ExpiryInput {
    fn from(time: NaiveTime) -> Self {
        ExpiryInput::Time(time)
    }
}

impl std::fmt::Display for ExpiryInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpiryInput::Text(s) => write!(f, "{:?}", s),
            ExpiryInput::At(dt) => write!(f, "{}", dt.to_rfc3339()),
            ExpiryInput::Local(dt) => write!(f, "{}", dt),
            ExpiryInput::Date(date) => write!(f, "{}", date),
            ExpiryInput::Time(time) => write!(f, "{}", time),
        }
    }
}

/// Parses textual expiry input
pub trait ExpiryParser: Send + Sync + 'static {
    /// Parse `input`, filling in whichever of date or time it leaves out
    fn parse(
        &self,
        input: &str,
        default_time: NaiveTime,
        default_date: NaiveDate,
    ) -> Result<DateTime<Utc>>;
}

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

/// Parser for the common textual forms
///
/// Accepts, in order of precedence:
/// - RFC 3339 (`2026-10-17T18:00:00+02:00`)
/// - local date and time (`2026-10-17 18:00`, `2026-10-17T18:00:30`)
/// - local date (`2026-10-17`, `2026/10/17`)
/// - local time of day (`18:00`, `18:00:30`)
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExpiryParser;

impl ExpiryParser for DefaultExpiryParser {
    fn parse(
        &self,
        input: &str,
        default_time: NaiveTime,
        default_date: NaiveDate,
    ) -> Result<DateTime<Utc>> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidExpiry("empty input".into()));
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
            return Ok(dt.with_timezone(&Utc));
        }

        for format in DATE_TIME_FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(input, format) {
                return local_to_utc(dt);
            }
        }

        for format in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(input, format) {
                return local_to_utc(date.and_time(default_time));
            }
        }

        for format in TIME_FORMATS {
            if let Ok(time) = NaiveTime::parse_from_str(input, format) {
                return local_to_utc(default_date.and_time(time));
            }
        }

        Err(Error::InvalidExpiry(format!("unrecognized format: {}", input)))
    }
}

/// Last representable instant of a day
pub fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap_or_default()
}

/// Interpret a wall-clock time in the local timezone
///
/// Ambiguous times (DST fold) take the earlier instant; nonexistent times
/// (DST gap) are an error.
pub fn local_to_utc(dt: NaiveDateTime) -> Result<DateTime<Utc>> {
    Local
        .from_local_datetime(&dt)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| Error::InvalidExpiry(format!("{} does not exist locally", dt)))
}

/// Turn optional expiry input into an [`Expiry`]
///
/// `now` supplies today's date for inputs that only name a time of day.
/// Anything that cannot be interpreted falls back to [`Expiry::NEVER`].
pub fn coerce(input: Option<&ExpiryInput>, parser: &dyn ExpiryParser, now: DateTime<Utc>) -> Expiry {
    let Some(input) = input else {
        return Expiry::NEVER;
    };

    let today = now.with_timezone(&Local).date_naive();
    let parsed = match input {
        ExpiryInput::Text(text) => parser.parse(text, end_of_day(), today),
        ExpiryInput::At(dt) => Ok(*dt),
        ExpiryInput::Local(dt) => local_to_utc(*dt),
        ExpiryInput::Date(date) => local_to_utc(date.and_time(end_of_day())),
        ExpiryInput::Time(time) => local_to_utc(today.and_time(*time)),
    };

    match parsed {
        Ok(deadline) => Expiry::at(deadline),
        Err(e) => {
            tracing::debug!(input = %input, error = %e, "Unreadable expiry, never expires");
            Expiry::NEVER
        }
    }
}
