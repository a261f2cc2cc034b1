//! Millisecond-precision UTC timestamps used for `modified` watermarks.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// `0000-01-01T00:00:00.000Z`; earlier instants do not render as RFC 3339.
const MIN_MILLIS: i64 = -62_167_219_200_000;
/// `9999-12-31T23:59:59.999Z`; later instants do not render as RFC 3339.
const MAX_MILLIS: i64 = 253_402_300_799_999;

/// A point in time stored as Unix milliseconds (UTC).
///
/// Both stores compare `modified` values at this precision, so anything finer
/// is truncated on the way in. That keeps a re-pushed row equal to its stored
/// form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch; the cursor for a first full pull.
    pub const EPOCH: Self = Self(0);

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Millis from untrusted input, `None` unless the instant renders as a
    /// four-digit-year RFC 3339 string that parses back to itself.
    pub const fn checked_from_millis(millis: i64) -> Option<Self> {
        if millis >= MIN_MILLIS && millis <= MAX_MILLIS {
            Some(Self(millis))
        } else {
            None
        }
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// The next representable instant.
    #[must_use]
    pub const fn successor(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Parse RFC 3339, a naive ISO datetime (taken as UTC) or integer millis.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidInput("timestamp must not be empty".into()));
        }
        let millis = Self::parse_millis(raw)
            .ok_or_else(|| Error::InvalidInput(format!("unrecognised timestamp `{raw}`")))?;
        Self::checked_from_millis(millis)
            .ok_or_else(|| Error::InvalidInput(format!("timestamp `{raw}` is out of range")))
    }

    fn parse_millis(raw: &str) -> Option<i64> {
        if let Ok(millis) = raw.parse::<i64>() {
            return Some(millis);
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.timestamp_millis());
        }
        NAIVE_FORMATS.iter().find_map(|format| {
            NaiveDateTime::parse_from_str(raw, format)
                .ok()
                .map(|parsed| parsed.and_utc().timestamp_millis())
        })
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_millis())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            &self
                .to_datetime()
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        )
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Text(String),
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Millis(millis) => Self::checked_from_millis(millis).ok_or_else(|| {
                serde::de::Error::custom(format!("timestamp {millis} is out of range"))
            }),
            RawTimestamp::Text(text) => Self::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}
