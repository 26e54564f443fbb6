use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const TIMESTAMP_SUFFIX: &str = "-timestamp";
pub const EXTENSION_PREFIX: &str = "X-";

/// All stored fields of one record, values and their `-timestamp` companions.
pub type Entry = BTreeMap<String, String>;

/// A single annotation as read back: `{key: value, key-timestamp: ts}`.
pub type AnnotationFields = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WellKnownKey {
    ObservedNetwork,
    PortedTo,
    PortedFrom,
    DoNotCall,
}

impl WellKnownKey {
    pub const ALL: [WellKnownKey; 4] = [
        WellKnownKey::ObservedNetwork,
        WellKnownKey::PortedTo,
        WellKnownKey::PortedFrom,
        WellKnownKey::DoNotCall,
    ];

    /// Keys that may decide which network serves a number, in tie-break order.
    pub const RESOLVABLE: [WellKnownKey; 2] =
        [WellKnownKey::ObservedNetwork, WellKnownKey::PortedTo];

    pub fn as_str(&self) -> &'static str {
        match self {
            WellKnownKey::ObservedNetwork => "observed-network",
            WellKnownKey::PortedTo => "ported-to",
            WellKnownKey::PortedFrom => "ported-from",
            WellKnownKey::DoNotCall => "do-not-call",
        }
    }

    pub fn timestamp_field(&self) -> String {
        format!("{}{TIMESTAMP_SUFFIX}", self.as_str())
    }

    fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == value)
    }
}

impl fmt::Display for WellKnownKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnnotationKey {
    WellKnown(WellKnownKey),
    Extension(String),
}

impl AnnotationKey {
    pub fn as_str(&self) -> &str {
        match self {
            AnnotationKey::WellKnown(key) => key.as_str(),
            AnnotationKey::Extension(key) => key.as_str(),
        }
    }

    pub fn timestamp_field(&self) -> String {
        format!("{}{TIMESTAMP_SUFFIX}", self.as_str())
    }

    /// Both backend fields owned by this key, value first.
    pub fn fields(&self) -> [String; 2] {
        [self.as_str().to_string(), self.timestamp_field()]
    }
}

impl fmt::Display for AnnotationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid Key: {0}")]
pub struct InvalidKey(pub String);

pub fn validate_annotate_key(key: &str) -> Result<AnnotationKey, InvalidKey> {
    if let Some(known) = WellKnownKey::parse(key) {
        return Ok(AnnotationKey::WellKnown(known));
    }
    if key.starts_with(EXTENSION_PREFIX) {
        return Ok(AnnotationKey::Extension(key.to_string()));
    }
    Err(InvalidKey(key.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid timestamp: {0}")]
pub struct InvalidTimestamp(pub String);

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 with any offset, naive date-times (read as UTC) and bare dates.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, InvalidTimestamp> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return start_of_day(date).ok_or_else(|| InvalidTimestamp(value.to_string()));
    }
    Err(InvalidTimestamp(value.to_string()))
}

pub fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
}
