pub mod annotation;
pub mod msisdn;
pub mod protocol;

pub use annotation::{
    format_timestamp, parse_timestamp, validate_annotate_key, AnnotationFields, AnnotationKey,
    Entry, InvalidKey, InvalidTimestamp, WellKnownKey,
};
pub use msisdn::{Msisdn, MsisdnError};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    ObservedNetwork,
    PortedTo,
    PrefixGuess,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ObservedNetwork => "observed-network",
            Strategy::PortedTo => "ported-to",
            Strategy::PrefixGuess => "prefix-guess",
        }
    }

    pub fn from_key(key: WellKnownKey) -> Option<Self> {
        match key {
            WellKnownKey::ObservedNetwork => Some(Strategy::ObservedNetwork),
            WellKnownKey::PortedTo => Some(Strategy::PortedTo),
            WellKnownKey::PortedFrom | WellKnownKey::DoNotCall => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub network: Option<String>,
    pub strategy: Strategy,
    pub entry: Entry,
}

/// One row of a porting database export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortingRecord {
    pub msisdn: Msisdn,
    pub donor: String,
    pub recipient: String,
    pub effective: NaiveDate,
}

impl PortingRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        annotation::start_of_day(self.effective).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
