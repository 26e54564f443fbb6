use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const MIN_DIGITS: usize = 7;
const MAX_DIGITS: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MsisdnError {
    #[error("Invalid MSISDN: empty number")]
    Empty,
    #[error("Invalid MSISDN: {input} (unexpected character {ch:?})")]
    InvalidCharacter { input: String, ch: char },
    #[error("Invalid MSISDN: {input} ({digits} digits, expected 7-15)")]
    Length { input: String, digits: usize },
    #[error("Invalid MSISDN: {input} (country code cannot start with 0)")]
    LeadingZero { input: String },
}

/// A phone number in canonical international form: bare E.164 digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Msisdn(String);

impl Msisdn {
    pub fn parse(input: &str) -> Result<Self, MsisdnError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(MsisdnError::Empty);
        }

        let mut digits = String::with_capacity(trimmed.len());
        for (idx, ch) in trimmed.chars().enumerate() {
            match ch {
                '0'..='9' => digits.push(ch),
                '+' if idx == 0 => {}
                ' ' | '-' | '.' | '(' | ')' => {}
                other => {
                    return Err(MsisdnError::InvalidCharacter {
                        input: input.to_string(),
                        ch: other,
                    })
                }
            }
        }

        if !trimmed.starts_with('+') {
            if let Some(rest) = digits.strip_prefix("00") {
                digits = rest.to_string();
            }
        }

        if digits.len() < MIN_DIGITS || digits.len() > MAX_DIGITS {
            return Err(MsisdnError::Length {
                input: input.to_string(),
                digits: digits.len(),
            });
        }
        if digits.starts_with('0') {
            return Err(MsisdnError::LeadingZero {
                input: input.to_string(),
            });
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Msisdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Msisdn {
    type Err = MsisdnError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

impl TryFrom<String> for Msisdn {
    type Error = MsisdnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Msisdn> for String {
    fn from(value: Msisdn) -> Self {
        value.0
    }
}
