//! Suffixed 64-bit numbers.
//!
//! Rates, sizes and durations in topology files accept an optional scale
//! suffix: `K`, `M`, `G`, `T`, `P` or `E`. An uppercase suffix scales by
//! powers of ten; appending `i` (`Ki`, `Mi`, ...) or writing the suffix in
//! lowercase scales by powers of two.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};

const SUFFIXES: &str = "KMGTPE";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NumberError {
    #[error("empty number")]
    Empty,
    #[error("invalid number {0:?}")]
    Invalid(String),
    #[error("number {0:?} overflows 64 bits")]
    Overflow(String),
}

/// A non-negative integer parsed from a decimal literal with an optional
/// scale suffix.
///
/// ```
/// use munet_tc::Number64;
///
/// assert_eq!("100K".parse::<Number64>().unwrap().get(), 100_000);
/// assert_eq!("100k".parse::<Number64>().unwrap().get(), 100 * 1024);
/// assert_eq!("4Gi".parse::<Number64>().unwrap().get(), 4 * 1024 * 1024 * 1024);
/// assert_eq!("55".parse::<Number64>().unwrap().get(), 55);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Number64(u64);

impl Number64 {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Number64 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Number64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Number64 {
    type Err = NumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(NumberError::Empty);
        }

        let mut digits = text;
        let mut base: u64 = 1000;

        if let Some(stripped) = digits.strip_suffix('i') {
            base = 1024;
            digits = stripped;
        }

        let mut exponent = 0u32;
        if let Some(last) = digits.chars().last() {
            if let Some(index) = SUFFIXES.find(last) {
                exponent = index as u32 + 1;
                digits = &digits[..digits.len() - 1];
            } else if let Some(index) = SUFFIXES.find(last.to_ascii_uppercase()) {
                // Lowercase suffixes are binary, matching `100k` == 100 KiB.
                base = 1024;
                exponent = index as u32 + 1;
                digits = &digits[..digits.len() - 1];
            }
        }

        let value: u64 = digits.parse().map_err(|_| NumberError::Invalid(s.to_string()))?;
        let scale = base.checked_pow(exponent).ok_or_else(|| NumberError::Overflow(s.to_string()))?;
        let scaled = value.checked_mul(scale).ok_or_else(|| NumberError::Overflow(s.to_string()))?;

        Ok(Self(scaled))
    }
}

impl<'de> Deserialize<'de> for Number64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Integer(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Integer(value) => Ok(Self(value)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}
