//! Tez amounts and their mutez representation.
//!
//! All amount-like fields on the wire are mutez integers. Human-readable tez
//! quantities are decimal text with at most six fractional digits; anything
//! finer would be a fractional mutez and is rejected rather than rounded.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, Result};

/// Number of mutez in one tez.
pub const MUTEZ_PER_TEZ: u64 = 1_000_000;

/// Decimal places of the tez unit.
pub const TEZ_DECIMALS: usize = 6;

/// A non-negative quantity in mutez.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Mutez(pub u64);

impl Mutez {
    pub const ZERO: Mutez = Mutez(0);

    /// Parse a decimal tez quantity, e.g. `"1.5"` → `Mutez(1_500_000)`.
    pub fn from_tez(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(KestrelError::Validation("amount is empty".to_string()));
        }
        if text.starts_with('-') {
            return Err(KestrelError::Validation(format!(
                "amount must be non-negative, got {text}"
            )));
        }

        let (whole, frac) = match text.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (text, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(KestrelError::Validation(format!("invalid amount {text:?}")));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(KestrelError::Validation(format!("invalid amount {text:?}")));
        }

        let significant = frac.trim_end_matches('0');
        if significant.len() > TEZ_DECIMALS {
            return Err(KestrelError::Validation(format!(
                "amount {text} has a fractional mutez part"
            )));
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| KestrelError::Validation(format!("amount {text} is out of range")))?
        };
        let frac: u64 = if significant.is_empty() {
            0
        } else {
            let padded = format!("{significant:0<width$}", width = TEZ_DECIMALS);
            padded
                .parse()
                .map_err(|_| KestrelError::Validation(format!("invalid amount {text:?}")))?
        };

        whole
            .checked_mul(MUTEZ_PER_TEZ)
            .and_then(|m| m.checked_add(frac))
            .map(Mutez)
            .ok_or_else(|| KestrelError::Validation(format!("amount {text} is out of range")))
    }

    /// Parse a mutez integer, e.g. `"1500000"`.
    pub fn from_mutez_str(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.contains('.') {
            return Err(KestrelError::Validation(format!(
                "mutez amount {text} must be an integer"
            )));
        }
        // `u64::from_str` would also take a leading '+'.
        if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit()) {
            return Err(KestrelError::Validation(format!("invalid mutez amount {text:?}")));
        }
        text.parse()
            .map(Mutez)
            .map_err(|_| KestrelError::Validation(format!("invalid mutez amount {text:?}")))
    }

    /// Parse an amount that is either tez text (default) or mutez text.
    pub fn parse(text: &str, mutez: bool) -> Result<Self> {
        if mutez {
            Self::from_mutez_str(text)
        } else {
            Self::from_tez(text)
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Render as tez decimal text without trailing zeros.
    pub fn to_tez_string(self) -> String {
        let whole = self.0 / MUTEZ_PER_TEZ;
        let frac = self.0 % MUTEZ_PER_TEZ;
        if frac == 0 {
            return whole.to_string();
        }
        let frac = format!("{frac:0width$}", width = TEZ_DECIMALS);
        format!("{whole}.{}", frac.trim_end_matches('0'))
    }
}

impl fmt::Display for Mutez {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Mutez {
    fn from(value: u64) -> Self {
        Mutez(value)
    }
}

impl FromStr for Mutez {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_tez(s)
    }
}

// The node encodes mutez as decimal strings.
impl Serialize for Mutez {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Mutez {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = crate::types::StringOrNumber::deserialize(deserializer)?;
        raw.into_u64().map(Mutez).map_err(serde::de::Error::custom)
    }
}
