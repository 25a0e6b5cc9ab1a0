//! Arbitrary-precision decimal amounts.
//!
//! Amounts are non-negative decimals carried as [`bigdecimal::BigDecimal`]
//! and serialized as a canonical string (no exponent, no superfluous trailing
//! zeros). All rounding is round-down; the broker never rounds in its own
//! favour past an asset's scale.

use bigdecimal::{BigDecimal, RoundingMode};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::SwapxError;

/// Non-negative arbitrary-precision decimal amount.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount(BigDecimal);

impl Amount {
    pub fn zero() -> Self {
        Self(BigDecimal::from(0u32))
    }

    /// Parse a decimal string. Negative values are rejected: nothing in the
    /// broker's data model carries a signed amount.
    pub fn parse(s: &str) -> Result<Self, SwapxError> {
        let d = BigDecimal::from_str(s.trim())
            .map_err(|e| SwapxError::InvalidAmount(format!("{s:?}: {e}")))?;
        if d < BigDecimal::from(0u32) {
            return Err(SwapxError::InvalidAmount(format!("{s:?}: negative")));
        }
        Ok(Self(d))
    }

    /// Canonical string form: normalized, plain decimal notation.
    pub fn to_canonical_string(&self) -> String {
        self.0.normalized().to_string()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigDecimal::from(0u32)
    }

    pub fn is_positive(&self) -> bool {
        self.0 > BigDecimal::from(0u32)
    }

    pub fn plus(&self, other: &Amount) -> Amount {
        Amount(&self.0 + &other.0)
    }

    /// `self − other`, or `None` when the result would be negative.
    pub fn checked_minus(&self, other: &Amount) -> Option<Amount> {
        if self.0 < other.0 {
            return None;
        }
        Some(Amount(&self.0 - &other.0))
    }

    /// `max(self − other, 0)`.
    pub fn saturating_minus(&self, other: &Amount) -> Amount {
        self.checked_minus(other).unwrap_or_else(Amount::zero)
    }

    /// Round down to `decimals` fractional digits.
    pub fn round_down(&self, decimals: u32) -> Amount {
        Amount(self.0.with_scale_round(decimals as i64, RoundingMode::Down))
    }

    /// `floor(self × bps / 10000)` at `decimals` fractional digits. Used for
    /// percent-mode commissions.
    pub fn mul_bps_floor(&self, bps: u32, decimals: u32) -> Amount {
        let raw = (&self.0 * BigDecimal::from(bps)) / BigDecimal::from(10_000u32);
        Amount(raw.with_scale_round(decimals as i64, RoundingMode::Down))
    }

    /// `floor(self × other)` at `decimals` fractional digits. Used for
    /// USD-to-native conversion at a quoted rate.
    pub fn mul_amount(&self, other: &Amount, decimals: u32) -> Amount {
        let raw = &self.0 * &other.0;
        Amount(raw.with_scale_round(decimals as i64, RoundingMode::Down))
    }

    /// Sum an iterator of amounts.
    pub fn sum<'a, I: IntoIterator<Item = &'a Amount>>(iter: I) -> Amount {
        iter.into_iter()
            .fold(Amount::zero(), |acc, a| acc.plus(a))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self.to_canonical_string())
    }
}

// Manual serde: canonical string both ways. bigdecimal's own impls go through
// `deserialize_any`, which bincode cannot drive; a plain string works under
// serde_json and bincode alike.

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Amount::parse(&s).map_err(D::Error::custom)
    }
}
