//! Arbitrary-precision sequence numbers
//!
//! Account sequence numbers travel as decimal strings and are never truncated
//! to a fixed-width integer.

use crate::{Error, Result};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Unsigned account sequence number
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNumber(BigUint);

impl SequenceNumber {
    /// Sequence number zero
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    /// The sequence number directly after this one
    pub fn successor(&self) -> Self {
        Self(&self.0 + 1u32)
    }

    /// This sequence number advanced by `count`
    pub fn advance(&self, count: usize) -> Self {
        Self(&self.0 + BigUint::from(count))
    }

    /// Underlying big integer
    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }
}

impl FromStr for SequenceNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidSequence(s.to_string()));
        }
        BigUint::parse_bytes(s.as_bytes(), 10)
            .map(Self)
            .ok_or_else(|| Error::InvalidSequence(s.to_string()))
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl From<BigUint> for SequenceNumber {
    fn from(value: BigUint) -> Self {
        Self(value)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Serialize for SequenceNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SequenceNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successor_crosses_u64_boundary() {
        let max: SequenceNumber = "18446744073709551615".parse().unwrap();
        assert_eq!(max.successor().to_string(), "18446744073709551616");
    }

    #[test]
    fn test_advance() {
        let seq = SequenceNumber::from(100);
        assert_eq!(seq.advance(3), SequenceNumber::from(103));
        assert_eq!(seq.advance(0), seq);
    }

    #[test]
    fn test_rejects_non_decimal() {
        for bad in ["", "-1", "+1", "12a", " 1", "0x10", "1.0"] {
            assert!(
                matches!(bad.parse::<SequenceNumber>(), Err(Error::InvalidSequence(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_ordering_is_numeric() {
        let small: SequenceNumber = "9".parse().unwrap();
        let large: SequenceNumber = "10".parse().unwrap();
        assert!(small < large);
    }

    #[test]
    fn test_serializes_as_decimal_string() {
        let seq: SequenceNumber = "340282366920938463463374607431768211456".parse().unwrap();
        let json = serde_json::to_string(&seq).unwrap();
        assert_eq!(json, "\"340282366920938463463374607431768211456\"");

        let back: SequenceNumber = serde_json::from_str(&json).unwrap();
        assert_eq!(back, seq);
    }
}
