// Copyright 2024 The Kubernetes Authors.
// Licensed under the Apache License, Version 2.0

//! Resource quantities such as `500m`, `2`, `1.5Gi`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// ResourceList maps resource names (`cpu`, `memory`, ...) to quantities.
pub type ResourceList = BTreeMap<String, Quantity>;

/// QuantityError describes a quantity string that cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("quantity must not be empty")]
    Empty,
    #[error("quantity {0:?} is not a valid number")]
    InvalidNumber(String),
    #[error("quantity {value:?} has unknown suffix {suffix:?}")]
    UnknownSuffix { value: String, suffix: String },
    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

/// Quantity is a fixed-point resource amount in its canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(pub String);

const KI: i128 = 1024;

impl Quantity {
    pub fn new(value: impl Into<String>) -> Self {
        Quantity(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds a CPU-style quantity from millicores (`80m`, or `2` for whole cores).
    pub fn from_millis(millis: i64) -> Self {
        if millis % 1000 == 0 {
            Quantity(format!("{}", millis / 1000))
        } else {
            Quantity(format!("{}m", millis))
        }
    }

    /// Builds a memory quantity from mebibytes.
    pub fn from_mebibytes(mebibytes: i64) -> Self {
        Quantity(format!("{}Mi", mebibytes))
    }

    /// Value in thousandths of the base unit, rounded up.
    pub fn milli_value(&self) -> Result<i64, QuantityError> {
        let milli = self.parse_milli()?;
        i64::try_from(milli).map_err(|_| QuantityError::OutOfRange(self.0.clone()))
    }

    /// Value in the base unit, rounded up.
    pub fn value(&self) -> Result<i64, QuantityError> {
        let milli = self.parse_milli()?;
        let whole = (milli + 999) / 1000;
        i64::try_from(whole).map_err(|_| QuantityError::OutOfRange(self.0.clone()))
    }

    fn parse_milli(&self) -> Result<i128, QuantityError> {
        let s = self.0.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        if number.is_empty() {
            return Err(QuantityError::InvalidNumber(self.0.clone()));
        }

        let multiplier_milli = match suffix {
            "" => 1000,
            "m" => 1,
            "k" => 1_000_000,
            "M" => 1_000_000_000,
            "G" => 1_000_000_000_000,
            "T" => 1_000_000_000_000_000,
            "P" => 1_000_000_000_000_000_000,
            "E" => 1_000_000_000_000_000_000_000,
            "Ki" => KI * 1000,
            "Mi" => KI.pow(2) * 1000,
            "Gi" => KI.pow(3) * 1000,
            "Ti" => KI.pow(4) * 1000,
            "Pi" => KI.pow(5) * 1000,
            "Ei" => KI.pow(6) * 1000,
            _ => {
                return Err(QuantityError::UnknownSuffix {
                    value: self.0.clone(),
                    suffix: suffix.to_string(),
                })
            }
        };

        let (integer, fraction) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        if (integer.is_empty() && fraction.is_empty()) || fraction.contains('.') {
            return Err(QuantityError::InvalidNumber(self.0.clone()));
        }

        let digits = format!("{}{}", integer, fraction);
        let mantissa: i128 = digits
            .parse()
            .map_err(|_| QuantityError::OutOfRange(self.0.clone()))?;
        let scale = 10i128
            .checked_pow(fraction.len() as u32)
            .ok_or_else(|| QuantityError::OutOfRange(self.0.clone()))?;
        let scaled = mantissa
            .checked_mul(multiplier_milli)
            .ok_or_else(|| QuantityError::OutOfRange(self.0.clone()))?;

        // Round up like the API server does for sub-milli remainders.
        Ok((scaled + scale - 1) / scale)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Quantity {
    fn from(value: &str) -> Self {
        Quantity(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("2", 2000)]
    #[case("500m", 500)]
    #[case("1.5", 1500)]
    #[case("0.1", 100)]
    #[case("1k", 1_000_000)]
    fn test_milli_value(#[case] input: &str, #[case] expected: i64) {
        assert_eq!(Quantity::from(input).milli_value(), Ok(expected));
    }

    #[rstest]
    #[case("1Ki", 1024)]
    #[case("16Gi", 16 * 1024 * 1024 * 1024)]
    #[case("1.5Gi", 1536 * 1024 * 1024)]
    #[case("1G", 1_000_000_000)]
    #[case("255Mi", 255 * 1024 * 1024)]
    #[case("1500m", 2)]
    fn test_value(#[case] input: &str, #[case] expected: i64) {
        assert_eq!(Quantity::from(input).value(), Ok(expected));
    }

    #[rstest]
    #[case("", QuantityError::Empty)]
    #[case("abc", QuantityError::InvalidNumber("abc".to_string()))]
    #[case("1.2.3", QuantityError::InvalidNumber("1.2.3".to_string()))]
    #[case("4Xi", QuantityError::UnknownSuffix { value: "4Xi".to_string(), suffix: "Xi".to_string() })]
    fn test_invalid(#[case] input: &str, #[case] expected: QuantityError) {
        assert_eq!(Quantity::from(input).milli_value(), Err(expected));
    }

    #[test]
    fn test_out_of_range() {
        assert!(matches!(
            Quantity::from("9000000000000000Ei").value(),
            Err(QuantityError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_formatting() {
        assert_eq!(Quantity::from_millis(80).as_str(), "80m");
        assert_eq!(Quantity::from_millis(2000).as_str(), "2");
        assert_eq!(Quantity::from_mebibytes(1843).to_string(), "1843Mi");
    }
}
