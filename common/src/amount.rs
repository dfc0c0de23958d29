//! Fixed-precision monetary amounts.
//!
//! All money and usage values in the system go through [`Amount`], a thin
//! wrapper around a 96-bit scaled decimal. Addition, subtraction and
//! multiplication are exact; division is the only operation that can
//! introduce (bounded) error. Values serialize as canonical decimal strings
//! so JSON consumers never see floats.

use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign},
    str::FromStr,
};

use rust_decimal::{prelude::FromPrimitive, Decimal, RoundingStrategy};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AmountError {
    #[error("invalid decimal literal '{0}'")]
    InvalidLiteral(String),

    #[error("value {0} is not representable as a decimal")]
    NotRepresentable(f64),
}

/// A signed decimal amount with 28-29 significant digits.
///
/// The persisted column width is NUMERIC(38, 9); every value the engine
/// produces fits comfortably within the wrapper's 96-bit mantissa.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);
    pub const ONE: Amount = Amount(Decimal::ONE);
    pub const ONE_HUNDRED: Amount = Amount(Decimal::ONE_HUNDRED);

    pub const fn new(inner: Decimal) -> Self {
        Amount(inner)
    }

    pub const fn into_inner(self) -> Decimal {
        self.0
    }

    pub fn from_f64(value: f64) -> Result<Self, AmountError> {
        Decimal::from_f64(value)
            .map(Amount)
            .ok_or(AmountError::NotRepresentable(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// -1, 0 or 1.
    pub fn sign(&self) -> i8 {
        if self.0.is_zero() {
            0
        } else if self.0.is_sign_negative() {
            -1
        } else {
            1
        }
    }

    pub fn min(self, other: Self) -> Self {
        if self <= other {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Self) -> Self {
        if self >= other {
            self
        } else {
            other
        }
    }

    /// Division, `None` on a zero divisor.
    pub fn checked_div(self, rhs: Self) -> Option<Self> {
        self.0.checked_div(rhs.0).map(Amount)
    }

    /// Clamp into [0, 1]; strategy shares are always reported in this range.
    pub fn clamp_unit(self) -> Self {
        self.max(Self::ZERO).min(Self::ONE)
    }

    /// Half-even rounding at `scale` fractional digits. Only used at report
    /// time, never on intermediate engine state.
    pub fn rounded(self, scale: u32) -> Self {
        Amount(
            self.0
                .round_dp_with_strategy(scale, RoundingStrategy::MidpointNearestEven),
        )
    }

    /// Canonical form: no exponent, no trailing fractional zeros.
    pub fn to_canonical_string(&self) -> String {
        self.0.normalize().to_string()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s)
            .map(Amount)
            .map_err(|_| AmountError::InvalidLiteral(s.to_string()))
    }
}

impl From<Decimal> for Amount {
    fn from(inner: Decimal) -> Self {
        Amount(inner)
    }
}

impl From<i64> for Amount {
    fn from(value: i64) -> Self {
        Amount(Decimal::from(value))
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Amount(Decimal::from(value))
    }
}

impl From<usize> for Amount {
    fn from(value: usize) -> Self {
        Amount(Decimal::from(value))
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Amount {
    type Output = Amount;

    fn mul(self, rhs: Self) -> Self::Output {
        Amount(self.0 * rhs.0)
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Self::Output {
        Amount(-self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, v| acc + v)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, v| acc + *v)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical_string())
    }
}

struct AmountVisitor;

impl de::Visitor<'_> for AmountVisitor {
    type Value = Amount;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a decimal string or number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Amount::from_str(v).map_err(E::custom)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Amount::from_f64(v).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(Amount::from(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Amount::from(v))
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_string() {
        let a = Amount::from_str("100.500000000").unwrap();
        assert_eq!(a.to_canonical_string(), "100.5");
        assert_eq!(Amount::ZERO.to_canonical_string(), "0");
        assert_eq!(Amount::from_str("0.10").unwrap().to_canonical_string(), "0.1");
    }

    #[test]
    fn test_exact_addition() {
        // The classic float trap: 0.1 + 0.2 must be exactly 0.3
        let sum = Amount::from_str("0.1").unwrap() + Amount::from_str("0.2").unwrap();
        assert_eq!(sum, Amount::from_str("0.3").unwrap());
    }

    #[test]
    fn test_half_even_rounding() {
        assert_eq!(
            Amount::from_str("0.125").unwrap().rounded(2),
            Amount::from_str("0.12").unwrap()
        );
        assert_eq!(
            Amount::from_str("0.135").unwrap().rounded(2),
            Amount::from_str("0.14").unwrap()
        );
    }

    #[test]
    fn test_checked_div() {
        let a = Amount::from(1i64);
        assert!(a.checked_div(Amount::ZERO).is_none());
        assert_eq!(
            Amount::from(500i64).checked_div(Amount::from(1000i64)),
            Some(Amount::from_str("0.5").unwrap())
        );
    }

    #[test]
    fn test_sign() {
        assert_eq!(Amount::ZERO.sign(), 0);
        assert_eq!(Amount::from(5i64).sign(), 1);
        assert_eq!((-Amount::from(5i64)).sign(), -1);
    }

    #[test]
    fn test_serde_round_trip() {
        let a = Amount::from_str("1234.000000001").unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"1234.000000001\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);

        // numbers are accepted on input
        let from_number: Amount = serde_json::from_str("42").unwrap();
        assert_eq!(from_number, Amount::from(42i64));
    }

    #[test]
    fn test_clamp_unit() {
        assert_eq!(Amount::from(3i64).clamp_unit(), Amount::ONE);
        assert_eq!((-Amount::ONE).clamp_unit(), Amount::ZERO);
        let half = Amount::from_str("0.5").unwrap();
        assert_eq!(half.clamp_unit(), half);
    }
}
