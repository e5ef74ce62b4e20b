//! Non-negative stock quantities.

use core::fmt;
use core::iter::Sum;
use core::ops::{Add, AddAssign};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// A quantity of material in the item's unit of measure.
///
/// Always `>= 0`. Decimal rather than integer because raw material is booked in
/// kilograms and metres as often as in pieces.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Quantity(Decimal);

impl ValueObject for Quantity {}

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    pub fn new(value: Decimal) -> DomainResult<Self> {
        if value < Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "quantity cannot be negative (got {value})"
            )));
        }
        Ok(Self(value.normalize()))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// `self - other`, or `None` when the result would be negative.
    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        if other.0 > self.0 {
            None
        } else {
            Some(Quantity((self.0 - other.0).normalize()))
        }
    }

    /// `self - other`, clamped at zero.
    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        self.checked_sub(other).unwrap_or(Quantity::ZERO)
    }

    /// Multiply by a non-negative factor (BOM ratios, scrap allowances).
    pub fn scale(self, factor: Decimal) -> DomainResult<Quantity> {
        let scaled = self
            .0
            .checked_mul(factor)
            .ok_or_else(|| DomainError::validation("quantity overflow"))?;
        Quantity::new(scaled)
    }
}

impl TryFrom<Decimal> for Quantity {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Quantity::new(value)
    }
}

impl From<Quantity> for Decimal {
    fn from(value: Quantity) -> Self {
        value.0
    }
}

impl From<u32> for Quantity {
    fn from(value: u32) -> Self {
        Quantity(Decimal::from(value))
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity((self.0 + rhs.0).normalize())
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        *self = *self + rhs;
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Quantity> for Quantity {
    fn sum<I: Iterator<Item = &'a Quantity>>(iter: I) -> Quantity {
        iter.copied().sum()
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_negative_values() {
        let err = Quantity::new(Decimal::new(-5, 1)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn trailing_zeros_do_not_affect_equality() {
        let a = Quantity::new(Decimal::new(1500, 2)).unwrap();
        let b = Quantity::from(15);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "15");
    }

    #[test]
    fn checked_sub_refuses_to_go_negative() {
        let ten = Quantity::from(10);
        let fifteen = Quantity::from(15);
        assert_eq!(ten.checked_sub(fifteen), None);
        assert_eq!(fifteen.checked_sub(ten), Some(Quantity::from(5)));
        assert_eq!(ten.saturating_sub(fifteen), Quantity::ZERO);
    }

    #[test]
    fn deserializing_a_negative_string_fails() {
        let parsed: Result<Quantity, _> = serde_json::from_str("\"-1\"");
        assert!(parsed.is_err());

        let ok: Quantity = serde_json::from_str("\"12.5\"").unwrap();
        assert_eq!(ok.value(), Decimal::new(125, 1));
    }

    proptest! {
        #[test]
        fn add_then_sub_is_identity(a in 0i64..1_000_000, b in 0i64..1_000_000) {
            let qa = Quantity::new(Decimal::new(a, 3)).unwrap();
            let qb = Quantity::new(Decimal::new(b, 3)).unwrap();
            prop_assert_eq!((qa + qb).checked_sub(qb), Some(qa));
        }
    }
}
