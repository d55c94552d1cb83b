//! Fixed-point money in integer minor units.
//!
//! All ledger arithmetic happens on whole cents. There is no floating point and
//! therefore no comparison tolerance anywhere in the business rules.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::value_object::ValueObject;

/// An amount of money in minor units (cents). Single currency.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl ValueObject for Money {}

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Whole currency units (e.g. dollars).
    ///
    /// Panics if `units * 100` overflows `i64`; use `checked_from_major` for
    /// untrusted input.
    pub const fn from_major(units: i64) -> Self {
        match Self::checked_from_major(units) {
            Some(money) => money,
            None => panic!("Money::from_major overflow"),
        }
    }

    pub const fn checked_from_major(units: i64) -> Option<Self> {
        match units.checked_mul(100) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn min(self, other: Money) -> Money {
        if self <= other { self } else { other }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}${}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = DomainError;

    /// Parses `"12"`, `"12.5"`, `"12.50"`, `"$12.50"` and `"-3.10"`.
    ///
    /// More than two fractional digits is rejected rather than rounded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::validation(format!("invalid money amount: {s:?}"));

        let trimmed = s.trim();
        let (negative, rest) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let rest = rest.strip_prefix('$').unwrap_or(rest);
        if rest.is_empty() {
            return Err(invalid());
        }

        let (whole, frac) = match rest.split_once('.') {
            Some((w, f)) => (w, f),
            None => (rest, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let frac_cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };

        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac_cents))
            .ok_or_else(invalid)?;

        Ok(Money(if negative { -cents } else { cents }))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn displayed_amounts_parse_back(cents in -1_000_000_000_000i64..1_000_000_000_000i64) {
            let money = Money::from_cents(cents);
            prop_assert_eq!(money.to_string().parse::<Money>().unwrap(), money);
        }
    }

    #[test]
    fn display_pads_cents() {
        assert_eq!(Money::from_cents(123_405).to_string(), "$1234.05");
        assert_eq!(Money::from_cents(-7).to_string(), "-$0.07");
        assert_eq!(Money::ZERO.to_string(), "$0.00");
    }

    #[test]
    fn parses_common_forms() {
        assert_eq!("12".parse::<Money>().unwrap(), Money::from_cents(1200));
        assert_eq!("12.5".parse::<Money>().unwrap(), Money::from_cents(1250));
        assert_eq!("$12.05".parse::<Money>().unwrap(), Money::from_cents(1205));
        assert_eq!("-3.10".parse::<Money>().unwrap(), Money::from_cents(-310));
    }

    #[test]
    fn rejects_sub_cent_precision_and_garbage() {
        assert!("1.005".parse::<Money>().is_err());
        assert!("abc".parse::<Money>().is_err());
        assert!("".parse::<Money>().is_err());
        assert!(".5".parse::<Money>().is_err());
    }

    #[test]
    fn major_units_overflow_is_reported() {
        assert_eq!(Money::checked_from_major(12), Some(Money::from_cents(1_200)));
        assert_eq!(Money::checked_from_major(i64::MAX / 100 + 1), None);
        assert_eq!(Money::checked_from_major(i64::MIN), None);
    }

    #[test]
    #[should_panic(expected = "Money::from_major overflow")]
    fn from_major_panics_instead_of_wrapping() {
        let _ = Money::from_major(i64::MAX);
    }

    #[test]
    fn min_picks_smaller_amount() {
        let a = Money::from_major(40);
        let b = Money::from_major(100);
        assert_eq!(a.min(b), a);
        assert_eq!(b.min(a), a);
    }
}
