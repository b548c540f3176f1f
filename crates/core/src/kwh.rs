use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// An energy quantity in kilowatt-hours, kept as an exact decimal so meter
/// readings never pick up binary floating point noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kwh(Decimal);

impl Kwh {
    pub fn new(value: Decimal) -> Self {
        Kwh(value)
    }

    pub fn zero() -> Self {
        Kwh(Decimal::ZERO)
    }

    pub fn value(self) -> Decimal {
        self.0
    }

    /// Number of significant decimal places, ignoring trailing zeros
    /// (`12.50` has one).
    pub fn decimal_places(self) -> u32 {
        self.0.normalize().scale()
    }

    /// Round half away from zero, the way a meter display or a receipt would.
    pub fn round_dp(self, places: u32) -> Self {
        Kwh(self.0.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero))
    }

    pub fn is_positive(self) -> bool {
        self.0 > Decimal::ZERO
    }
}

impl From<Decimal> for Kwh {
    fn from(value: Decimal) -> Self {
        Kwh(value)
    }
}

impl FromStr for Kwh {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim()).map(Kwh)
    }
}

impl fmt::Display for Kwh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} kWh", self.0.normalize())
    }
}

impl Add for Kwh {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Kwh(self.0 + rhs.0)
    }
}

impl Sub for Kwh {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Kwh(self.0 - rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn kwh(s: &str) -> Kwh {
        s.parse().unwrap()
    }

    #[test]
    fn decimal_places_ignores_trailing_zeros() {
        assert_eq!(kwh("1245.8").decimal_places(), 1);
        assert_eq!(kwh("1245.800").decimal_places(), 1);
        assert_eq!(kwh("1245").decimal_places(), 0);
        assert_eq!(kwh("0.1234").decimal_places(), 4);
    }

    #[test]
    fn round_dp_rounds_half_away_from_zero() {
        assert_eq!(kwh("0.125").round_dp(2), kwh("0.13"));
        assert_eq!(kwh("0.135").round_dp(2), kwh("0.14"));
        assert_eq!(kwh("10.004").round_dp(2), kwh("10.00"));
    }

    #[test]
    fn display_normalizes() {
        assert_eq!(kwh("1245.80").to_string(), "1245.8 kWh");
        assert_eq!(Kwh::zero().to_string(), "0 kWh");
    }

    #[test]
    fn arithmetic_is_exact() {
        let diff = kwh("1250.3") - kwh("1245.1");
        assert_eq!(diff.value(), Decimal::new(52, 1));
        assert_eq!((kwh("0.1") + kwh("0.2")).value(), Decimal::new(3, 1));
    }
}
