/*
 * Virtual Time
 *
 * The simulator's clock is exact: every duration and timestamp is a rational
 * number. Scheduling decisions (CFS slices in particular) produce fractions
 * like 30 * 1000/1250, and accumulating those in floating point would drift
 * and eventually flip comparisons. All arithmetic here goes through
 * num::rational::Ratio, which normalizes on every operation.
 *
 * Time values may be negative: a frame timeout that is overrun by an atomic
 * context switch goes below zero until the interrupt is serviced. The
 * simulation clock itself only ever moves forward.
 */

use core::fmt;
use core::iter::Sum;
use core::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

use num::rational::Ratio;
use num::{Signed, Zero};
use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeTuple, Serializer};

/// An exact rational point in (or span of) virtual time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(Ratio<i64>);

impl Time {
    /// Zero time.
    pub const fn zero() -> Time {
        // Ratio::new_raw is const; 0/1 is already reduced.
        Time(Ratio::new_raw(0, 1))
    }

    /// Create a time from a whole number of units.
    pub fn from_integer(units: i64) -> Time {
        Time(Ratio::from_integer(units))
    }

    /// Create a time from a fraction of units.
    ///
    /// # Panics
    /// Panics if `denom` is zero.
    pub fn new(numer: i64, denom: i64) -> Time {
        Time(Ratio::new(numer, denom))
    }

    /// Numerator of the reduced fraction.
    pub fn numer(self) -> i64 {
        *self.0.numer()
    }

    /// Denominator of the reduced fraction. Always positive.
    pub fn denom(self) -> i64 {
        *self.0.denom()
    }

    /// Whether this is exactly zero.
    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Whether this is strictly positive.
    pub fn is_positive(self) -> bool {
        self.0.is_positive()
    }

    /// Whether this is strictly negative.
    pub fn is_negative(self) -> bool {
        self.0.is_negative()
    }

    /// Smaller of two times.
    pub fn min(self, other: Time) -> Time {
        if self <= other { self } else { other }
    }

    /// Larger of two times.
    pub fn max(self, other: Time) -> Time {
        if self >= other { self } else { other }
    }

    /// Largest integer not above this time.
    pub fn floor(self) -> i64 {
        self.0.floor().to_integer()
    }

    /// Approximate value for display purposes only.
    ///
    /// Never feed this back into scheduling decisions.
    pub fn to_f64(self) -> f64 {
        *self.0.numer() as f64 / *self.0.denom() as f64
    }
}

impl Default for Time {
    fn default() -> Self {
        Time::zero()
    }
}

impl From<i64> for Time {
    fn from(units: i64) -> Self {
        Time::from_integer(units)
    }
}

impl Add for Time {
    type Output = Time;
    fn add(self, rhs: Time) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl AddAssign for Time {
    fn add_assign(&mut self, rhs: Time) {
        self.0 += rhs.0;
    }
}

impl Sub for Time {
    type Output = Time;
    fn sub(self, rhs: Time) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl SubAssign for Time {
    fn sub_assign(&mut self, rhs: Time) {
        self.0 -= rhs.0;
    }
}

impl Mul for Time {
    type Output = Time;
    fn mul(self, rhs: Time) -> Time {
        Time(self.0 * rhs.0)
    }
}

impl Div for Time {
    type Output = Time;
    fn div(self, rhs: Time) -> Time {
        Time(self.0 / rhs.0)
    }
}

impl Neg for Time {
    type Output = Time;
    fn neg(self) -> Time {
        Time(-self.0)
    }
}

impl Sum for Time {
    fn sum<I: Iterator<Item = Time>>(iter: I) -> Time {
        iter.fold(Time::zero(), |acc, t| acc + t)
    }
}

impl fmt::Display for Time {
    /// Whole numbers print without a denominator ("10"), fractions as "n/d".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self.0.denom() == 1 {
            write!(f, "{}", self.0.numer())
        } else {
            write!(f, "{}/{}", self.0.numer(), self.0.denom())
        }
    }
}

// Serialized as a (numer, denom) pair so the binary log stays exact and
// readable by decoders that know nothing about the Ratio type.
impl Serialize for Time {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(self.0.numer())?;
        tup.serialize_element(self.0.denom())?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Time {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (numer, denom) = <(i64, i64)>::deserialize(deserializer)?;
        if denom == 0 {
            return Err(de::Error::custom("time with zero denominator"));
        }
        Ok(Time::new(numer, denom))
    }
}
