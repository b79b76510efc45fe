//! Fixed-point money.
//!
//! All monetary amounts are integer cents. Event payloads carry them as
//! base-10 digit strings so nothing round-trips through JSON floats.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Integer cents. i64 covers every total this program can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cents(i64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    #[inline]
    pub const fn new(cents: i64) -> Self {
        Self(cents)
    }

    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, rhs: Cents) -> Option<Cents> {
        self.0.checked_add(rhs.0).map(Cents)
    }

    pub fn checked_sub(self, rhs: Cents) -> Option<Cents> {
        self.0.checked_sub(rhs.0).map(Cents)
    }

    /// `max(self - rhs, 0)`, the shortfall/surplus shape used by matching funds.
    pub fn saturating_sub_floor_zero(self, rhs: Cents) -> Cents {
        Cents(self.0.saturating_sub(rhs.0).max(0))
    }
}

impl Add for Cents {
    type Output = Cents;
    fn add(self, rhs: Cents) -> Cents {
        Cents(self.0 + rhs.0)
    }
}

impl Sub for Cents {
    type Output = Cents;
    fn sub(self, rhs: Cents) -> Cents {
        Cents(self.0 - rhs.0)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cents {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.is_empty() {
            return Err("empty money string".to_string());
        }
        let digits = t.strip_prefix('-').unwrap_or(t);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("not a decimal digit string: {:?}", s));
        }
        t.parse::<i64>().map(Cents).map_err(|e| e.to_string())
    }
}

// Event payloads carry money as digit strings, never JSON numbers.
impl Serialize for Cents {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Cents {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Reimbursement rate as an exact fraction.
///
/// Applied with half-up rounding on integer cents:
/// `(amount * numerator + denominator / 2) / denominator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateFraction {
    pub numerator: i64,
    pub denominator: i64,
}

impl RateFraction {
    pub fn new(numerator: i64, denominator: i64) -> Result<Self, String> {
        if denominator == 0 {
            return Err("rate denominator must be non-zero".to_string());
        }
        if numerator < 0 || denominator < 0 {
            return Err("rate components must be non-negative".to_string());
        }
        Ok(Self { numerator, denominator })
    }

    /// One-to-one rate.
    pub const fn whole() -> Self {
        Self { numerator: 1, denominator: 1 }
    }

    /// Apply this rate to an eligible amount, rounding half-up.
    pub fn apply(self, amount: Cents) -> Cents {
        let num = self.numerator as i128;
        let den = self.denominator as i128;
        let scaled = amount.get() as i128 * num + den / 2;
        Cents((scaled / den) as i64)
    }
}
