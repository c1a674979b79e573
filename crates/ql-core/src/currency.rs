//! Fixed-point currency.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// An amount in millionths of a US dollar.
///
/// Integer arithmetic keeps repeated absolute writes free of float drift.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MicroUsd(pub i64);

impl MicroUsd {
    /// One US dollar.
    pub const USD: Self = Self(1_000_000);
    pub const ZERO: Self = Self(0);

    pub const fn micros(self) -> i64 {
        self.0
    }

    /// The amount in micro-units as a float, for comparisons in conditions.
    #[expect(
        clippy::cast_precision_loss,
        reason = "amounts above 2^53 micro-dollars are not realistic"
    )]
    pub fn as_f64(self) -> f64 {
        self.0 as f64
    }
}

impl Add for MicroUsd {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for MicroUsd {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for MicroUsd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}${}.{:06}", abs / 1_000_000, abs % 1_000_000)
    }
}
