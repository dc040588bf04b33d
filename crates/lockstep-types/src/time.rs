//! Virtual time values.
//!
//! Simulation time has no inherent unit. A simulation picks one (seconds,
//! days, ticks) and uses it consistently. Time is stored as a
//! [`Decimal`] so that fractional delays add up exactly and ordering is
//! total -- there is no floating point drift between two runs that perform
//! the same arithmetic in the same order.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A point in (or span of) virtual time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Time(Decimal);

impl Time {
    /// The origin of the time axis.
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// Wrap a decimal value.
    pub const fn new(value: Decimal) -> Self {
        Self(value)
    }

    /// Return the underlying decimal value.
    pub const fn value(self) -> Decimal {
        self.0
    }

    /// Add a delay, returning `None` on overflow.
    pub fn checked_add(self, delay: Self) -> Option<Self> {
        self.0.checked_add(delay.0).map(Self)
    }

    /// Subtract `earlier` from `self`, returning `None` on overflow.
    pub fn checked_sub(self, earlier: Self) -> Option<Self> {
        self.0.checked_sub(earlier.0).map(Self)
    }

    /// Whether this value lies strictly below zero.
    pub fn is_negative(self) -> bool {
        self.0 < Decimal::ZERO
    }
}

impl From<Decimal> for Time {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl From<i64> for Time {
    fn from(value: i64) -> Self {
        Self(Decimal::from(value))
    }
}

impl From<u64> for Time {
    fn from(value: u64) -> Self {
        Self(Decimal::from(value))
    }
}

impl From<u32> for Time {
    fn from(value: u32) -> Self {
        Self(Decimal::from(value))
    }
}

impl core::fmt::Display for Time {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// The precise progress of a simulation as `(time, turn)`.
///
/// `turn` disambiguates batches of work dispatched at the same virtual time.
/// It resets to zero whenever time advances and increments before every
/// batch, so the turnstamps of successive batches strictly increase. Work
/// scheduled for "now" while a batch runs lands in the next batch.
/// Ordering is lexicographic: time first, then turn.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Turnstamp {
    /// Current virtual time.
    pub time: Time,
    /// Batch counter within the current time.
    pub turn: u64,
}

impl Turnstamp {
    /// Create a turnstamp from its parts.
    pub const fn new(time: Time, turn: u64) -> Self {
        Self { time, turn }
    }
}

impl core::fmt::Display for Turnstamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.time, self.turn)
    }
}
