//! Virtual clock for the Lockstep runtime.
//!
//! The clock is the single source of truth for all temporal state in a
//! simulation. It holds the current virtual [`Time`] and a turn counter
//! that orders the batches of work dispatched at the same time.
//!
//! # Design Principles
//!
//! - All temporal arithmetic is checked (no silent overflow).
//! - Time never moves backwards. Moving to a later time resets the turn
//!   counter; every dispatched batch increments it, so the [`Turnstamp`]
//!   strictly increases from batch to batch.
//! - The clock never reads the wall clock. It only moves when the
//!   scheduler tells it to.

use lockstep_types::{Time, Turnstamp};

/// Errors that can occur during clock operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    /// The turn counter would overflow.
    #[error("turn counter overflow at time {time}")]
    TurnOverflow {
        /// The time at which the counter ran out.
        time: Time,
    },

    /// A requested time lies before the current time.
    #[error("time cannot move backwards: now {now}, requested {requested}")]
    Backwards {
        /// The current time.
        now: Time,
        /// The time that was requested.
        requested: Time,
    },

    /// Adding a delay to the current time overflowed.
    #[error("time overflow adding {delay} to {now}")]
    TimeOverflow {
        /// The current time.
        now: Time,
        /// The delay that could not be added.
        delay: Time,
    },
}

/// Virtual clock tracking `(time, turn)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualClock {
    /// Current virtual time.
    time: Time,

    /// Number of batches dispatched at the current time.
    turn: u64,
}

impl VirtualClock {
    /// Create a clock at `start`, before the first turn.
    pub const fn new(start: Time) -> Self {
        Self {
            time: start,
            turn: 0,
        }
    }

    /// Return the current time.
    pub const fn time(&self) -> Time {
        self.time
    }

    /// Return the current turn.
    pub const fn turn(&self) -> u64 {
        self.turn
    }

    /// Return the current `(time, turn)` pair.
    pub const fn turnstamp(&self) -> Turnstamp {
        Turnstamp::new(self.time, self.turn)
    }

    /// Begin the next turn at the current time. Returns the new turnstamp.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::TurnOverflow`] if the counter would exceed
    /// `u64::MAX`.
    pub fn next_turn(&mut self) -> Result<Turnstamp, ClockError> {
        self.turn = self
            .turn
            .checked_add(1)
            .ok_or(ClockError::TurnOverflow { time: self.time })?;
        Ok(self.turnstamp())
    }

    /// Move the clock to `target` and reset the turn counter.
    ///
    /// Moving to the current time is a no-op and keeps the turn counter.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Backwards`] if `target` lies before the current
    /// time.
    pub fn advance_to(&mut self, target: Time) -> Result<Turnstamp, ClockError> {
        if target < self.time {
            return Err(ClockError::Backwards {
                now: self.time,
                requested: target,
            });
        }
        if target > self.time {
            self.time = target;
            self.turn = 0;
        }
        Ok(self.turnstamp())
    }

    /// Compute the absolute time `delay` after now.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Backwards`] for a negative delay and
    /// [`ClockError::TimeOverflow`] if the sum overflows.
    pub fn deadline_after(&self, delay: Time) -> Result<Time, ClockError> {
        if delay.is_negative() {
            return Err(ClockError::Backwards {
                now: self.time,
                requested: self.time.checked_add(delay).unwrap_or(Time::ZERO),
            });
        }
        self.time
            .checked_add(delay)
            .ok_or(ClockError::TimeOverflow {
                now: self.time,
                delay,
            })
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new(Time::ZERO)
    }
}
