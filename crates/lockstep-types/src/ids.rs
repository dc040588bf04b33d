//! Type-safe identifier wrappers around sequential `u64` counters.
//!
//! Every entity the runtime tracks has a strongly-typed ID to prevent
//! accidental mixing of identifiers at compile time. IDs are handed out by
//! the loop in allocation order, never from a random or wall-clock source,
//! so two runs of the same simulation assign the same IDs to the same
//! entities.

use serde::{Deserialize, Serialize};

/// Generates a newtype wrapper around `u64` with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident, $prefix:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Create an identifier from its raw sequence number.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Return the raw sequence number.
            pub const fn into_inner(self) -> u64 {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}#{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Identifier of a computation owned by the scheduler.
    TaskId, "task"
}

define_id! {
    /// Identifier of an activity (the managed handle around one task).
    ActivityId, "activity"
}

define_id! {
    /// Identifier of a single interrupt signal.
    InterruptId, "interrupt"
}

/// Monotonic allocator for one kind of identifier.
///
/// Allocation saturates at `u64::MAX` instead of wrapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSequence {
    next: u64,
}

impl IdSequence {
    /// Create a sequence starting at zero.
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Return the next raw value and advance the sequence.
    pub const fn next_raw(&mut self) -> u64 {
        let raw = self.next;
        self.next = self.next.saturating_add(1);
        raw
    }

    /// Return how many values have been handed out so far.
    pub const fn allocated(&self) -> u64 {
        self.next
    }
}
