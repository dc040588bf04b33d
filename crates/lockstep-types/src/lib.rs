//! Shared type definitions for the Lockstep virtual-time runtime.
//!
//! This crate holds the plain data that flows between the runtime and
//! anything built on top of it: time values, identifiers, and lifecycle
//! enumerations. It has no behavior beyond arithmetic and formatting.
//!
//! # Modules
//!
//! - [`ids`] -- Sequential `u64` wrappers for tasks, activities and interrupts
//! - [`enums`] -- Activity lifecycle state and run termination reasons
//! - [`time`] -- Exact virtual [`Time`] and the `(time, turn)` [`Turnstamp`]

pub mod enums;
pub mod ids;
pub mod time;

// Re-export all public types at crate root for convenience.
pub use enums::{ActivityState, EndReason};
pub use ids::{ActivityId, IdSequence, InterruptId, TaskId};
pub use time::{Time, Turnstamp};
