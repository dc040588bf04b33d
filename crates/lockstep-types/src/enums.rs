//! Enumeration types for the Lockstep runtime.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Activity lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of an activity.
///
/// An activity moves `Created -> Running -> {Success | Failed | Cancelled}`.
/// A `Created` activity may also jump straight to `Cancelled` when it is
/// cancelled before its first dispatch. No transition ever leaves one of the
/// three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    /// Created but not dispatched yet; the wrapped work has not run a single step.
    Created,
    /// Started and not finished.
    Running,
    /// Finished because its own cancellation was delivered (or it was
    /// cancelled before it started).
    Cancelled,
    /// Finished with an error unrelated to its own cancellation.
    Failed,
    /// Finished normally.
    Success,
}

impl ActivityState {
    /// Whether the activity has stopped running for any reason.
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Success)
    }
}

impl core::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Success => "success",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Run termination
// ---------------------------------------------------------------------------

/// Why a call to run the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Nothing was left to dispatch.
    Idle,
    /// The next pending deadline lies beyond the requested end time.
    TimeLimit,
}
