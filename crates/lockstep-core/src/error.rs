//! Errors that flow through simulated computations.
//!
//! Computations running on the loop return `Result<T, Fault>`. A [`Fault`]
//! is either an [`Interrupt`] thrown in at a suspension point or an
//! ordinary [`Failure`]. Any `std::error::Error` converts into a `Fault`
//! with `?`, and so does an interrupt, so activity bodies propagate both
//! the same way.
//!
//! When an activity finishes, its fault is folded into an
//! [`ActivityError`]: its own cancellation becomes
//! [`ActivityError::Cancelled`], everything else becomes
//! [`ActivityError::Failed`].

use std::any::Any;
use std::rc::Rc;

use lockstep_types::ActivityId;

use crate::interrupt::Interrupt;

/// Result type of computations running on the loop.
pub type TaskResult<T> = Result<T, Fault>;

/// Why a simulated computation stopped early.
///
/// `Fault` must not implement `std::error::Error`: the blanket `From` impl
/// below relies on it.
#[derive(Debug, Clone)]
pub enum Fault {
    /// An interrupt was thrown in at a suspension point and not handled.
    Interrupted(Interrupt),
    /// The computation failed with an ordinary error.
    Failed(Failure),
}

impl Fault {
    /// Build a failure fault from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(Failure::msg(message))
    }

    /// Return the interrupt, if this fault is one.
    pub const fn as_interrupt(&self) -> Option<&Interrupt> {
        match self {
            Self::Interrupted(signal) => Some(signal),
            Self::Failed(_) => None,
        }
    }

    /// Return the failure, if this fault is one.
    pub const fn as_failure(&self) -> Option<&Failure> {
        match self {
            Self::Interrupted(_) => None,
            Self::Failed(failure) => Some(failure),
        }
    }
}

impl From<Interrupt> for Fault {
    fn from(signal: Interrupt) -> Self {
        Self::Interrupted(signal)
    }
}

impl<E: std::error::Error + 'static> From<E> for Fault {
    fn from(error: E) -> Self {
        Self::Failed(Failure::new(error))
    }
}

impl core::fmt::Display for Fault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Interrupted(signal) => write!(f, "interrupted by {signal}"),
            Self::Failed(failure) => core::fmt::Display::fmt(failure, f),
        }
    }
}

/// A shareable error value.
///
/// Cloning a failure shares the underlying error, so every party awaiting
/// a failed activity observes the very same error.
#[derive(Clone)]
pub struct Failure {
    error: Rc<dyn std::error::Error>,
}

impl Failure {
    /// Wrap an error. Wrapping a `Failure` returns it unchanged.
    pub fn new<E: std::error::Error + 'static>(error: E) -> Self {
        let any: &dyn Any = &error;
        if let Some(failure) = any.downcast_ref::<Self>() {
            return failure.clone();
        }
        Self {
            error: Rc::new(error),
        }
    }

    /// Build a failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Borrow the wrapped error as a concrete type.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.error.downcast_ref::<E>()
    }

    /// Whether both failures share the same underlying error.
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.error, &other.error)
    }
}

impl core::fmt::Debug for Failure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&*self.error, f)
    }
}

impl core::fmt::Display for Failure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&*self.error, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// A failure described only by its message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Message(pub String);

/// An activity finished because it was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{activity} was cancelled{}", .token.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
pub struct Cancelled {
    /// The cancelled activity.
    pub activity: ActivityId,
    /// The reason supplied to the cancellation, if any.
    pub token: Option<String>,
}

/// Why an activity did not produce a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActivityError {
    /// The activity was cancelled, before it started or while it ran.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// The activity body failed with an error other than its own
    /// cancellation.
    #[error("{0}")]
    Failed(Failure),

    /// The activity was closed before its body finished.
    #[error("{activity} was closed before it finished")]
    Closed {
        /// The closed activity.
        activity: ActivityId,
    },
}

impl ActivityError {
    /// Whether this error is a cancellation.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Re-raise this error inside another computation.
    ///
    /// A body failure is re-raised as the very same failure.
    pub fn to_fault(&self) -> Fault {
        match self {
            Self::Failed(failure) => Fault::Failed(failure.clone()),
            other => Fault::Failed(Failure::new(other.clone())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use lockstep_types::{InterruptId, TaskId};

    use super::*;
    use crate::interrupt::Subject;

    #[derive(Debug, thiserror::Error)]
    #[error("bad coffee")]
    struct BadCoffee;

    fn returns_std_error() -> TaskResult<u8> {
        let brewed: Result<u8, BadCoffee> = Err(BadCoffee);
        Ok(brewed?)
    }

    #[test]
    fn std_errors_lift_into_failures() {
        let fault = returns_std_error().unwrap_err();
        let failure = fault.as_failure().unwrap();
        assert!(failure.downcast_ref::<BadCoffee>().is_some());
        assert_eq!(fault.to_string(), "bad coffee");
    }

    #[test]
    fn interrupts_lift_into_interrupted() {
        let signal = Interrupt::new(
            InterruptId::new(1),
            Subject::Wakeup(TaskId::new(0)),
            None,
        );
        let fault = Fault::from(signal.clone());
        assert!(fault.as_interrupt().unwrap().same(&signal));
    }

    #[test]
    fn wrapping_a_failure_keeps_identity() {
        let original = Failure::msg("boom");
        let rewrapped = Failure::new(original.clone());
        assert!(rewrapped.same(&original));
    }

    #[test]
    fn failed_activity_reraises_same_failure() {
        let failure = Failure::msg("boom");
        let error = ActivityError::Failed(failure.clone());
        let first = error.to_fault();
        let second = error.to_fault();
        assert!(first.as_failure().unwrap().same(&failure));
        assert!(second.as_failure().unwrap().same(&failure));
    }

    #[test]
    fn cancellation_display_includes_reason() {
        let cancelled = Cancelled {
            activity: ActivityId::new(3),
            token: Some("closing time".to_owned()),
        };
        assert_eq!(cancelled.to_string(), "activity#3 was cancelled: closing time");
        let error = ActivityError::from(cancelled);
        assert!(error.is_cancelled());
        let bare = Cancelled {
            activity: ActivityId::new(3),
            token: None,
        };
        assert_eq!(bare.to_string(), "activity#3 was cancelled");
    }
}
