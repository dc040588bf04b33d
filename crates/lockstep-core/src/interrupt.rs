//! Interrupt signals delivered into suspended computations.
//!
//! An [`Interrupt`] is a one-shot signal targeted at a specific suspended
//! computation. It is scheduled on the loop like any other resumption and
//! is thrown into the computation at the suspension point where it waits.
//! Interrupts are compared by identity: two interrupts with equal fields
//! are still different signals.
//!
//! Two kinds of interrupt exist, distinguished by their [`Subject`]:
//!
//! - **Cancellation** of an activity, raised by [`Activity::cancel`].
//! - **Wake-up** of a task waiting on a condition, raised when the
//!   condition becomes true.
//!
//! A scheduled interrupt may be revoked before delivery. A revoked
//! interrupt is skipped by the loop and never delivered.
//!
//! [`Activity::cancel`]: crate::activity::Activity::cancel

use std::cell::Cell;
use std::rc::Rc;

use lockstep_types::{ActivityId, InterruptId, TaskId};

/// Errors raised by interrupt bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterruptError {
    /// The interrupt has already been delivered.
    #[error("{interrupt} was already delivered and cannot be revoked")]
    AlreadyDelivered {
        /// The interrupt that was delivered.
        interrupt: InterruptId,
    },
}

/// What an interrupt is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// Cancellation of the given activity.
    Activity(ActivityId),
    /// Wake-up of the given task from a condition wait.
    Wakeup(TaskId),
}

impl core::fmt::Display for Subject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Activity(activity) => write!(f, "cancel {activity}"),
            Self::Wakeup(task) => write!(f, "wake {task}"),
        }
    }
}

#[derive(Debug)]
struct Signal {
    id: InterruptId,
    subject: Subject,
    token: Option<String>,
    scheduled: Cell<bool>,
    revoked: Cell<bool>,
    delivered: Cell<bool>,
}

/// A one-shot signal with identity.
///
/// Cloning an interrupt yields another handle to the same signal.
#[derive(Debug, Clone)]
pub struct Interrupt {
    signal: Rc<Signal>,
}

impl Interrupt {
    pub(crate) fn new(id: InterruptId, subject: Subject, token: Option<String>) -> Self {
        Self {
            signal: Rc::new(Signal {
                id,
                subject,
                token,
                scheduled: Cell::new(false),
                revoked: Cell::new(false),
                delivered: Cell::new(false),
            }),
        }
    }

    /// Return the loop-unique id of this interrupt.
    pub fn id(&self) -> InterruptId {
        self.signal.id
    }

    /// Return what this interrupt is about.
    pub fn subject(&self) -> Subject {
        self.signal.subject
    }

    /// Return the caller-supplied reason, if any.
    pub fn token(&self) -> Option<&str> {
        self.signal.token.as_deref()
    }

    /// Whether this interrupt has been handed to the loop.
    pub fn is_scheduled(&self) -> bool {
        self.signal.scheduled.get()
    }

    /// Whether this interrupt was revoked before delivery.
    pub fn is_revoked(&self) -> bool {
        self.signal.revoked.get()
    }

    /// Whether this interrupt has been thrown into its target.
    pub fn is_delivered(&self) -> bool {
        self.signal.delivered.get()
    }

    /// Whether this interrupt is scheduled and will still be delivered.
    pub fn is_pending(&self) -> bool {
        self.is_scheduled() && self.is_deliverable()
    }

    /// Prevent a scheduled interrupt from being delivered.
    ///
    /// Revoking twice, or revoking an interrupt that was never scheduled,
    /// is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`InterruptError::AlreadyDelivered`] if the interrupt has
    /// already reached its target.
    pub fn revoke(&self) -> Result<(), InterruptError> {
        if self.is_delivered() {
            return Err(InterruptError::AlreadyDelivered {
                interrupt: self.id(),
            });
        }
        self.signal.revoked.set(true);
        Ok(())
    }

    /// Whether `other` is a handle to the same signal.
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.signal, &other.signal)
    }

    pub(crate) fn is_deliverable(&self) -> bool {
        !self.is_revoked() && !self.is_delivered()
    }

    pub(crate) fn mark_scheduled(&self) {
        self.signal.scheduled.set(true);
    }

    pub(crate) fn mark_delivered(&self) {
        self.signal.delivered.set(true);
    }

    /// Revoke the interrupt if it has not been delivered yet.
    pub(crate) fn withdraw(&self) {
        if !self.is_delivered() {
            self.signal.revoked.set(true);
        }
    }
}

impl PartialEq for Interrupt {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Interrupt {}

impl core::fmt::Display for Interrupt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.signal.id, self.signal.subject)?;
        if let Some(token) = &self.signal.token {
            write!(f, ": {token}")?;
        }
        Ok(())
    }
}
