//! Activities: managed handles around one unit of simulated work.
//!
//! An [`Activity`] wraps a `Future<Output = Result<T, Fault>>`, the
//! *payload*, which the loop drives through a private driver future. The
//! activity tracks the payload's lifecycle, accepts cancellation requests,
//! and records a write-once result that any number of observers can read
//! or await.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──first dispatch──▶ Running ──▶ Success | Failed | Cancelled
//!    └────────────cancel()─────────────────────────────▶ Cancelled
//! ```
//!
//! - Cancelling a `Created` activity records the cancellation at once and
//!   discards the payload without ever polling it.
//! - Cancelling a `Running` activity raises an [`Interrupt`] in its task.
//!   The payload observes it as `Err(Fault::Interrupted(..))` at its next
//!   suspension point; propagating it with `?` ends the activity as
//!   `Cancelled`.
//! - Whatever ends the activity, the result is recorded once, every
//!   cancellation still pending is revoked, and [`Done`] is triggered once.
//!
//! # Completion
//!
//! [`Done`] is the completion condition and [`NotDone`] its complement.
//! They share one state, so `!!done == done` holds by identity.

use std::cell::{Cell, RefCell};
use std::future::{Future, IntoFuture};
use std::ops::Not;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use lockstep_types::{ActivityId, ActivityState, TaskId};
use tracing::{debug, trace, warn};

use crate::condition::{Condition, Notification, SharedCondition};
use crate::error::{ActivityError, Cancelled, Fault};
use crate::interrupt::{Interrupt, Subject};
use crate::scheduler::{Computation, Handle, WeakHandle};

// ---------------------------------------------------------------------------
// Done / NotDone
// ---------------------------------------------------------------------------

struct DoneState {
    activity: ActivityId,
    triggered: Cell<bool>,
    waiters: Notification,
    core: WeakHandle,
}

/// Condition that becomes true once an activity has finished.
///
/// Triggered exactly once over its lifetime. Compared by identity.
#[derive(Clone)]
pub struct Done {
    state: Rc<DoneState>,
}

/// Complement of [`Done`]: true while the activity has not finished.
///
/// Once false it never becomes true again, so awaiting it after the
/// activity finished suspends until cancelled.
#[derive(Clone)]
pub struct NotDone {
    state: Rc<DoneState>,
}

impl Done {
    pub(crate) fn new(activity: ActivityId, core: WeakHandle) -> Self {
        Self {
            state: Rc::new(DoneState {
                activity,
                triggered: Cell::new(false),
                waiters: Notification::new(),
                core,
            }),
        }
    }

    /// The activity this condition belongs to.
    pub fn activity(&self) -> ActivityId {
        self.state.activity
    }

    /// Whether the activity has finished.
    pub fn is_done(&self) -> bool {
        self.state.triggered.get()
    }

    /// Mark the activity finished and wake every waiter.
    ///
    /// # Panics
    ///
    /// Panics if already triggered: two completions of one activity mean
    /// the driver is broken.
    pub(crate) fn trigger(&self) {
        assert!(
            !self.state.triggered.get(),
            "completion of {} triggered twice",
            self.state.activity
        );
        self.state.triggered.set(true);
        match self.state.core.upgrade() {
            Some(handle) => {
                let woken = self.state.waiters.awake_all(&handle);
                trace!(activity = %self.state.activity, woken, "Completion triggered");
            }
            None => self.state.waiters.clear(),
        }
    }
}

impl Condition for Done {
    fn is_true(&self) -> bool {
        self.is_done()
    }

    fn subscribe(&self, _handle: &Handle, waiter: TaskId, wakeup: &Interrupt) {
        self.state.waiters.subscribe(waiter, wakeup);
    }

    fn unsubscribe(&self, waiter: TaskId, wakeup: &Interrupt) {
        self.state.waiters.unsubscribe(waiter, wakeup);
    }

    fn invert(&self) -> SharedCondition {
        Rc::new(!self)
    }
}

impl Condition for NotDone {
    fn is_true(&self) -> bool {
        !self.state.triggered.get()
    }

    fn subscribe(&self, _handle: &Handle, _waiter: TaskId, _wakeup: &Interrupt) {}

    fn unsubscribe(&self, _waiter: TaskId, _wakeup: &Interrupt) {}

    fn invert(&self) -> SharedCondition {
        Rc::new(!self)
    }
}

impl Not for Done {
    type Output = NotDone;

    fn not(self) -> NotDone {
        NotDone { state: self.state }
    }
}

impl Not for &Done {
    type Output = NotDone;

    fn not(self) -> NotDone {
        NotDone {
            state: Rc::clone(&self.state),
        }
    }
}

impl Not for NotDone {
    type Output = Done;

    fn not(self) -> Done {
        Done { state: self.state }
    }
}

impl Not for &NotDone {
    type Output = Done;

    fn not(self) -> Done {
        Done {
            state: Rc::clone(&self.state),
        }
    }
}

impl PartialEq for Done {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for Done {}

impl PartialEq for NotDone {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for NotDone {}

impl core::fmt::Debug for Done {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Done")
            .field("activity", &self.state.activity)
            .field("done", &self.state.triggered.get())
            .field("waiters", &self.state.waiters.len())
            .finish()
    }
}

impl core::fmt::Debug for NotDone {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NotDone")
            .field("activity", &self.state.activity)
            .field("done", &self.state.triggered.get())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Shared activity state
// ---------------------------------------------------------------------------

struct Shared<T> {
    id: ActivityId,
    task: TaskId,
    core: WeakHandle,
    started: Cell<bool>,
    result: RefCell<Option<Result<T, ActivityError>>>,
    cancellations: RefCell<Vec<Interrupt>>,
    done: Done,
}

impl<T> Shared<T> {
    fn is_recorded(&self) -> bool {
        self.result.borrow().is_some()
    }

    fn status(&self) -> ActivityState {
        match &*self.result.borrow() {
            None if self.started.get() => ActivityState::Running,
            None => ActivityState::Created,
            Some(Ok(_)) => ActivityState::Success,
            Some(Err(ActivityError::Cancelled(_))) => ActivityState::Cancelled,
            Some(Err(_)) => ActivityState::Failed,
        }
    }

    /// Fold the payload's outcome into a result.
    #[allow(clippy::panic)]
    fn settle(&self, outcome: Result<T, Fault>) -> Result<T, ActivityError> {
        match outcome {
            Ok(value) => Ok(value),
            Err(Fault::Failed(failure)) => Err(ActivityError::Failed(failure)),
            Err(Fault::Interrupted(signal)) => match signal.subject() {
                Subject::Activity(target) if target == self.id => Err(Cancelled {
                    activity: self.id,
                    token: signal.token().map(str::to_owned),
                }
                .into()),
                other => panic!(
                    "{} stopped on {signal} meant for {other}: interrupt was misrouted",
                    self.id
                ),
            },
        }
    }

    /// Record the result, revoke pending cancellations and trigger
    /// completion.
    fn finish(&self, result: Result<T, ActivityError>) {
        {
            let mut slot = self.result.borrow_mut();
            assert!(slot.is_none(), "{} recorded a second result", self.id);
            *slot = Some(result);
        }
        for signal in self.cancellations.borrow_mut().drain(..) {
            signal.withdraw();
        }
        debug!(activity = %self.id, status = %self.status(), "Activity finished");
        self.done.trigger();
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// The computation the loop owns for one activity.
struct Driver<T> {
    shared: Rc<Shared<T>>,
    payload: Option<LocalBoxFuture<'static, Result<T, Fault>>>,
}

impl<T> Future for Driver<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.shared.is_recorded() {
            // closed while suspended; discard the payload quietly
            this.payload = None;
            if let Some(handle) = this.shared.core.upgrade() {
                handle.take_delivery();
            }
            return Poll::Ready(());
        }
        let Some(payload) = this.payload.as_mut() else {
            return Poll::Ready(());
        };
        if !this.shared.started.replace(true) {
            trace!(activity = %this.shared.id, "Activity started");
        }
        match payload.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(outcome) => {
                this.payload = None;
                if this.shared.is_recorded() {
                    trace!(activity = %this.shared.id, "Activity closed itself before returning");
                    return Poll::Ready(());
                }
                let result = this.shared.settle(outcome);
                this.shared.finish(result);
                Poll::Ready(())
            }
        }
    }
}

impl<T> Drop for Driver<T> {
    fn drop(&mut self) {
        let Some(payload) = self.payload.take() else {
            return;
        };
        drop(payload);
        if !self.shared.is_recorded() {
            warn!(
                activity = %self.shared.id,
                status = %self.shared.status(),
                "Force-closing abandoned activity"
            );
            self.shared.finish(Err(ActivityError::Closed {
                activity: self.shared.id,
            }));
        }
    }
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// A managed handle around one unit of simulated work.
///
/// Cloning an activity yields another handle to the same work. Created by
/// [`Handle::spawn`] and its siblings.
pub struct Activity<T> {
    shared: Rc<Shared<T>>,
}

impl<T: 'static> Activity<T> {
    /// Wrap `payload` without starting it. Returns the handle and the
    /// computation the loop must own.
    pub(crate) fn launch<F>(
        handle: &Handle,
        id: ActivityId,
        task: TaskId,
        payload: F,
    ) -> (Self, Computation)
    where
        F: Future<Output = Result<T, Fault>> + 'static,
    {
        let core = handle.downgrade();
        let shared = Rc::new(Shared {
            id,
            task,
            core: core.clone(),
            started: Cell::new(false),
            result: RefCell::new(None),
            cancellations: RefCell::new(Vec::new()),
            done: Done::new(id, core),
        });
        let driver = Driver {
            shared: Rc::clone(&shared),
            payload: Some(Box::pin(payload)),
        };
        (Self { shared }, Box::pin(driver))
    }
}

impl<T> Activity<T> {
    /// The loop-unique id of this activity.
    pub fn id(&self) -> ActivityId {
        self.shared.id
    }

    /// The task the loop uses to drive this activity.
    pub fn task(&self) -> TaskId {
        self.shared.task
    }

    /// The current lifecycle state, derived from the recorded result and
    /// whether the payload has started.
    pub fn status(&self) -> ActivityState {
        self.shared.status()
    }

    /// Whether the activity has stopped running for any reason.
    pub fn is_finished(&self) -> bool {
        self.shared.done.is_done()
    }

    /// The completion condition.
    pub fn done(&self) -> Done {
        self.shared.done.clone()
    }

    /// The complement of the completion condition.
    pub fn not_done(&self) -> NotDone {
        !&self.shared.done
    }

    /// Number of cancellations raised but not delivered yet.
    pub fn pending_cancellations(&self) -> usize {
        self.shared
            .cancellations
            .borrow()
            .iter()
            .filter(|signal| signal.is_pending())
            .count()
    }

    /// Request cancellation.
    ///
    /// Safe to call any number of times; only the first delivered
    /// cancellation ends the activity, and cancelling a finished activity
    /// does nothing.
    pub fn cancel(&self) {
        self.request_cancel(None);
    }

    /// Request cancellation, attaching `reason` to the interrupt.
    pub fn cancel_with(&self, reason: impl Into<String>) {
        self.request_cancel(Some(reason.into()));
    }

    fn request_cancel(&self, token: Option<String>) {
        let id = self.id();
        match self.status() {
            ActivityState::Created => {
                debug!(activity = %id, "Activity cancelled before it started");
                self.shared.finish(Err(Cancelled { activity: id, token }.into()));
                self.discard_payload();
            }
            ActivityState::Running => {
                let Some(handle) = self.shared.core.upgrade() else {
                    warn!(activity = %id, "Cannot cancel activity of a dropped loop");
                    return;
                };
                let signal = handle.new_interrupt(Subject::Activity(id), token);
                self.shared.cancellations.borrow_mut().push(signal.clone());
                handle.raise_in(self.task(), &signal);
                debug!(activity = %id, interrupt = %signal.id(), "Cancellation requested");
            }
            ActivityState::Cancelled | ActivityState::Failed | ActivityState::Success => {
                trace!(activity = %id, "Ignoring cancellation of finished activity");
            }
        }
    }

    /// Stop the activity without running its completion path.
    ///
    /// Records [`ActivityError::Closed`], wakes every waiter and drops the
    /// payload. Closing a finished activity does nothing.
    pub fn close(&self) {
        if self.shared.is_recorded() {
            return;
        }
        debug!(activity = %self.id(), status = %self.status(), "Closing activity");
        self.shared.finish(Err(ActivityError::Closed {
            activity: self.id(),
        }));
        self.discard_payload();
    }

    fn discard_payload(&self) {
        if let Some(handle) = self.shared.core.upgrade()
            && let Some(driver) = handle.remove_task(self.task())
        {
            drop(driver);
        }
    }
}

impl<T: Clone> Activity<T> {
    /// The recorded result, without suspending. `None` while not finished.
    pub fn outcome(&self) -> Option<Result<T, ActivityError>> {
        self.shared.result.borrow().clone()
    }

    /// Suspend until the activity finishes, then return its value or
    /// re-raise its error.
    ///
    /// Every caller observes the same outcome; a body failure is re-raised
    /// as the very same [`Failure`](crate::error::Failure).
    pub async fn result(&self) -> Result<T, Fault> {
        self.shared.done.wait().await?;
        match self.outcome() {
            Some(result) => result.map_err(|error| error.to_fault()),
            None => Err(ActivityError::Closed {
                activity: self.id(),
            }
            .to_fault()),
        }
    }
}

impl<'a, T: Clone + 'static> IntoFuture for &'a Activity<T> {
    type Output = Result<T, Fault>;
    type IntoFuture = LocalBoxFuture<'a, Result<T, Fault>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.result())
    }
}

impl<T> Clone for Activity<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T> core::fmt::Debug for Activity<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.shared.id)
            .field("task", &self.shared.task)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
