//! Conditions: boolean-valued events that computations can wait on.
//!
//! A [`Condition`] can be read synchronously ([`Condition::is_true`]) and
//! awaited ([`Condition::wait`]). Waiting on a condition that is already
//! true *postpones* the waiter: it is re-queued at the current time and
//! resumes in the next turn, after everything else that was ready. Waiting
//! on a false condition suspends the waiter until the condition wakes it,
//! after which the condition is checked again.
//!
//! Every condition has a first-class complement ([`Condition::invert`]),
//! and conditions compose with [`All`] and [`Any`].
//!
//! # Modules
//!
//! Conditions defined elsewhere in this crate:
//!
//! - [`Done`] / [`NotDone`] in [`activity`](crate::activity)
//! - [`After`], [`Before`], [`Instant`], [`Eternity`] in
//!   [`timing`](crate::timing)
//!
//! [`Done`]: crate::activity::Done
//! [`NotDone`]: crate::activity::NotDone
//! [`After`]: crate::timing::After
//! [`Before`]: crate::timing::Before
//! [`Instant`]: crate::timing::Instant
//! [`Eternity`]: crate::timing::Eternity

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use lockstep_types::TaskId;
use tracing::trace;

use crate::error::Fault;
use crate::interrupt::{Interrupt, Subject};
use crate::scheduler::{Handle, LoopError, WeakHandle};
use crate::timing::Instant;

/// A condition shared between several owners, such as connectives.
pub type SharedCondition = Rc<dyn Condition>;

/// The kind of a logical connective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Junction {
    /// Logical AND.
    All,
    /// Logical OR.
    Any,
}

/// A boolean-valued event that computations can wait on.
pub trait Condition {
    /// The current value. Must be free of side effects.
    fn is_true(&self) -> bool;

    /// Arrange for `wakeup` to be raised in `waiter` once this condition
    /// may have become true.
    fn subscribe(&self, handle: &Handle, waiter: TaskId, wakeup: &Interrupt);

    /// Undo a previous [`subscribe`](Condition::subscribe).
    fn unsubscribe(&self, waiter: TaskId, wakeup: &Interrupt);

    /// The logical complement of this condition.
    fn invert(&self) -> SharedCondition;

    /// The children of this condition if it is a connective.
    fn junction(&self) -> Option<(Junction, &[SharedCondition])> {
        None
    }

    /// Suspend until this condition is true.
    fn wait(&self) -> Wait<'_, Self>
    where
        Self: Sized,
    {
        Wait::new(self)
    }
}

impl<C: Condition + ?Sized> Condition for Rc<C> {
    fn is_true(&self) -> bool {
        (**self).is_true()
    }

    fn subscribe(&self, handle: &Handle, waiter: TaskId, wakeup: &Interrupt) {
        (**self).subscribe(handle, waiter, wakeup);
    }

    fn unsubscribe(&self, waiter: TaskId, wakeup: &Interrupt) {
        (**self).unsubscribe(waiter, wakeup);
    }

    fn invert(&self) -> SharedCondition {
        (**self).invert()
    }

    fn junction(&self) -> Option<(Junction, &[SharedCondition])> {
        (**self).junction()
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// A list of suspended waiters that can be woken together.
///
/// Waiters are woken in subscription order.
#[derive(Debug, Default)]
pub struct Notification {
    waiting: RefCell<Vec<(TaskId, Interrupt)>>,
}

impl Notification {
    /// Create an empty notification.
    pub const fn new() -> Self {
        Self {
            waiting: RefCell::new(Vec::new()),
        }
    }

    /// Register `waiter` to receive `wakeup`.
    pub fn subscribe(&self, waiter: TaskId, wakeup: &Interrupt) {
        self.waiting.borrow_mut().push((waiter, wakeup.clone()));
    }

    /// Remove the registration of `waiter` for `wakeup`, if present.
    pub fn unsubscribe(&self, waiter: TaskId, wakeup: &Interrupt) {
        self.waiting
            .borrow_mut()
            .retain(|(task, signal)| !(*task == waiter && signal.same(wakeup)));
    }

    /// Wake every registered waiter. Returns how many were woken.
    pub fn awake_all(&self, handle: &Handle) -> usize {
        let woken = std::mem::take(&mut *self.waiting.borrow_mut());
        for (task, wakeup) in &woken {
            handle.raise_in(*task, wakeup);
        }
        woken.len()
    }

    /// Wake the longest-waiting waiter, if any.
    pub fn awake_next(&self, handle: &Handle) -> bool {
        let next = {
            let mut waiting = self.waiting.borrow_mut();
            if waiting.is_empty() {
                None
            } else {
                Some(waiting.remove(0))
            }
        };
        match next {
            Some((task, wakeup)) => {
                handle.raise_in(task, &wakeup);
                true
            }
            None => false,
        }
    }

    /// Number of registered waiters.
    pub fn len(&self) -> usize {
        self.waiting.borrow().len()
    }

    /// Whether no waiter is registered.
    pub fn is_empty(&self) -> bool {
        self.waiting.borrow().is_empty()
    }

    /// Forget every registered waiter without waking it.
    pub(crate) fn clear(&self) {
        self.waiting.borrow_mut().clear();
    }
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

/// Future returned by [`Condition::wait`].
///
/// Resolves to `Ok(())` once the condition was observed true, or to
/// `Err(Fault::Interrupted(..))` if a cancellation was delivered while
/// suspended. Wake-ups belonging to other waits of the same task (as in
/// `futures::join!`) are left for their owner. Dropping a suspended `Wait`
/// withdraws its subscription.
#[must_use = "a condition does nothing unless its wait is awaited"]
pub struct Wait<'a, C: Condition + ?Sized> {
    condition: &'a C,
    state: WaitState,
}

enum WaitState {
    Idle,
    Suspended(Suspension),
    Finished,
}

struct Suspension {
    handle: Handle,
    task: TaskId,
    wakeup: Interrupt,
    postponed: bool,
}

impl Suspension {
    fn release<C: Condition + ?Sized>(&self, condition: &C) {
        condition.unsubscribe(self.task, &self.wakeup);
        self.wakeup.withdraw();
    }
}

impl<'a, C: Condition + ?Sized> Wait<'a, C> {
    /// Create a wait on `condition`. Nothing happens until it is polled.
    pub const fn new(condition: &'a C) -> Self {
        Self {
            condition,
            state: WaitState::Idle,
        }
    }

    fn suspend(&mut self) -> Poll<Result<(), Fault>> {
        let handle = match Handle::current() {
            Ok(handle) => handle,
            Err(error) => return Poll::Ready(Err(error.into())),
        };
        let Some(task) = handle.current_task() else {
            return Poll::Ready(Err(LoopError::NoLoop.into()));
        };
        let wakeup = handle.new_interrupt(Subject::Wakeup(task), None);
        let postponed = self.condition.is_true();
        if postponed {
            handle.raise_in(task, &wakeup);
        } else {
            self.condition.subscribe(&handle, task, &wakeup);
        }
        trace!(task = %task, postponed, "Suspended on condition");
        self.state = WaitState::Suspended(Suspension {
            handle,
            task,
            wakeup,
            postponed,
        });
        Poll::Pending
    }

    fn resume(&mut self, suspension: Suspension) -> Poll<Result<(), Fault>> {
        let Some(signal) = suspension.handle.take_delivery() else {
            self.state = WaitState::Suspended(suspension);
            return Poll::Pending;
        };
        if !signal.same(&suspension.wakeup) {
            if matches!(signal.subject(), Subject::Wakeup(_)) {
                // owned by another suspension point of this task
                suspension.handle.restore_delivery(signal);
                self.state = WaitState::Suspended(suspension);
                return Poll::Pending;
            }
            suspension.release(self.condition);
            return Poll::Ready(Err(Fault::Interrupted(signal)));
        }
        self.condition
            .unsubscribe(suspension.task, &suspension.wakeup);
        if suspension.postponed || self.condition.is_true() {
            return Poll::Ready(Ok(()));
        }
        // woken, but the condition turned false again before we ran
        let wakeup = suspension
            .handle
            .new_interrupt(Subject::Wakeup(suspension.task), None);
        self.condition
            .subscribe(&suspension.handle, suspension.task, &wakeup);
        self.state = WaitState::Suspended(Suspension {
            wakeup,
            postponed: false,
            ..suspension
        });
        Poll::Pending
    }
}

impl<C: Condition + ?Sized> Future for Wait<'_, C> {
    type Output = Result<(), Fault>;

    #[allow(clippy::panic)]
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, WaitState::Finished) {
            WaitState::Idle => this.suspend(),
            WaitState::Suspended(suspension) => this.resume(suspension),
            WaitState::Finished => panic!("`Wait` polled after completion"),
        }
    }
}

impl<C: Condition + ?Sized> Drop for Wait<'_, C> {
    fn drop(&mut self) {
        if let WaitState::Suspended(suspension) = &self.state {
            suspension.release(self.condition);
        }
    }
}

/// Suspend on any condition, including shared ones.
pub fn wait<C: Condition + ?Sized>(condition: &C) -> Wait<'_, C> {
    Wait::new(condition)
}

/// Let every other computation that is ready now run first.
///
/// Resumes in the next turn at the current time.
pub async fn postpone() -> Result<(), Fault> {
    Instant.wait().await
}

// ---------------------------------------------------------------------------
// Connectives
// ---------------------------------------------------------------------------

fn collect_children(
    junction: Junction,
    conditions: impl IntoIterator<Item = SharedCondition>,
) -> Vec<SharedCondition> {
    let mut children: Vec<SharedCondition> = Vec::new();
    let mut push = |child: SharedCondition| {
        if !children.iter().any(|known| Rc::ptr_eq(known, &child)) {
            children.push(child);
        }
    };
    for condition in conditions {
        match condition.junction() {
            Some((kind, nested)) if kind == junction => {
                for child in nested {
                    push(Rc::clone(child));
                }
            }
            _ => push(condition),
        }
    }
    children
}

fn subscribe_false_children(
    children: &[SharedCondition],
    handle: &Handle,
    waiter: TaskId,
    wakeup: &Interrupt,
) {
    for child in children.iter().filter(|child| !child.is_true()) {
        child.subscribe(handle, waiter, wakeup);
    }
}

fn unsubscribe_children(children: &[SharedCondition], waiter: TaskId, wakeup: &Interrupt) {
    for child in children {
        child.unsubscribe(waiter, wakeup);
    }
}

/// True when every child is true.
///
/// Nested `All`s are flattened and duplicate children (by identity) are
/// dropped. `All` of nothing is true.
#[derive(Clone)]
pub struct All {
    children: Vec<SharedCondition>,
}

impl All {
    /// Combine `conditions` with logical AND.
    pub fn new(conditions: impl IntoIterator<Item = SharedCondition>) -> Self {
        Self {
            children: collect_children(Junction::All, conditions),
        }
    }

    /// The flattened children.
    pub fn children(&self) -> &[SharedCondition] {
        &self.children
    }
}

impl Condition for All {
    fn is_true(&self) -> bool {
        self.children.iter().all(|child| child.is_true())
    }

    fn subscribe(&self, handle: &Handle, waiter: TaskId, wakeup: &Interrupt) {
        subscribe_false_children(&self.children, handle, waiter, wakeup);
    }

    fn unsubscribe(&self, waiter: TaskId, wakeup: &Interrupt) {
        unsubscribe_children(&self.children, waiter, wakeup);
    }

    fn invert(&self) -> SharedCondition {
        Rc::new(Any::new(self.children.iter().map(|child| child.invert())))
    }

    fn junction(&self) -> Option<(Junction, &[SharedCondition])> {
        Some((Junction::All, &self.children))
    }
}

/// True when at least one child is true.
///
/// Nested `Any`s are flattened and duplicate children (by identity) are
/// dropped. `Any` of nothing is false.
#[derive(Clone)]
pub struct Any {
    children: Vec<SharedCondition>,
}

impl Any {
    /// Combine `conditions` with logical OR.
    pub fn new(conditions: impl IntoIterator<Item = SharedCondition>) -> Self {
        Self {
            children: collect_children(Junction::Any, conditions),
        }
    }

    /// The flattened children.
    pub fn children(&self) -> &[SharedCondition] {
        &self.children
    }
}

impl Condition for Any {
    fn is_true(&self) -> bool {
        self.children.iter().any(|child| child.is_true())
    }

    fn subscribe(&self, handle: &Handle, waiter: TaskId, wakeup: &Interrupt) {
        subscribe_false_children(&self.children, handle, waiter, wakeup);
    }

    fn unsubscribe(&self, waiter: TaskId, wakeup: &Interrupt) {
        unsubscribe_children(&self.children, waiter, wakeup);
    }

    fn invert(&self) -> SharedCondition {
        Rc::new(All::new(self.children.iter().map(|child| child.invert())))
    }

    fn junction(&self) -> Option<(Junction, &[SharedCondition])> {
        Some((Junction::Any, &self.children))
    }
}

// ---------------------------------------------------------------------------
// Flag
// ---------------------------------------------------------------------------

struct FlagState {
    value: Cell<bool>,
    raised: Notification,
    lowered: Notification,
    core: WeakHandle,
}

impl FlagState {
    fn set(&self, to: bool) {
        if self.value.replace(to) == to {
            return;
        }
        let waiters = if to { &self.raised } else { &self.lowered };
        match self.core.upgrade() {
            Some(handle) => {
                let woken = waiters.awake_all(&handle);
                trace!(value = to, woken, "Flag changed");
            }
            None => waiters.clear(),
        }
    }
}

/// An explicitly settable condition.
///
/// Setting the flag wakes everyone waiting for it to be raised; clearing it
/// wakes everyone waiting on its inverse. Setting it to its current value
/// does nothing.
#[derive(Clone)]
pub struct Flag {
    state: Rc<FlagState>,
}

impl Flag {
    /// Create a lowered flag bound to the loop behind `handle`.
    pub fn new(handle: &Handle) -> Self {
        Self {
            state: Rc::new(FlagState {
                value: Cell::new(false),
                raised: Notification::new(),
                lowered: Notification::new(),
                core: handle.downgrade(),
            }),
        }
    }

    /// Set the flag to `to`.
    pub fn set(&self, to: bool) {
        self.state.set(to);
    }

    /// Raise the flag.
    pub fn raise(&self) {
        self.set(true);
    }

    /// Lower the flag.
    pub fn lower(&self) {
        self.set(false);
    }

    /// The complement of this flag, sharing its state.
    pub fn inverse(&self) -> InverseFlag {
        InverseFlag {
            state: Rc::clone(&self.state),
        }
    }
}

impl Condition for Flag {
    fn is_true(&self) -> bool {
        self.state.value.get()
    }

    fn subscribe(&self, _handle: &Handle, waiter: TaskId, wakeup: &Interrupt) {
        self.state.raised.subscribe(waiter, wakeup);
    }

    fn unsubscribe(&self, waiter: TaskId, wakeup: &Interrupt) {
        self.state.raised.unsubscribe(waiter, wakeup);
    }

    fn invert(&self) -> SharedCondition {
        Rc::new(self.inverse())
    }
}

/// The complement of a [`Flag`]: true while the flag is lowered.
#[derive(Clone)]
pub struct InverseFlag {
    state: Rc<FlagState>,
}

impl InverseFlag {
    /// The flag this is the complement of.
    pub fn flag(&self) -> Flag {
        Flag {
            state: Rc::clone(&self.state),
        }
    }
}

impl Condition for InverseFlag {
    fn is_true(&self) -> bool {
        !self.state.value.get()
    }

    fn subscribe(&self, _handle: &Handle, waiter: TaskId, wakeup: &Interrupt) {
        self.state.lowered.subscribe(waiter, wakeup);
    }

    fn unsubscribe(&self, waiter: TaskId, wakeup: &Interrupt) {
        self.state.lowered.unsubscribe(waiter, wakeup);
    }

    fn invert(&self) -> SharedCondition {
        Rc::new(self.flag())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::RefCell;

    use lockstep_types::{ActivityState, Time, Turnstamp};

    use super::*;
    use crate::config::LoopConfig;
    use crate::scheduler::Loop;
    use crate::timing::{After, Eternity};

    #[test]
    fn waiting_outside_a_loop_fails() {
        let flag_loop = Loop::new(LoopConfig::default());
        let flag = Flag::new(&flag_loop.handle());
        let outcome = futures::executor::block_on(flag.wait());
        let fault = outcome.unwrap_err();
        let failure = fault.as_failure().unwrap();
        assert_eq!(failure.downcast_ref::<LoopError>(), Some(&LoopError::NoLoop));
    }

    #[test]
    fn postpone_resumes_in_next_turn() {
        let mut lp = Loop::new(LoopConfig::default());
        let log = Rc::new(RefCell::new(Vec::new()));
        let handle = lp.handle();
        for name in ["a", "b"] {
            let log = Rc::clone(&log);
            let ctx = handle.clone();
            lp.spawn(async move {
                log.borrow_mut().push((name, ctx.turnstamp()));
                postpone().await?;
                log.borrow_mut().push((name, ctx.turnstamp()));
                Ok(())
            });
        }
        lp.run().unwrap();
        let first = Turnstamp::new(Time::ZERO, 1);
        let second = Turnstamp::new(Time::ZERO, 2);
        assert_eq!(
            *log.borrow(),
            vec![("a", first), ("b", first), ("a", second), ("b", second)]
        );
    }

    #[test]
    fn flag_wakes_all_waiters_in_order() {
        let mut lp = Loop::new(LoopConfig::default());
        let handle = lp.handle();
        let flag = Flag::new(&handle);
        let order = Rc::new(RefCell::new(Vec::new()));
        for id in 0..3_u32 {
            let flag = flag.clone();
            let order = Rc::clone(&order);
            lp.spawn(async move {
                flag.wait().await?;
                order.borrow_mut().push(id);
                Ok(())
            });
        }
        let setter = flag.clone();
        handle
            .spawn_at(
                async move {
                    setter.raise();
                    Ok(())
                },
                Time::from(5_i64),
            )
            .unwrap();
        lp.run().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(lp.now(), Time::from(5_i64));
    }

    #[test]
    fn inverse_flag_is_complement() {
        let lp = Loop::new(LoopConfig::default());
        let flag = Flag::new(&lp.handle());
        let inverse = flag.inverse();
        assert!(!flag.is_true());
        assert!(inverse.is_true());
        flag.raise();
        assert!(flag.is_true());
        assert!(!inverse.is_true());
        assert!(flag.invert().is_true() == inverse.is_true());
    }

    #[test]
    fn all_and_any_follow_children() {
        let lp = Loop::new(LoopConfig::default());
        let a = Flag::new(&lp.handle());
        let b = Flag::new(&lp.handle());
        let shared_a: SharedCondition = Rc::new(a.clone());
        let shared_b: SharedCondition = Rc::new(b.clone());
        let both = All::new([Rc::clone(&shared_a), Rc::clone(&shared_b)]);
        let either = Any::new([Rc::clone(&shared_a), Rc::clone(&shared_b)]);

        assert!(!both.is_true());
        assert!(!either.is_true());
        a.raise();
        assert!(!both.is_true());
        assert!(either.is_true());
        b.raise();
        assert!(both.is_true());
        // De Morgan: not (a and b) == (not a) or (not b)
        assert!(!both.invert().is_true());
        assert_eq!(both.invert().junction().map(|(j, _)| j), Some(Junction::Any));
    }

    #[test]
    fn nested_connectives_flatten_and_dedupe() {
        let lp = Loop::new(LoopConfig::default());
        let a: SharedCondition = Rc::new(Flag::new(&lp.handle()));
        let b: SharedCondition = Rc::new(Flag::new(&lp.handle()));
        let inner: SharedCondition = Rc::new(All::new([Rc::clone(&a), Rc::clone(&b)]));
        let outer = All::new([inner, Rc::clone(&a)]);
        assert_eq!(outer.children().len(), 2);
        assert!(All::new([]).is_true());
        assert!(!Any::new([]).is_true());
    }

    #[test]
    fn any_wakes_on_first_true_child() {
        let mut lp = Loop::new(LoopConfig::default());
        let handle = lp.handle();
        let flag = Flag::new(&handle);
        let either: Rc<Any> = Rc::new(Any::new([
            Rc::new(flag.clone()) as SharedCondition,
            Rc::new(After::new(&handle, Time::from(100_i64))) as SharedCondition,
        ]));
        let waiter_condition = Rc::clone(&either);
        let ctx = handle.clone();
        let waiter = lp.spawn(async move {
            waiter_condition.wait().await?;
            Ok(ctx.now())
        });
        let setter = flag.clone();
        handle
            .spawn_at(
                async move {
                    setter.raise();
                    Ok(())
                },
                Time::from(3_i64),
            )
            .unwrap();
        let summary = lp.run().unwrap();
        assert_eq!(waiter.outcome().unwrap().unwrap(), Time::from(3_i64));
        // the stale timer at 100 never moves the clock
        assert_eq!(summary.final_turnstamp.time, Time::from(3_i64));
    }

    #[test]
    fn cancelled_wait_withdraws_subscription() {
        let mut lp = Loop::new(LoopConfig::default());
        let handle = lp.handle();
        let flag = Flag::new(&handle);
        let waiting_on = flag.clone();
        let waiter = lp.spawn(async move {
            waiting_on.wait().await?;
            Ok(())
        });
        lp.run().unwrap();
        assert_eq!(flag.state.raised.len(), 1);
        waiter.cancel();
        lp.run().unwrap();
        assert_eq!(waiter.status(), ActivityState::Cancelled);
        assert!(flag.state.raised.is_empty());
    }

    #[test]
    fn eternity_never_resumes() {
        let mut lp = Loop::new(LoopConfig::default());
        let sleeper = lp.spawn(async {
            Eternity.wait().await?;
            Ok(())
        });
        let summary = lp.run().unwrap();
        assert_eq!(summary.end_reason, lockstep_types::EndReason::Idle);
        assert_eq!(sleeper.status(), ActivityState::Running);
    }
}
