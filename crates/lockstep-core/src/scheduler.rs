//! The event loop that drives simulated computations through virtual time.
//!
//! A [`Loop`] owns every suspended computation, a ready queue of resumptions
//! due now, and a [`WaitQueue`] of resumptions due later. Running the loop
//! proceeds in **turns**: each turn takes every resumption that is due at
//! the current time, in FIFO order, and resumes each exactly once.
//! Resumptions scheduled for "now" during a turn run in the next turn at the
//! same time. Only when nothing is due now does the clock jump to the
//! earliest pending deadline.
//!
//! # Design Principles
//!
//! - Exactly one computation runs at a time. There are no OS threads and no
//!   wall-clock waits; time moves only when nothing is left to do now.
//! - Same input, same schedule: ids are sequential, queues are FIFO, and
//!   same-time deadlines keep their insertion order.
//! - Revoked signals and resumptions of finished tasks are inert. They are
//!   skipped on dispatch and never move the clock.
//! - Computations are polled with a no-op waker. A computation is resumed
//!   only because something scheduled it, never because a waker fired.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;
use lockstep_types::{ActivityId, EndReason, IdSequence, InterruptId, TaskId, Time, Turnstamp};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::activity::Activity;
use crate::clock::{ClockError, VirtualClock};
use crate::config::LoopConfig;
use crate::context;
use crate::error::Fault;
use crate::interrupt::{Interrupt, Subject};
use crate::queue::{Resumption, WaitQueue};

/// A type-erased computation owned by the loop.
pub(crate) type Computation = LocalBoxFuture<'static, ()>;

/// Errors raised by the event loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoopError {
    /// A runtime primitive was used while no loop was dispatching.
    #[error("no loop is running on this thread")]
    NoLoop,

    /// Something was scheduled for a time that has already passed.
    #[error("cannot schedule at {at}: current time is already {now}")]
    InPast {
        /// The requested time.
        at: Time,
        /// The current time.
        now: Time,
    },

    /// A single run executed more turns than allowed.
    #[error("turn limit of {limit} reached at {at}")]
    TurnLimit {
        /// The configured limit.
        limit: u64,
        /// Where the loop stopped.
        at: Turnstamp,
    },

    /// The clock rejected an operation.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },
}

/// What a single run of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Why the run returned.
    pub end_reason: EndReason,
    /// The `(time, turn)` at which the run returned.
    pub final_turnstamp: Turnstamp,
    /// Number of turns executed during this run.
    pub turns: u64,
    /// Number of resumptions dispatched during this run.
    pub dispatched: u64,
    /// Number of activities spawned on this loop so far.
    pub activities_spawned: u64,
}

#[derive(Debug, Default)]
struct Sequences {
    tasks: IdSequence,
    activities: IdSequence,
    interrupts: IdSequence,
}

/// Shared loop state.
pub(crate) struct Core {
    config: LoopConfig,
    clock: RefCell<VirtualClock>,
    ready: RefCell<VecDeque<Resumption>>,
    timers: RefCell<WaitQueue>,
    tasks: RefCell<BTreeMap<TaskId, Computation>>,
    sequences: RefCell<Sequences>,
    current: Cell<Option<TaskId>>,
    delivery: RefCell<Option<Interrupt>>,
    turns: Cell<u64>,
    dispatched: Cell<u64>,
}

/// Outcome of moving the clock forward.
enum Advance {
    /// The clock moved to this time and its resumptions are ready.
    Moved(Time),
    /// Nothing is pending.
    Idle,
    /// The earliest live deadline lies beyond the requested end.
    Beyond,
}

/// A cloneable reference to a loop.
///
/// Handles are how computations talk to the loop: spawning activities,
/// reading the clock and scheduling resumptions. Inside a running
/// computation, [`Handle::current`] returns the handle of the loop that is
/// dispatching it.
#[derive(Clone)]
pub struct Handle {
    core: Rc<Core>,
}

/// A non-owning reference to a loop.
#[derive(Clone, Default)]
pub(crate) struct WeakHandle {
    core: Weak<Core>,
}

impl WeakHandle {
    pub(crate) fn upgrade(&self) -> Option<Handle> {
        self.core.upgrade().map(|core| Handle { core })
    }
}

impl Handle {
    fn new(config: LoopConfig) -> Self {
        let clock = VirtualClock::new(config.start);
        Self {
            core: Rc::new(Core {
                config,
                clock: RefCell::new(clock),
                ready: RefCell::new(VecDeque::new()),
                timers: RefCell::new(WaitQueue::default()),
                tasks: RefCell::new(BTreeMap::new()),
                sequences: RefCell::new(Sequences::default()),
                current: Cell::new(None),
                delivery: RefCell::new(None),
                turns: Cell::new(0),
                dispatched: Cell::new(0),
            }),
        }
    }

    /// Return the handle of the loop dispatching on this thread.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::NoLoop`] outside of a running loop.
    pub fn current() -> Result<Self, LoopError> {
        context::current().ok_or(LoopError::NoLoop)
    }

    /// Return the current virtual time.
    pub fn now(&self) -> Time {
        self.core.clock.borrow().time()
    }

    /// Return the current `(time, turn)`.
    pub fn turnstamp(&self) -> Turnstamp {
        self.core.clock.borrow().turnstamp()
    }

    /// Return the loop configuration.
    pub fn config(&self) -> &LoopConfig {
        &self.core.config
    }

    /// Return the task being resumed right now, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        self.core.current.get()
    }

    /// Number of suspended computations owned by the loop.
    pub fn suspended(&self) -> usize {
        self.core.tasks.borrow().len()
    }

    /// Number of queued resumptions, due now or later.
    pub fn pending(&self) -> usize {
        let ready = self.core.ready.borrow().len();
        ready.saturating_add(self.core.timers.borrow().len())
    }

    /// Number of activities spawned on this loop so far.
    pub fn activities_spawned(&self) -> u64 {
        self.core.sequences.borrow().activities.allocated()
    }

    /// Whether both handles refer to the same loop.
    pub fn same_loop(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    /// Compute the absolute time `delay` after now.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Clock`] for a negative or overflowing delay.
    pub fn deadline_after(&self, delay: Time) -> Result<Time, LoopError> {
        Ok(self.core.clock.borrow().deadline_after(delay)?)
    }

    // -----------------------------------------------------------------------
    // Spawning
    // -----------------------------------------------------------------------

    /// Spawn `payload` as a new activity that starts in the next turn.
    pub fn spawn<T, F>(&self, payload: F) -> Activity<T>
    where
        T: 'static,
        F: Future<Output = Result<T, Fault>> + 'static,
    {
        let activity = self.prepare(payload);
        self.enqueue(self.now(), Resumption::start(activity.task()));
        activity
    }

    /// Spawn `payload` as a new activity that starts at time `at`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::InPast`] if `at` lies before the current time.
    pub fn spawn_at<T, F>(&self, payload: F, at: Time) -> Result<Activity<T>, LoopError>
    where
        T: 'static,
        F: Future<Output = Result<T, Fault>> + 'static,
    {
        self.check_not_past(at)?;
        let activity = self.prepare(payload);
        self.enqueue(at, Resumption::start(activity.task()));
        Ok(activity)
    }

    /// Spawn `payload` as a new activity that starts `delay` from now.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Clock`] for a negative or overflowing delay.
    pub fn spawn_after<T, F>(&self, payload: F, delay: Time) -> Result<Activity<T>, LoopError>
    where
        T: 'static,
        F: Future<Output = Result<T, Fault>> + 'static,
    {
        let at = self.deadline_after(delay)?;
        self.spawn_at(payload, at)
    }

    fn prepare<T, F>(&self, payload: F) -> Activity<T>
    where
        T: 'static,
        F: Future<Output = Result<T, Fault>> + 'static,
    {
        let (task, id) = {
            let mut sequences = self.core.sequences.borrow_mut();
            (
                TaskId::new(sequences.tasks.next_raw()),
                ActivityId::new(sequences.activities.next_raw()),
            )
        };
        let (activity, computation) = Activity::launch(self, id, task, payload);
        self.core.tasks.borrow_mut().insert(task, computation);
        debug!(activity = %id, task = %task, time = %self.now(), "Activity spawned");
        activity
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Resume `task` at `at` (default: now), optionally delivering `signal`.
    ///
    /// A resumption for "now" runs in the next turn.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::InPast`] if `at` lies before the current time.
    pub fn schedule(
        &self,
        task: TaskId,
        signal: Option<Interrupt>,
        at: Option<Time>,
    ) -> Result<(), LoopError> {
        let at = at.unwrap_or_else(|| self.now());
        self.check_not_past(at)?;
        if let Some(signal) = &signal {
            signal.mark_scheduled();
        }
        self.enqueue(at, Resumption { task, signal });
        Ok(())
    }

    /// Create an unscheduled interrupt with a loop-unique id.
    ///
    /// Hand it to [`raise_in`](Self::raise_in), [`raise_at`](Self::raise_at)
    /// or [`schedule`](Self::schedule) to deliver it.
    pub fn new_interrupt(&self, subject: Subject, token: Option<String>) -> Interrupt {
        let id = InterruptId::new(self.core.sequences.borrow_mut().interrupts.next_raw());
        Interrupt::new(id, subject, token)
    }

    /// Deliver `interrupt` to `task` in the next turn.
    pub fn raise_in(&self, task: TaskId, interrupt: &Interrupt) {
        interrupt.mark_scheduled();
        trace!(task = %task, interrupt = %interrupt, "Interrupt scheduled");
        self.core
            .ready
            .borrow_mut()
            .push_back(Resumption::deliver(task, interrupt.clone()));
    }

    /// Deliver `interrupt` to `task` at time `at`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::InPast`] if `at` lies before the current time.
    pub fn raise_at(&self, task: TaskId, interrupt: &Interrupt, at: Time) -> Result<(), LoopError> {
        self.check_not_past(at)?;
        interrupt.mark_scheduled();
        trace!(task = %task, interrupt = %interrupt, at = %at, "Interrupt scheduled");
        self.enqueue(at, Resumption::deliver(task, interrupt.clone()));
        Ok(())
    }

    fn check_not_past(&self, at: Time) -> Result<(), LoopError> {
        let now = self.now();
        if at < now {
            return Err(LoopError::InPast { at, now });
        }
        Ok(())
    }

    fn enqueue(&self, at: Time, resumption: Resumption) {
        if at <= self.now() {
            self.core.ready.borrow_mut().push_back(resumption);
        } else {
            self.core.timers.borrow_mut().push(at, resumption);
        }
    }

    // -----------------------------------------------------------------------
    // Internals used by interrupts, conditions and activities
    // -----------------------------------------------------------------------

    /// Claim the signal delivered with the current resumption.
    pub(crate) fn take_delivery(&self) -> Option<Interrupt> {
        self.core.delivery.borrow_mut().take()
    }

    /// Hand back a claimed signal so another suspension point of the
    /// running task can claim it.
    pub(crate) fn restore_delivery(&self, signal: Interrupt) {
        *self.core.delivery.borrow_mut() = Some(signal);
    }

    /// Detach a suspended computation from the loop.
    pub(crate) fn remove_task(&self, task: TaskId) -> Option<Computation> {
        self.core.tasks.borrow_mut().remove(&task)
    }

    pub(crate) fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            core: Rc::downgrade(&self.core),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Resume one task. Returns `false` if the resumption was inert.
    fn dispatch(&self, resumption: Resumption) -> bool {
        let Resumption { task, signal } = resumption;
        if let Some(signal) = &signal
            && !signal.is_deliverable()
        {
            trace!(task = %task, interrupt = %signal.id(), "Skipping revoked signal");
            return false;
        }
        let Some(mut computation) = self.remove_task(task) else {
            trace!(task = %task, "Skipping resumption of finished task");
            return false;
        };
        if let Some(signal) = &signal {
            signal.mark_delivered();
        }
        *self.core.delivery.borrow_mut() = signal;
        let previous = self.core.current.replace(Some(task));

        let mut cx = Context::from_waker(noop_waker_ref());
        let poll = computation.as_mut().poll(&mut cx);

        self.core.current.set(previous);
        if let Some(unclaimed) = self.take_delivery() {
            warn!(
                task = %task,
                interrupt = %unclaimed,
                "Signal was not claimed by a suspension point"
            );
        }
        self.core
            .dispatched
            .set(self.core.dispatched.get().saturating_add(1));
        if poll == Poll::Pending {
            self.core.tasks.borrow_mut().insert(task, computation);
        }
        true
    }

    /// Run one turn: every resumption due now, in FIFO order.
    ///
    /// Returns the turnstamp of the executed turn, or `None` if nothing live
    /// was due.
    fn run_turn(&self) -> Result<Option<Turnstamp>, LoopError> {
        let mut batch = std::mem::take(&mut *self.core.ready.borrow_mut());
        {
            let tasks = self.core.tasks.borrow();
            batch.retain(|r| r.is_live() && tasks.contains_key(&r.task));
        }
        if batch.is_empty() {
            return Ok(None);
        }
        let stamp = self.core.clock.borrow_mut().next_turn()?;
        self.core.turns.set(self.core.turns.get().saturating_add(1));
        trace!(turnstamp = %stamp, batch = batch.len(), "Turn started");
        for resumption in batch {
            self.dispatch(resumption);
        }
        Ok(Some(stamp))
    }

    /// Move the clock to the earliest live deadline, if it lies within
    /// `end`. Buckets holding only inert resumptions are discarded without
    /// moving the clock.
    fn advance_clock(&self, end: Option<Time>) -> Result<Advance, LoopError> {
        loop {
            let Some(deadline) = self.core.timers.borrow().next_deadline() else {
                return Ok(Advance::Idle);
            };
            if end.is_some_and(|end| deadline > end) {
                return Ok(Advance::Beyond);
            }
            let Some((at, bucket)) = self.core.timers.borrow_mut().pop_bucket() else {
                return Ok(Advance::Idle);
            };
            let live: VecDeque<Resumption> = {
                let tasks = self.core.tasks.borrow();
                bucket
                    .into_iter()
                    .filter(|r| r.is_live() && tasks.contains_key(&r.task))
                    .collect()
            };
            if live.is_empty() {
                trace!(at = %at, "Discarding inert deadline");
                continue;
            }
            self.core.clock.borrow_mut().advance_to(at)?;
            debug!(time = %at, due = live.len(), "Clock advanced");
            self.core.ready.borrow_mut().extend(live);
            return Ok(Advance::Moved(at));
        }
    }

    /// Run turns at the current time until nothing is due now.
    fn drain_now(&self, turns_before: u64) -> Result<(), LoopError> {
        loop {
            if let Some(limit) = self.core.config.turn_limit()
                && self.core.turns.get().saturating_sub(turns_before) >= limit
                && !self.core.ready.borrow().is_empty()
            {
                let at = self.turnstamp();
                warn!(limit, turnstamp = %at, "Turn limit reached");
                return Err(LoopError::TurnLimit { limit, at });
            }
            if self.run_turn()?.is_none() {
                return Ok(());
            }
        }
    }

    fn run_to(&self, end: Option<Time>) -> Result<RunSummary, LoopError> {
        let _entered = context::enter(self);
        let turns_before = self.core.turns.get();
        let dispatched_before = self.core.dispatched.get();
        info!(
            turnstamp = %self.turnstamp(),
            until = ?end.map(|t| t.to_string()),
            max_turns = self.core.config.max_turns,
            "Simulation run starting"
        );

        let end_reason = loop {
            self.drain_now(turns_before)?;
            match self.advance_clock(end)? {
                Advance::Moved(_) => {}
                Advance::Idle => break EndReason::Idle,
                Advance::Beyond => break EndReason::TimeLimit,
            }
        };

        let summary = RunSummary {
            end_reason,
            final_turnstamp: self.turnstamp(),
            turns: self.core.turns.get().saturating_sub(turns_before),
            dispatched: self.core.dispatched.get().saturating_sub(dispatched_before),
            activities_spawned: self.activities_spawned(),
        };
        info!(
            end_reason = ?summary.end_reason,
            turnstamp = %summary.final_turnstamp,
            turns = summary.turns,
            dispatched = summary.dispatched,
            suspended = self.suspended(),
            "Simulation run finished"
        );
        Ok(summary)
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle")
            .field("turnstamp", &self.turnstamp())
            .field("suspended", &self.suspended())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// The owner of a simulation.
///
/// Dropping the loop force-closes every computation still suspended on it;
/// see [`Loop::shutdown`].
#[derive(Debug)]
pub struct Loop {
    handle: Handle,
}

impl Loop {
    /// Create a loop with its clock at `config.start`.
    pub fn new(config: LoopConfig) -> Self {
        Self {
            handle: Handle::new(config),
        }
    }

    /// Create a loop starting at `start` with no limits.
    pub fn starting_at(start: Time) -> Self {
        Self::new(LoopConfig::starting_at(start))
    }

    /// Return a handle to this loop.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Return the current virtual time.
    pub fn now(&self) -> Time {
        self.handle.now()
    }

    /// Return the current `(time, turn)`.
    pub fn turnstamp(&self) -> Turnstamp {
        self.handle.turnstamp()
    }

    /// Spawn `payload` as a new activity; see [`Handle::spawn`].
    pub fn spawn<T, F>(&self, payload: F) -> Activity<T>
    where
        T: 'static,
        F: Future<Output = Result<T, Fault>> + 'static,
    {
        self.handle.spawn(payload)
    }

    /// Run a single turn at the current time.
    ///
    /// Returns `None` without moving the clock if nothing is due now.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Clock`] if the turn counter overflows.
    pub fn run_turn(&mut self) -> Result<Option<Turnstamp>, LoopError> {
        let _entered = context::enter(&self.handle);
        self.handle.run_turn()
    }

    /// Run everything due now, then move the clock to the next live
    /// deadline.
    ///
    /// Returns the new time, or `None` if nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::TurnLimit`] if the turn limit is exceeded
    /// before the current time is drained.
    pub fn advance(&mut self) -> Result<Option<Time>, LoopError> {
        let _entered = context::enter(&self.handle);
        self.handle.drain_now(self.handle.core.turns.get())?;
        match self.handle.advance_clock(None)? {
            Advance::Moved(at) => Ok(Some(at)),
            Advance::Idle | Advance::Beyond => Ok(None),
        }
    }

    /// Run until nothing is pending, or until the configured `until` time.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::TurnLimit`] if a single run executes more turns
    /// than `max_turns`.
    pub fn run(&mut self) -> Result<RunSummary, LoopError> {
        let end = self.handle.core.config.until;
        self.handle.run_to(end)
    }

    /// Run until nothing is pending or the next deadline lies beyond `end`.
    ///
    /// Everything due at or before `end` is dispatched.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::TurnLimit`] if a single run executes more turns
    /// than `max_turns`.
    pub fn run_until(&mut self, end: Time) -> Result<RunSummary, LoopError> {
        self.handle.run_to(Some(end))
    }

    /// Force-close every computation still suspended on the loop and drop
    /// all pending resumptions. Returns how many computations were closed.
    ///
    /// Activities closed this way finish as failed with
    /// [`ActivityError::Closed`]. Leaving work suspended at shutdown is
    /// usually a bug in the simulation, so it is logged.
    ///
    /// [`ActivityError::Closed`]: crate::error::ActivityError::Closed
    pub fn shutdown(&mut self) -> usize {
        let _entered = context::enter(&self.handle);
        let core = &self.handle.core;
        let mut closed: usize = 0;
        loop {
            let abandoned = std::mem::take(&mut *core.tasks.borrow_mut());
            if abandoned.is_empty() {
                break;
            }
            closed = closed.saturating_add(abandoned.len());
            drop(abandoned);
        }
        core.ready.borrow_mut().clear();
        core.timers.borrow_mut().clear();
        core.delivery.borrow_mut().take();
        if closed > 0 {
            warn!(
                closed,
                turnstamp = %self.turnstamp(),
                "Closed computations still suspended at shutdown"
            );
        }
        closed
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
