//! Conditions on virtual time, and sleeping.
//!
//! Simulation time has no inherent unit; a simulation picks one and uses it
//! consistently. All of these conditions read the clock of the loop they
//! were created for.
//!
//! | Condition | True when | Complement |
//! |---|---|---|
//! | [`After`] | `now >= target` | [`Before`] |
//! | [`Before`] | `now < target` | [`After`] |
//! | [`Instant`] | always | [`Eternity`] |
//! | [`Eternity`] | never | [`Instant`] |
//!
//! Awaiting a condition that is already true postpones the caller to the
//! next turn. Awaiting [`Before`] after its target, or [`Eternity`], suspends
//! the caller until it is cancelled or the loop shuts down.

use std::rc::Rc;

use lockstep_types::{TaskId, Time};
use tracing::warn;

use crate::condition::{Condition, SharedCondition};
use crate::error::Fault;
use crate::interrupt::Interrupt;
use crate::scheduler::{Handle, LoopError};

/// The time range at and after `target`.
#[derive(Debug, Clone)]
pub struct After {
    handle: Handle,
    target: Time,
}

impl After {
    /// True from `target` on, on the loop behind `handle`.
    pub fn new(handle: &Handle, target: Time) -> Self {
        Self {
            handle: handle.clone(),
            target,
        }
    }

    /// The first time at which this condition is true.
    pub const fn target(&self) -> Time {
        self.target
    }
}

impl Condition for After {
    fn is_true(&self) -> bool {
        self.handle.now() >= self.target
    }

    fn subscribe(&self, handle: &Handle, waiter: TaskId, wakeup: &Interrupt) {
        let at = self.target.max(handle.now());
        if let Err(error) = handle.raise_at(waiter, wakeup, at) {
            warn!(task = %waiter, %error, "Could not schedule time wake-up");
        }
    }

    fn unsubscribe(&self, _waiter: TaskId, _wakeup: &Interrupt) {}

    fn invert(&self) -> SharedCondition {
        Rc::new(Before::new(&self.handle, self.target))
    }
}

/// The time range strictly before `target`.
#[derive(Debug, Clone)]
pub struct Before {
    handle: Handle,
    target: Time,
}

impl Before {
    /// True until `target`, on the loop behind `handle`.
    pub fn new(handle: &Handle, target: Time) -> Self {
        Self {
            handle: handle.clone(),
            target,
        }
    }

    /// The first time at which this condition is false.
    pub const fn target(&self) -> Time {
        self.target
    }
}

impl Condition for Before {
    fn is_true(&self) -> bool {
        self.handle.now() < self.target
    }

    // time never flows backwards, so there is nothing to wait for
    fn subscribe(&self, _handle: &Handle, _waiter: TaskId, _wakeup: &Interrupt) {}

    fn unsubscribe(&self, _waiter: TaskId, _wakeup: &Interrupt) {}

    fn invert(&self) -> SharedCondition {
        Rc::new(After::new(&self.handle, self.target))
    }
}

/// A condition that is always true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Instant;

impl Condition for Instant {
    fn is_true(&self) -> bool {
        true
    }

    fn subscribe(&self, _handle: &Handle, _waiter: TaskId, _wakeup: &Interrupt) {}

    fn unsubscribe(&self, _waiter: TaskId, _wakeup: &Interrupt) {}

    fn invert(&self) -> SharedCondition {
        Rc::new(Eternity)
    }
}

/// A condition that is never true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eternity;

impl Condition for Eternity {
    fn is_true(&self) -> bool {
        false
    }

    fn subscribe(&self, _handle: &Handle, _waiter: TaskId, _wakeup: &Interrupt) {}

    fn unsubscribe(&self, _waiter: TaskId, _wakeup: &Interrupt) {}

    fn invert(&self) -> SharedCondition {
        Rc::new(Instant)
    }
}

impl Handle {
    /// A condition that is true from `target` on.
    pub fn after(&self, target: Time) -> After {
        After::new(self, target)
    }

    /// A condition that is true until `target`.
    pub fn before(&self, target: Time) -> Before {
        Before::new(self, target)
    }

    /// Suspend for `delay` units of virtual time.
    ///
    /// A zero delay postpones to the next turn.
    pub async fn sleep(&self, delay: Time) -> Result<(), Fault> {
        let target = self.deadline_after(delay)?;
        self.sleep_until(target).await
    }

    /// Suspend until the clock reaches `target`.
    ///
    /// A target that has already passed postpones to the next turn.
    pub async fn sleep_until(&self, target: Time) -> Result<(), Fault> {
        self.after(target).wait().await
    }
}

/// Return the current time of the loop dispatching on this thread.
///
/// # Errors
///
/// Returns [`LoopError::NoLoop`] outside of a running loop.
pub fn now() -> Result<Time, LoopError> {
    Ok(Handle::current()?.now())
}

/// Suspend the current computation for `delay` units of virtual time.
pub async fn sleep(delay: Time) -> Result<(), Fault> {
    let handle = Handle::current()?;
    handle.sleep(delay).await
}

/// Suspend the current computation until the clock reaches `target`.
pub async fn sleep_until(target: Time) -> Result<(), Fault> {
    let handle = Handle::current()?;
    handle.sleep_until(target).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::RefCell;

    use lockstep_types::Turnstamp;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::config::LoopConfig;
    use crate::scheduler::Loop;

    #[test]
    fn after_and_before_are_complements() {
        let lp = Loop::starting_at(Time::from(10_i64));
        let handle = lp.handle();
        for target in [5_i64, 10, 15] {
            let after = handle.after(Time::from(target));
            let before = handle.before(Time::from(target));
            assert_ne!(after.is_true(), before.is_true());
            assert_eq!(after.invert().is_true(), before.is_true());
            assert_eq!(before.invert().is_true(), after.is_true());
        }
        assert!(Instant.is_true());
        assert!(!Eternity.is_true());
        assert!(!Instant.invert().is_true());
        assert!(Eternity.invert().is_true());
    }

    #[test]
    fn sleepers_wake_in_time_order() {
        let mut lp = Loop::new(LoopConfig::default());
        let log = Rc::new(RefCell::new(Vec::new()));
        for delay in [dec!(3), dec!(1.5), dec!(2)] {
            let log = Rc::clone(&log);
            lp.spawn(async move {
                sleep(Time::new(delay)).await?;
                log.borrow_mut().push(now()?);
                Ok(())
            });
        }
        lp.run().unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                Time::new(dec!(1.5)),
                Time::new(dec!(2)),
                Time::new(dec!(3))
            ]
        );
    }

    #[test]
    fn zero_sleep_postpones() {
        let mut lp = Loop::new(LoopConfig::default());
        let handle = lp.handle();
        let ctx = handle.clone();
        let activity = lp.spawn(async move {
            ctx.sleep(Time::ZERO).await?;
            Ok(ctx.turnstamp())
        });
        lp.run().unwrap();
        assert_eq!(
            activity.outcome().unwrap().unwrap(),
            Turnstamp::new(Time::ZERO, 2)
        );
    }

    #[test]
    fn negative_sleep_fails() {
        let mut lp = Loop::new(LoopConfig::default());
        let activity = lp.spawn(async {
            sleep(Time::from(-1_i64)).await?;
            Ok(())
        });
        lp.run().unwrap();
        assert_eq!(activity.status(), lockstep_types::ActivityState::Failed);
    }

    #[test]
    fn sleep_until_past_target_postpones() {
        let mut lp = Loop::starting_at(Time::from(20_i64));
        let activity = lp.spawn(async {
            sleep_until(Time::from(5_i64)).await?;
            now().map_err(Fault::from)
        });
        lp.run().unwrap();
        assert_eq!(activity.outcome().unwrap().unwrap(), Time::from(20_i64));
    }

    #[test]
    fn now_outside_loop_fails() {
        assert_eq!(now(), Err(LoopError::NoLoop));
    }
}
