//! Thread-local access to the loop that is currently dispatching.
//!
//! While a [`Loop`] runs, it installs its [`Handle`] here so that code deep
//! inside a computation (conditions, sleeps, spawns) can reach the loop
//! without threading a handle through every call. The previous value is
//! restored when the guard drops, so nested loops on one thread each see
//! their own handle.
//!
//! [`Loop`]: crate::scheduler::Loop

use std::cell::RefCell;

use crate::scheduler::Handle;

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// Restores the previously installed handle on drop.
#[must_use = "the handle is uninstalled as soon as the guard is dropped"]
pub(crate) struct EnterGuard {
    prev: Option<Handle>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|slot| *slot.borrow_mut() = prev);
    }
}

/// Install `handle` as the current loop until the guard drops.
pub(crate) fn enter(handle: &Handle) -> EnterGuard {
    let prev = CURRENT.with(|slot| slot.borrow_mut().replace(handle.clone()));
    EnterGuard { prev }
}

/// Return the currently installed handle, if any.
pub(crate) fn current() -> Option<Handle> {
    CURRENT.with(|slot| slot.borrow().clone())
}
