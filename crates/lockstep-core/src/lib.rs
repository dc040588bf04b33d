//! Virtual clock, scheduler and structured-task primitives for the Lockstep
//! runtime.
//!
//! Many independent units of work run "concurrently" under one logical
//! clock. Exactly one of them executes at any instant; they interleave only
//! at explicit suspension points, and the interleaving is fully
//! reproducible.
//!
//! # Modules
//!
//! - [`clock`] -- Virtual clock with `(time, turn)` tracking.
//! - [`config`] -- Configuration loading from `lockstep-config.yaml` into
//!   strongly-typed structs.
//! - [`scheduler`] -- The [`Loop`] and its cloneable [`Handle`].
//! - [`interrupt`] -- One-shot [`Interrupt`] signals used for cancellation
//!   and wake-ups.
//! - [`condition`] -- The [`Condition`] trait, waiting, connectives and
//!   [`Flag`].
//! - [`timing`] -- Time conditions and sleeping.
//! - [`activity`] -- [`Activity`] handles with [`Done`] / [`NotDone`]
//!   completion.
//! - [`error`] -- [`Fault`], [`Failure`] and [`ActivityError`].
//! - [`runner`] -- The one-call [`simulate`] driver.
//!
//! # Example
//!
//! ```
//! use lockstep_core::{LoopConfig, Time, simulate};
//!
//! let result = simulate(LoopConfig::default(), |handle| async move {
//!     let barista = handle.spawn({
//!         let handle = handle.clone();
//!         async move {
//!             handle.sleep(Time::from(3_i64)).await?;
//!             Ok("flat white")
//!         }
//!     });
//!     let order = (&barista).await?;
//!     Ok((order, handle.now()))
//! });
//! let result = result.ok();
//! assert_eq!(result.map(|r| r.value), Some(("flat white", Time::from(3_i64))));
//! ```

pub mod activity;
pub mod clock;
pub mod condition;
pub mod config;
mod context;
pub mod error;
pub mod interrupt;
mod queue;
pub mod runner;
pub mod scheduler;
pub mod timing;

pub use activity::{Activity, Done, NotDone};
pub use clock::{ClockError, VirtualClock};
pub use condition::{
    All, Any, Condition, Flag, InverseFlag, Notification, SharedCondition, Wait, postpone, wait,
};
pub use config::{ConfigError, LockstepConfig, LoggingConfig, LoopConfig};
pub use error::{ActivityError, Cancelled, Failure, Fault, TaskResult};
pub use interrupt::{Interrupt, InterruptError, Subject};
pub use lockstep_types::{
    ActivityId, ActivityState, EndReason, InterruptId, TaskId, Time, Turnstamp,
};
pub use runner::{SimulationError, SimulationResult, simulate};
pub use scheduler::{Handle, Loop, LoopError, RunSummary};
pub use timing::{After, Before, Eternity, Instant, now, sleep, sleep_until};
