//! One-call simulation driver.
//!
//! [`simulate`] builds a [`Loop`], spawns the main computation, runs the
//! loop to its configured end and hands back the main activity's value
//! together with the [`RunSummary`]. Anything still suspended afterwards is
//! force-closed when the loop is dropped.

use std::future::Future;

use lockstep_types::{ActivityId, ActivityState};
use tracing::{info, warn};

use crate::config::LoopConfig;
use crate::error::{ActivityError, Fault};
use crate::scheduler::{Handle, Loop, LoopError, RunSummary};

/// Errors that can occur during a simulation run.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// The loop itself failed.
    #[error("loop error: {source}")]
    Loop {
        /// The underlying loop error.
        #[from]
        source: LoopError,
    },

    /// The main activity finished without a value.
    #[error("main activity failed: {source}")]
    Activity {
        /// How the main activity ended.
        #[from]
        source: ActivityError,
    },

    /// The run ended while the main activity was still unfinished.
    #[error("main activity {activity} did not finish (status {status})")]
    Unfinished {
        /// The main activity.
        activity: ActivityId,
        /// Its status when the run ended.
        status: ActivityState,
    },
}

/// Result of a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationResult<T> {
    /// The value returned by the main activity.
    pub value: T,
    /// What the run did.
    pub summary: RunSummary,
}

/// Run `main` on a fresh loop until the loop goes idle or reaches
/// `config.until`.
///
/// `main` receives a handle to the loop and returns the main computation.
///
/// # Errors
///
/// Returns [`SimulationError`] if the loop fails, the main activity fails
/// or is cancelled, or the run ends before the main activity finishes.
pub fn simulate<T, F, Fut>(
    config: LoopConfig,
    main: F,
) -> Result<SimulationResult<T>, SimulationError>
where
    T: Clone + 'static,
    F: FnOnce(Handle) -> Fut,
    Fut: Future<Output = Result<T, Fault>> + 'static,
{
    let mut lp = Loop::new(config);
    let activity = lp.spawn(main(lp.handle()));
    info!(activity = %activity.id(), start = %lp.now(), "Main activity spawned");

    let summary = lp.run()?;

    match activity.outcome() {
        Some(Ok(value)) => Ok(SimulationResult { value, summary }),
        Some(Err(source)) => {
            warn!(activity = %activity.id(), error = %source, "Main activity did not succeed");
            Err(SimulationError::Activity { source })
        }
        None => Err(SimulationError::Unfinished {
            activity: activity.id(),
            status: activity.status(),
        }),
    }
}
