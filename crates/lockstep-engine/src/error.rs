//! Error types for the Lockstep engine binary.
//!
//! [`EngineError`] is the top-level error type that wraps all possible
//! failure modes during engine startup and workload execution.

use lockstep_core::{ConfigError, SimulationError};

/// Top-level error for the engine binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// The `workload` section is missing pieces or inconsistent.
    #[error("workload error: {message}")]
    Workload {
        /// Description of the problem.
        message: String,
    },

    /// The simulation did not produce a result.
    #[error("simulation error: {source}")]
    Simulation {
        /// The underlying simulation error.
        #[from]
        source: SimulationError,
    },

    /// Two runs with the same seed produced different reports.
    #[error("workload with seed {seed} is not reproducible")]
    Nondeterministic {
        /// The seed both runs used.
        seed: u64,
    },

    /// The report could not be serialized.
    #[error("report error: {source}")]
    Report {
        /// The underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}
