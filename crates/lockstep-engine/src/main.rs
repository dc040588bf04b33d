//! Demo engine for the Lockstep virtual-time runtime.
//!
//! Loads configuration, runs the seeded cafe workload on a fresh loop and
//! prints a JSON report to stdout. Logs go to stderr.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `lockstep-config.yaml` (or the path given as
//!    the first argument)
//! 2. Initialize structured logging (tracing)
//! 3. Load the `workload` section
//! 4. Run the workload, twice when replay verification is on
//! 5. Print the report

mod error;
mod workload;

use std::path::{Path, PathBuf};

use lockstep_core::{LockstepConfig, LoggingConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::workload::WorkloadConfig;

/// Config file used when no path is given on the command line.
const DEFAULT_CONFIG_PATH: &str = "lockstep-config.yaml";

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if configuration is invalid or the workload fails.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);

    // 1. Load configuration.
    let config_found = config_path.exists();
    let config = load_config(&config_path, config_found)?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!(path = %config_path.display(), "lockstep-engine starting");
    if !config_found {
        info!("Config file not found, using defaults");
    }
    info!(
        start = %config.runtime.start,
        max_turns = config.runtime.max_turns,
        until = ?config.runtime.until.map(|t| t.to_string()),
        "Configuration loaded"
    );

    // 3. Load the workload.
    let workload = load_workload_config(&config_path, config_found)?;
    info!(
        seed = workload.seed,
        customers = workload.customers,
        verify_determinism = workload.verify_determinism,
        "Workload configuration loaded"
    );

    // 4. Run it.
    let report = workload::run_verified(&config.runtime, &workload)?;
    if report.walked_out > report.served {
        warn!(
            served = report.served,
            walked_out = report.walked_out,
            "Most customers walked out"
        );
    }

    // 5. Print the report.
    let rendered = serde_json::to_string_pretty(&report).map_err(EngineError::from)?;
    println!("{rendered}");

    info!(
        end_reason = ?report.summary.end_reason,
        turnstamp = %report.summary.final_turnstamp,
        "lockstep-engine shutdown complete"
    );
    Ok(())
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load the runtime configuration, falling back to defaults when the file
/// does not exist.
fn load_config(path: &Path, found: bool) -> Result<LockstepConfig, EngineError> {
    if found {
        Ok(LockstepConfig::from_file(path)?)
    } else {
        let mut config = LockstepConfig::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

/// Load the `workload` section from the config file.
///
/// If the file does not exist or lacks the `workload` key, defaults are
/// used.
fn load_workload_config(path: &Path, found: bool) -> Result<WorkloadConfig, EngineError> {
    if !found {
        return Ok(WorkloadConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| EngineError::Workload {
        message: format!("failed to read config file: {e}"),
    })?;
    parse_workload_section(&contents)
}

/// Extract the `workload` section from a full config document.
fn parse_workload_section(contents: &str) -> Result<WorkloadConfig, EngineError> {
    if contents.trim().is_empty() {
        return Ok(WorkloadConfig::default());
    }
    let raw: serde_yml::Value =
        serde_yml::from_str(contents).map_err(|e| EngineError::Workload {
            message: format!("failed to parse config YAML: {e}"),
        })?;
    let Some(section) = raw.get("workload") else {
        return Ok(WorkloadConfig::default());
    };
    serde_yml::from_value(section.clone()).map_err(|e| EngineError::Workload {
        message: format!("failed to parse workload config: {e}"),
    })
}
