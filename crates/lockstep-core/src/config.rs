//! Configuration loading and typed config structures for the Lockstep runtime.
//!
//! The canonical configuration lives in `lockstep-config.yaml` at the project
//! root. This module defines strongly-typed structs that mirror the YAML
//! structure, and provides a loader that reads the file and applies
//! environment overrides. Sections the runtime does not know about (such as
//! the engine's `workload` section) are ignored here.

use std::path::Path;

use lockstep_types::Time;
use serde::Deserialize;

/// Environment variable overriding [`LoggingConfig::level`].
pub const ENV_LOG_LEVEL: &str = "LOCKSTEP_LOG_LEVEL";

/// Environment variable overriding [`LoopConfig::max_turns`].
pub const ENV_MAX_TURNS: &str = "LOCKSTEP_MAX_TURNS";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level runtime configuration.
///
/// Mirrors the structure of `lockstep-config.yaml`. Every field has a
/// default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LockstepConfig {
    /// Event loop settings.
    #[serde(default)]
    pub runtime: LoopConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LockstepConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `LOCKSTEP_LOG_LEVEL` overrides `logging.level`
    /// - `LOCKSTEP_MAX_TURNS` overrides `runtime.max_turns`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse_raw(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string and apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config = Self::parse_raw(yaml)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string without consulting the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse_raw(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Override values with environment variables when set.
    ///
    /// A `LOCKSTEP_MAX_TURNS` value that is not an unsigned integer is
    /// ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(ENV_LOG_LEVEL) {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var(ENV_MAX_TURNS)
            && let Ok(turns) = val.trim().parse::<u64>()
        {
            self.runtime.max_turns = turns;
        }
    }
}

/// Event loop configuration.
///
/// A value of 0 for `max_turns` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LoopConfig {
    /// Virtual time at which the clock starts.
    #[serde(default)]
    pub start: Time,

    /// Maximum number of turns a single run may execute (0 = unlimited).
    ///
    /// A turn is one batch of dispatches at the same time. The guard catches
    /// activities that postpone forever without ever letting time advance.
    #[serde(default)]
    pub max_turns: u64,

    /// Stop running once the next deadline lies beyond this time.
    #[serde(default)]
    pub until: Option<Time>,
}

impl LoopConfig {
    /// Create a loop configuration starting at `start` with no limits.
    pub const fn starting_at(start: Time) -> Self {
        Self {
            start,
            max_turns: 0,
            until: None,
        }
    }

    /// Return the turn limit, if one is configured.
    pub const fn turn_limit(&self) -> Option<u64> {
        if self.max_turns == 0 {
            None
        } else {
            Some(self.max_turns)
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter
    /// directive such as `lockstep_core=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit logs as JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

fn default_log_level() -> String {
    "info".to_owned()
}
