//! Chain-of-trust feature configuration.
//!
//! Configuration is an explicit value threaded through the component
//! constructors — never process-global state — so the accessor, signer, and
//! publisher stay testable in isolation and safe under concurrent task
//! finalizations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Worker configuration for the chain-of-trust feature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainOfTrustConfig {
    /// Path to the provisioned Ed25519 signing-key file.
    pub signing_key_location: PathBuf,

    /// Policy switch for exhausted publish retries: when `true` the task
    /// run is marked failed-for-compliance (its functional output stands,
    /// but no chain-of-trust guarantee could be attached); when `false`
    /// the failure is logged as a warning and the run succeeds.
    #[serde(default = "default_publish_on_failure")]
    pub publish_on_failure: bool,

    /// Deadline for each external helper command, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Artifacts digested concurrently during evidence collection.
    #[serde(default = "default_digest_workers")]
    pub digest_workers: usize,

    /// Upload attempts for the certificate, including the first.
    #[serde(default = "default_max_publish_attempts")]
    pub max_publish_attempts: u32,

    /// Base backoff between upload attempts, in milliseconds. Grows
    /// multiplicatively with the attempt number.
    #[serde(default = "default_publish_backoff_ms")]
    pub publish_backoff_ms: u64,
}

const fn default_publish_on_failure() -> bool {
    true
}

const fn default_command_timeout_secs() -> u64 {
    30
}

const fn default_digest_workers() -> usize {
    4
}

const fn default_max_publish_attempts() -> u32 {
    5
}

const fn default_publish_backoff_ms() -> u64 {
    500
}

impl ChainOfTrustConfig {
    /// Creates a configuration with defaults for everything but the key
    /// location.
    #[must_use]
    pub fn new(signing_key_location: impl Into<PathBuf>) -> Self {
        Self {
            signing_key_location: signing_key_location.into(),
            publish_on_failure: default_publish_on_failure(),
            command_timeout_secs: default_command_timeout_secs(),
            digest_workers: default_digest_workers(),
            max_publish_attempts: default_max_publish_attempts(),
            publish_backoff_ms: default_publish_backoff_ms(),
        }
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for an empty key location or
    /// zero-valued bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_key_location.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "signing_key_location must not be empty".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "command_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.digest_workers == 0 {
            return Err(ConfigError::Validation(
                "digest_workers must be at least 1".to_string(),
            ));
        }
        if self.max_publish_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_publish_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The helper-command deadline as a [`Duration`].
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// The base publish backoff as a [`Duration`].
    #[must_use]
    pub const fn publish_backoff(&self) -> Duration {
        Duration::from_millis(self.publish_backoff_ms)
    }
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[source] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    /// A field value is out of range.
    #[error("invalid config: {0}")]
    Validation(String),
}
