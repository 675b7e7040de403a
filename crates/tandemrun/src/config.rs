//! Router configuration.

use std::time::Duration;

use tandemrpc::VERSION;

/// Environment variable holding the per-call deadline in milliseconds.
pub const CALL_TIMEOUT_ENV: &str = "TANDEM_CALL_TIMEOUT_MS";

/// Environment variable overriding the version tag stamped on calls.
pub const VERSION_ENV: &str = "TANDEM_RPC_VERSION";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("TANDEM_CALL_TIMEOUT_MS must be a whole number of milliseconds, got '{0}'")]
    InvalidTimeout(String),
    #[error("TANDEM_RPC_VERSION cannot be empty")]
    EmptyVersion,
}

/// Settings shared by a router and every proxy it builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Deadline after which an unanswered call is rejected and forgotten.
    /// `None` keeps pending calls until a response arrives or the channel closes.
    pub call_timeout: Option<Duration>,
    /// Version tag stamped on outgoing calls.
    pub version: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            version: VERSION.to_string(),
        }
    }
}

impl RouterConfig {
    /// Reads overrides from the process environment on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RouterConfig::from_env`], reading through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(CALL_TIMEOUT_ENV) {
            let millis: u64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidTimeout(raw.clone()))?;
            // zero disables the deadline
            config.call_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }

        if let Some(version) = lookup(VERSION_ENV) {
            let version = version.trim();
            if version.is_empty() {
                return Err(ConfigError::EmptyVersion);
            }
            config.version = version.to_string();
        }

        Ok(config)
    }
}
