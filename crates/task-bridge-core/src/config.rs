//! Bridge configuration.
//!
//! Resolved from compiled defaults for the selected [`Environment`], then
//! overridden by environment variables:
//!
//! - `TASK_BRIDGE_ENV` - `development` (default) or `production`
//! - `TASK_BRIDGE_URL` - endpoint, must be `ws://` or `wss://`
//! - `TASK_BRIDGE_CONNECT_TIMEOUT_SECS` - handshake timeout, default 10
//! - `TASK_BRIDGE_TOKEN` - bearer token attached to dispatched jobs

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_VAR: &str = "TASK_BRIDGE_ENV";
pub const URL_VAR: &str = "TASK_BRIDGE_URL";
pub const TIMEOUT_VAR: &str = "TASK_BRIDGE_CONNECT_TIMEOUT_SECS";
pub const TOKEN_VAR: &str = "TASK_BRIDGE_TOKEN";

/// Default handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Endpoint must be a ws:// or wss:// URL, got '{0}'")]
    InvalidEndpoint(String),
    #[error("Invalid connect timeout '{0}'")]
    InvalidTimeout(String),
    #[error("Unknown environment '{0}' (expected development or production)")]
    UnknownEnvironment(String),
}

/// Deployment environment, selecting the default endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    #[must_use]
    pub const fn default_endpoint(self) -> &'static str {
        match self {
            Self::Development => "ws://127.0.0.1:8000/ws",
            Self::Production => "wss://www.ccioi.com/ws",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(ConfigError::UnknownEnvironment(s.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Production => "production",
        })
    }
}

/// Settings for one bridge endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub endpoint_url: String,
    pub connect_timeout: Duration,
    pub token: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

impl BridgeConfig {
    /// Compiled defaults for an environment.
    #[must_use]
    pub fn for_environment(env: Environment) -> Self {
        Self {
            endpoint_url: env.default_endpoint().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            token: None,
        }
    }

    /// Defaults overridden by a different endpoint.
    ///
    /// # Errors
    /// Returns error if the URL is not `ws://` or `wss://`.
    pub fn with_endpoint(url: impl Into<String>) -> Result<Self, ConfigError> {
        let endpoint_url = validate_endpoint(url.into())?;
        Ok(Self {
            endpoint_url,
            ..Self::default()
        })
    }

    /// Resolve from the process environment.
    ///
    /// # Errors
    /// Returns error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns error if a variable is set to an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let env = get(ENV_VAR)
            .map(|v| v.parse::<Environment>())
            .transpose()?
            .unwrap_or_default();
        let mut config = Self::for_environment(env);

        if let Some(url) = get(URL_VAR) {
            config.endpoint_url = validate_endpoint(url)?;
        }
        if let Some(secs) = get(TIMEOUT_VAR) {
            config.connect_timeout = parse_timeout(&secs)?;
        }
        config.token = get(TOKEN_VAR);
        Ok(config)
    }
}

/// Check that a URL is a WebSocket endpoint.
///
/// # Errors
/// Returns error if the scheme is not `ws` or `wss` or the host is missing.
pub fn validate_endpoint(url: impl Into<String>) -> Result<String, ConfigError> {
    let url = url.into().trim().to_string();
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"));
    match rest {
        Some(rest) if !rest.is_empty() && !rest.starts_with('/') => Ok(url),
        _ => Err(ConfigError::InvalidEndpoint(url)),
    }
}

fn parse_timeout(raw: &str) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidTimeout(raw.to_string())),
    }
}
