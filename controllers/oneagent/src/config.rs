//! Operator configuration.
//!
//! Read once at startup from environment variables.

use crate::error::ControllerError;
use std::time::Duration;

/// Log output format selected by `RUST_LOG_FORMAT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Runtime settings of the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Namespace to watch, all namespaces when `None`
    pub namespace: Option<String>,
    /// Steady-state requeue interval after a successful pass
    pub requeue_interval: Duration,
    /// Upper bound of concurrently running reconcile passes
    pub max_concurrent_reconciles: u16,
    /// Deadline of a single reconcile pass
    pub reconcile_timeout: Duration,
    /// Write rotated PaaS tokens back and check the PaaS token scope
    pub update_paas_token: bool,
    /// Write rotated API tokens back and check the API token scope
    pub update_api_token: bool,
    pub log_format: LogFormat,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            requeue_interval: Duration::from_secs(30 * 60),
            max_concurrent_reconciles: 3,
            reconcile_timeout: Duration::from_secs(300),
            update_paas_token: true,
            update_api_token: true,
            log_format: LogFormat::Text,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let requeue_secs = parse_or(get("REQUEUE_INTERVAL_SECONDS"), "REQUEUE_INTERVAL_SECONDS", defaults.requeue_interval.as_secs())?;
        let timeout_secs = parse_or(get("RECONCILE_TIMEOUT_SECONDS"), "RECONCILE_TIMEOUT_SECONDS", defaults.reconcile_timeout.as_secs())?;
        let max_concurrent_reconciles = parse_or(get("MAX_CONCURRENT_RECONCILES"), "MAX_CONCURRENT_RECONCILES", defaults.max_concurrent_reconciles)?;

        if requeue_secs == 0 {
            return Err(ControllerError::InvalidConfig("REQUEUE_INTERVAL_SECONDS must be greater than 0".to_string()));
        }
        if timeout_secs == 0 {
            return Err(ControllerError::InvalidConfig("RECONCILE_TIMEOUT_SECONDS must be greater than 0".to_string()));
        }
        if max_concurrent_reconciles == 0 {
            return Err(ControllerError::InvalidConfig("MAX_CONCURRENT_RECONCILES must be greater than 0".to_string()));
        }

        let log_format = match get("RUST_LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "RUST_LOG_FORMAT must be 'text' or 'json', got '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            namespace: get("WATCH_NAMESPACE"),
            requeue_interval: Duration::from_secs(requeue_secs),
            max_concurrent_reconciles,
            reconcile_timeout: Duration::from_secs(timeout_secs),
            update_paas_token: parse_bool(get("UPDATE_PAAS_TOKEN"), "UPDATE_PAAS_TOKEN", defaults.update_paas_token)?,
            update_api_token: parse_bool(get("UPDATE_API_TOKEN"), "UPDATE_API_TOKEN", defaults.update_api_token)?,
            log_format,
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, ControllerError> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ControllerError::InvalidConfig(format!("{} must be a non-negative integer, got '{}'", key, v))),
    }
}

fn parse_bool(value: Option<String>, key: &str, default: bool) -> Result<bool, ControllerError> {
    match value.map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(ControllerError::InvalidConfig(format!("{} must be a boolean, got '{}'", key, other))),
    }
}
