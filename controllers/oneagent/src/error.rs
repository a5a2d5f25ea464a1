//! Controller-specific error types.
//!
//! This module defines the error taxonomy of the OneAgent operator. The variant
//! decides how a failed pass is reported and how soon it is retried.

use dynatrace_client::DynatraceError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the OneAgent operator.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Missing or malformed secret or spec field, fixable by the user
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A token lacks a required scope
    #[error("Insufficient token scope: {0}")]
    InsufficientScope(String),

    /// Dynatrace management API error
    #[error("Dynatrace API error: {0}")]
    Upstream(#[from] DynatraceError),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Optimistic concurrency write was rejected
    #[error("Conflicting update: {0}")]
    Conflict(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid operator configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconcile pass exceeded its deadline
    #[error("Reconciliation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Errors the user has to fix; retrying sooner than the steady-state interval is pointless.
    pub fn is_user_fixable(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::InsufficientScope(_))
    }
}

/// HTTP status carried by a Kubernetes API error
pub fn kube_status(err: &KubeError) -> Option<u16> {
    match err {
        KubeError::Api(response) => Some(response.code),
        _ => None,
    }
}

/// Whether a Kubernetes API error is an optimistic concurrency conflict
pub fn is_conflict(err: &KubeError) -> bool {
    kube_status(err) == Some(409)
}

/// Whether a Kubernetes API error reports a missing object
pub fn is_not_found(err: &KubeError) -> bool {
    kube_status(err) == Some(404)
}

/// Classify a failed write: conflicts re-run the pass, anything else is a cluster error
pub fn kube_write_error(err: KubeError) -> ControllerError {
    if is_conflict(&err) {
        ControllerError::Conflict(err.to_string())
    } else {
        ControllerError::Kube(err)
    }
}
