//! Status conditions
//!
//! Conditions are kept as a list ordered by first appearance and keyed by
//! type: setting a condition replaces the entry of the same type and never
//! appends a duplicate.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::oneagent::OneAgentStatus;

/// Condition type tracking the API token
pub const API_TOKEN_CONDITION_TYPE: &str = "APIToken";

/// Condition type tracking the PaaS token
pub const PAAS_TOKEN_CONDITION_TYPE: &str = "PaaSToken";

/// Token present, authorized and carrying the required scope
pub const REASON_TOKEN_READY: &str = "TokenReady";
/// The token secret does not exist
pub const REASON_TOKEN_SECRET_NOT_FOUND: &str = "TokenSecretNotFound";
/// The secret lacks the token field or it is empty
pub const REASON_TOKEN_MISSING: &str = "TokenMissing";
/// The management API rejected the token
pub const REASON_TOKEN_UNAUTHORIZED: &str = "TokenUnauthorized";
/// The token lacks the required scope
pub const REASON_TOKEN_SCOPE_MISSING: &str = "TokenScopeMissing";
/// The token could not be checked
pub const REASON_TOKEN_ERROR: &str = "TokenError";

/// Kubernetes-style condition status string for `true`
pub const CONDITION_TRUE: &str = "True";
/// Kubernetes-style condition status string for `false`
pub const CONDITION_FALSE: &str = "False";

/// A typed, timestamped health signal attached to the resource status
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False)
    pub status: String,
    /// Programmatic reason in CamelCase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last time the status flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Creates a condition without a transition time; [`OneAgentStatus::set_condition`] stamps it.
    pub fn new(condition_type: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status { CONDITION_TRUE } else { CONDITION_FALSE }.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: None,
        }
    }

    /// Whether the condition status is `True`
    pub fn is_true(&self) -> bool {
        self.status == CONDITION_TRUE
    }
}

impl OneAgentStatus {
    /// Looks up a condition by type.
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }

    /// Upserts a condition by type and returns whether anything changed.
    ///
    /// The transition time is refreshed when the status flips or the
    /// condition is new, and carried over otherwise.
    pub fn set_condition(&mut self, mut condition: Condition) -> bool {
        match self.conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
            Some(existing) => {
                if existing.status == condition.status
                    && existing.reason == condition.reason
                    && existing.message == condition.message
                {
                    return false;
                }
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time
                } else {
                    Some(Utc::now())
                };
                *existing = condition;
                true
            }
            None => {
                condition.last_transition_time = Some(Utc::now());
                self.conditions.push(condition);
                true
            }
        }
    }
}
