//! DynatraceClient trait for mocking
//!
//! This trait abstracts the Dynatrace management API so the reconciler can
//! run against the REST client in production and an in-memory mock in tests.

use crate::error::DynatraceError;
use crate::models::{ConnectionInfo, TokenScopes};

/// Trait for Dynatrace management API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait DynatraceClientTrait: Send + Sync {
    /// Latest agent version available for an OS / installer type pair
    async fn get_latest_agent_version(&self, os: &str, installer_type: &str) -> Result<String, DynatraceError>;

    /// Agent version installed on the host with the given IP address
    async fn get_agent_version_for_ip(&self, ip: &str) -> Result<String, DynatraceError>;

    /// Scopes granted to a token
    async fn get_token_scopes(&self, token: &str) -> Result<TokenScopes, DynatraceError>;

    /// Tenant connection details
    async fn get_connection_info(&self) -> Result<ConnectionInfo, DynatraceError>;

    /// Successor of a rotated token, if the API knows one
    async fn get_rotated_token(&self, _token: &str) -> Result<Option<String>, DynatraceError> {
        Ok(None)
    }
}
