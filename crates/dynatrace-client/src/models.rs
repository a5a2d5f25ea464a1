//! Dynatrace API models
//!
//! Request and response bodies of the management API endpoints used by the operator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating system of the Linux/Unix agent installer
pub const OS_UNIX: &str = "unix";

/// Default installer flavour
pub const INSTALLER_TYPE_DEFAULT: &str = "default";

/// Scope required by the PaaS token to download installers
pub const TOKEN_SCOPE_INSTALLER_DOWNLOAD: &str = "InstallerDownload";

/// Scope required by the API token to read host and token data
pub const TOKEN_SCOPE_DATA_EXPORT: &str = "DataExport";

/// Scopes granted to a token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenScopes(pub Vec<String>);

impl TokenScopes {
    /// Whether the scope is granted
    pub fn contains(&self, scope: &str) -> bool {
        self.0.iter().any(|s| s == scope)
    }
}

impl<S: Into<String>> FromIterator<S> for TokenScopes {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Tenant connection details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    #[serde(rename = "tenantUUID")]
    pub tenant_uuid: String,
    #[serde(default)]
    pub communication_endpoints: Vec<String>,
}

/// Response of `/v1/deployment/installer/agent/{os}/{type}/latest/metainfo`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestAgentVersion {
    pub latest_agent_version: String,
}

/// Body of `POST /v1/tokens/lookup`
#[derive(Debug, Clone, Serialize)]
pub struct TokenLookupRequest<'a> {
    pub token: &'a str,
}

/// Response of `POST /v1/tokens/lookup`
#[derive(Debug, Clone, Deserialize)]
pub struct TokenLookupResponse {
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Entry of `/v1/entity/infrastructure/hosts`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub agent_version: Option<AgentVersion>,
}

/// Agent version as reported per host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    #[serde(default)]
    pub timestamp: String,
}

impl fmt::Display for AgentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.revision, self.timestamp)
    }
}

/// Error payload returned by the API: `{"error": {"code": 400, "message": "..."}}`
#[derive(Debug, Clone, Deserialize)]
pub struct ServerErrorResponse {
    pub error: ServerError,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerError {
    pub code: u16,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_version_display() {
        let version = AgentVersion {
            major: 1,
            minor: 187,
            revision: 2,
            timestamp: "20200301-123456".to_string(),
        };
        assert_eq!(version.to_string(), "1.187.2.20200301-123456");
    }

    #[test]
    fn test_connection_info_field_names() {
        let info: ConnectionInfo =
            serde_json::from_str(r#"{"tenantUUID":"abc123456","communicationEndpoints":["https://a"]}"#).unwrap();
        assert_eq!(info.tenant_uuid, "abc123456");
        assert_eq!(info.communication_endpoints, vec!["https://a".to_string()]);
    }

    #[test]
    fn test_token_scopes_contains() {
        let scopes: TokenScopes = [TOKEN_SCOPE_DATA_EXPORT, "ReadConfig"].into_iter().collect();
        assert!(scopes.contains(TOKEN_SCOPE_DATA_EXPORT));
        assert!(!scopes.contains(TOKEN_SCOPE_INSTALLER_DOWNLOAD));
    }
}
