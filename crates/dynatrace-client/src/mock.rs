//! Mock DynatraceClient for unit testing
//!
//! This module provides a mock implementation of DynatraceClientTrait that can be used
//! in unit tests without requiring a reachable Dynatrace tenant.

use crate::dynatrace_trait::DynatraceClientTrait;
use crate::error::DynatraceError;
use crate::models::{ConnectionInfo, TokenScopes};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockState {
    latest_version: String,
    host_versions: HashMap<String, String>,
    failing_hosts: Vec<String>,
    token_scopes: HashMap<String, Vec<String>>,
    unauthorized_tokens: Vec<String>,
    rotated_tokens: HashMap<String, String>,
    tenant_uuid: String,
    fail_latest_version: bool,
    fail_connection_info: bool,
    calls: HashMap<&'static str, usize>,
}

/// Mock DynatraceClient for testing
///
/// Clones share state, so a test can keep a handle while the reconciler owns another.
#[derive(Clone, Default)]
pub struct MockDynatraceClient {
    state: Arc<Mutex<MockState>>,
}

impl MockDynatraceClient {
    /// Create a new mock client with no versions or tokens configured
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    fn record(&self, operation: &'static str) {
        self.with_state(|s| *s.calls.entry(operation).or_default() += 1);
    }

    /// Set the version returned by `get_latest_agent_version`
    pub fn set_latest_version(&self, version: impl Into<String>) {
        self.with_state(|s| s.latest_version = version.into());
    }

    /// Set the agent version reported for a host address
    pub fn set_host_version(&self, ip: impl Into<String>, version: impl Into<String>) {
        self.with_state(|s| {
            s.host_versions.insert(ip.into(), version.into());
        });
    }

    /// Make per-host lookups for this address fail
    pub fn fail_host(&self, ip: impl Into<String>) {
        self.with_state(|s| s.failing_hosts.push(ip.into()));
    }

    /// Grant scopes to a token
    pub fn set_token_scopes(&self, token: impl Into<String>, scopes: &[&str]) {
        self.with_state(|s| {
            s.token_scopes
                .insert(token.into(), scopes.iter().map(|scope| scope.to_string()).collect());
        });
    }

    /// Make scope lookups for this token fail with an authentication error
    pub fn set_unauthorized(&self, token: impl Into<String>) {
        self.with_state(|s| s.unauthorized_tokens.push(token.into()));
    }

    /// Report `successor` as the rotated value of `token`
    pub fn set_rotated_token(&self, token: impl Into<String>, successor: impl Into<String>) {
        self.with_state(|s| {
            s.rotated_tokens.insert(token.into(), successor.into());
        });
    }

    /// Set the tenant UUID returned by `get_connection_info`
    pub fn set_tenant_uuid(&self, tenant_uuid: impl Into<String>) {
        self.with_state(|s| s.tenant_uuid = tenant_uuid.into());
    }

    /// Make `get_latest_agent_version` fail
    pub fn set_fail_latest_version(&self, fail: bool) {
        self.with_state(|s| s.fail_latest_version = fail);
    }

    /// Make `get_connection_info` fail
    pub fn set_fail_connection_info(&self, fail: bool) {
        self.with_state(|s| s.fail_connection_info = fail);
    }

    /// Number of calls made to an operation, by trait method name
    pub fn call_count(&self, operation: &str) -> usize {
        self.with_state(|s| s.calls.get(operation).copied().unwrap_or(0))
    }
}

#[async_trait::async_trait]
impl DynatraceClientTrait for MockDynatraceClient {
    async fn get_latest_agent_version(&self, _os: &str, _installer_type: &str) -> Result<String, DynatraceError> {
        self.record("get_latest_agent_version");
        self.with_state(|s| {
            if s.fail_latest_version {
                Err(DynatraceError::Api("500 - latest version unavailable".to_string()))
            } else {
                Ok(s.latest_version.clone())
            }
        })
    }

    async fn get_agent_version_for_ip(&self, ip: &str) -> Result<String, DynatraceError> {
        self.record("get_agent_version_for_ip");
        self.with_state(|s| {
            if s.failing_hosts.iter().any(|h| h == ip) {
                return Err(DynatraceError::Api(format!("500 - host lookup failed for {}", ip)));
            }
            s.host_versions
                .get(ip)
                .cloned()
                .ok_or_else(|| DynatraceError::NotFound(format!("no agent version known for host {}", ip)))
        })
    }

    async fn get_token_scopes(&self, token: &str) -> Result<TokenScopes, DynatraceError> {
        self.record("get_token_scopes");
        self.with_state(|s| {
            if s.unauthorized_tokens.iter().any(|t| t == token) {
                return Err(DynatraceError::Authentication("401 - Token Authentication failed".to_string()));
            }
            Ok(TokenScopes(s.token_scopes.get(token).cloned().unwrap_or_default()))
        })
    }

    async fn get_connection_info(&self) -> Result<ConnectionInfo, DynatraceError> {
        self.record("get_connection_info");
        self.with_state(|s| {
            if s.fail_connection_info {
                Err(DynatraceError::Api("503 - connection info unavailable".to_string()))
            } else {
                Ok(ConnectionInfo {
                    tenant_uuid: s.tenant_uuid.clone(),
                    communication_endpoints: Vec::new(),
                })
            }
        })
    }

    async fn get_rotated_token(&self, token: &str) -> Result<Option<String>, DynatraceError> {
        self.record("get_rotated_token");
        Ok(self.with_state(|s| s.rotated_tokens.get(token).cloned()))
    }
}
