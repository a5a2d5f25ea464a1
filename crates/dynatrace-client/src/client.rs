//! Dynatrace management API client
//!
//! Implements the REST calls the operator needs against `{apiUrl}/v1/...`.

use crate::dynatrace_trait::DynatraceClientTrait;
use crate::error::DynatraceError;
use crate::models::*;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Connection options for [`DynatraceClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Accept invalid TLS certificates
    pub skip_cert_check: bool,
    /// Proxy URL for all requests
    pub proxy: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            skip_cert_check: false,
            proxy: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Dynatrace management API client
pub struct DynatraceClient {
    client: Client,
    base_url: String,
    api_token: String,
    paas_token: String,
    // Host list, loaded on first per-host lookup
    hosts: Mutex<Option<Vec<HostInfo>>>,
}

impl DynatraceClient {
    /// Create a new Dynatrace client
    ///
    /// # Arguments
    /// * `base_url` - Management API URL (e.g., "https://tenant.live.dynatrace.com/api")
    /// * `api_token` - API token used for host and token lookups
    /// * `paas_token` - PaaS token used for installer metadata
    /// * `options` - TLS, proxy and timeout settings
    pub fn new(
        base_url: String,
        api_token: String,
        paas_token: String,
        options: ClientOptions,
    ) -> Result<Self, DynatraceError> {
        let mut builder = Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.skip_cert_check);

        if let Some(proxy) = options.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| DynatraceError::InvalidConfig(format!("invalid proxy '{}': {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            paas_token,
            hosts: Mutex::new(None),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request
            .header("Authorization", format!("Api-Token {}", token))
            .header("Accept", "application/json")
    }

    /// Map non-2xx responses to errors and decode the body
    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, DynatraceError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        Ok(serde_json::from_str(&body)?)
    }

    async fn load_hosts(&self) -> Result<Vec<HostInfo>, DynatraceError> {
        let url = format!("{}/v1/entity/infrastructure/hosts?includeDetails=false", self.base_url);
        debug!("Fetching host list from {}", url);

        let response = self
            .authorized(self.client.get(&url), &self.api_token)
            .send()
            .await?;
        Self::read_json(response).await
    }
}

fn status_error(status: StatusCode, body: &str) -> DynatraceError {
    let detail = match serde_json::from_str::<ServerErrorResponse>(body) {
        Ok(payload) => format!("{} - {}", payload.error.code, payload.error.message),
        Err(_) => format!("{} - {}", status, body.chars().take(500).collect::<String>()),
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DynatraceError::Authentication(detail),
        StatusCode::NOT_FOUND => DynatraceError::NotFound(detail),
        _ => DynatraceError::Api(detail),
    }
}

#[async_trait::async_trait]
impl DynatraceClientTrait for DynatraceClient {
    async fn get_latest_agent_version(&self, os: &str, installer_type: &str) -> Result<String, DynatraceError> {
        let url = format!(
            "{}/v1/deployment/installer/agent/{}/{}/latest/metainfo",
            self.base_url,
            urlencoding::encode(os),
            urlencoding::encode(installer_type)
        );
        debug!("Fetching latest agent version from {}", url);

        let response = self
            .authorized(self.client.get(&url), &self.paas_token)
            .send()
            .await?;
        let latest: LatestAgentVersion = Self::read_json(response).await?;
        Ok(latest.latest_agent_version)
    }

    async fn get_agent_version_for_ip(&self, ip: &str) -> Result<String, DynatraceError> {
        if ip.is_empty() {
            return Err(DynatraceError::InvalidConfig("ip address must not be empty".to_string()));
        }

        let mut cache = self.hosts.lock().await;
        if cache.is_none() {
            *cache = Some(self.load_hosts().await?);
        }

        cache
            .iter()
            .flatten()
            .find(|host| host.ip_addresses.iter().any(|addr| addr == ip))
            .and_then(|host| host.agent_version.as_ref())
            .map(|version| version.to_string())
            .ok_or_else(|| DynatraceError::NotFound(format!("no agent version known for host {}", ip)))
    }

    async fn get_token_scopes(&self, token: &str) -> Result<TokenScopes, DynatraceError> {
        let url = format!("{}/v1/tokens/lookup", self.base_url);
        debug!("Looking up token scopes");

        let response = self
            .authorized(self.client.post(&url), &self.api_token)
            .json(&TokenLookupRequest { token })
            .send()
            .await?;
        let lookup: TokenLookupResponse = Self::read_json(response).await?;
        Ok(TokenScopes(lookup.scopes))
    }

    async fn get_connection_info(&self) -> Result<ConnectionInfo, DynatraceError> {
        let url = format!("{}/v1/deployment/installer/agent/connectioninfo", self.base_url);
        debug!("Fetching connection info from {}", url);

        let response = self
            .authorized(self.client.get(&url), &self.paas_token)
            .send()
            .await?;
        Self::read_json(response).await
    }
}
