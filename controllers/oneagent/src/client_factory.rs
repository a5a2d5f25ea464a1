//! Construction of Dynatrace API clients.
//!
//! A client is built per reconcile pass from the OneAgent spec and the tokens
//! read from its secret, so credential changes take effect on the next pass.

use std::sync::Arc;
use std::time::Duration;

use crds::OneAgent;
use dynatrace_client::{ClientOptions, DynatraceClient, DynatraceClientTrait, DynatraceError};

use crate::error::ControllerError;

/// Token pair read from the OneAgent token secret
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokens {
    pub paas_token: String,
    pub api_token: String,
}

/// Builds Dynatrace clients for a OneAgent
pub trait DynatraceClientFactory: Send + Sync {
    fn build(&self, instance: &OneAgent, tokens: &Tokens) -> Result<Arc<dyn DynatraceClientTrait>, ControllerError>;
}

/// Factory producing REST clients
#[derive(Debug, Clone)]
pub struct HttpDynatraceClientFactory {
    timeout: Duration,
}

impl HttpDynatraceClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpDynatraceClientFactory {
    fn default() -> Self {
        Self::new(ClientOptions::default().timeout)
    }
}

impl DynatraceClientFactory for HttpDynatraceClientFactory {
    fn build(&self, instance: &OneAgent, tokens: &Tokens) -> Result<Arc<dyn DynatraceClientTrait>, ControllerError> {
        let options = ClientOptions {
            skip_cert_check: instance.spec.skip_cert_check,
            proxy: instance.spec.proxy.clone(),
            timeout: self.timeout,
        };

        match DynatraceClient::new(
            instance.spec.api_url.clone(),
            tokens.api_token.clone(),
            tokens.paas_token.clone(),
            options,
        ) {
            Ok(client) => Ok(Arc::new(client)),
            Err(DynatraceError::InvalidConfig(msg)) => Err(ControllerError::Configuration(msg)),
            Err(e) => Err(ControllerError::Upstream(e)),
        }
    }
}
