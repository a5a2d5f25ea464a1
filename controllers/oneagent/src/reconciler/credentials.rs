//! Token secret handling.
//!
//! Reads the PaaS and API tokens, writes rotated tokens back to secrets that
//! opt in, checks token scopes and maintains the token conditions.

use std::sync::Arc;

use crds::{
    ANNOTATION_ACCEPT_TOKEN_ROTATION, API_TOKEN_CONDITION_TYPE, API_TOKEN_KEY, Condition, OneAgentStatus,
    PAAS_TOKEN_CONDITION_TYPE, PAAS_TOKEN_KEY, REASON_TOKEN_ERROR, REASON_TOKEN_MISSING, REASON_TOKEN_READY,
    REASON_TOKEN_SCOPE_MISSING, REASON_TOKEN_SECRET_NOT_FOUND, REASON_TOKEN_UNAUTHORIZED,
};
use dynatrace_client::{DynatraceClientTrait, DynatraceError, TOKEN_SCOPE_DATA_EXPORT, TOKEN_SCOPE_INSTALLER_DOWNLOAD};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, info, warn};

use super::{Reconciliation, ReconcilerOptions};
use crate::client_factory::{DynatraceClientFactory, Tokens};
use crate::cluster::ClusterClient;
use crate::error::{ControllerError, kube_write_error};

/// One of the two tokens held by the secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Paas,
    Api,
}

impl TokenKind {
    fn key(self) -> &'static str {
        match self {
            Self::Paas => PAAS_TOKEN_KEY,
            Self::Api => API_TOKEN_KEY,
        }
    }

    fn condition_type(self) -> &'static str {
        match self {
            Self::Paas => PAAS_TOKEN_CONDITION_TYPE,
            Self::Api => API_TOKEN_CONDITION_TYPE,
        }
    }

    fn required_scope(self) -> &'static str {
        match self {
            Self::Paas => TOKEN_SCOPE_INSTALLER_DOWNLOAD,
            Self::Api => TOKEN_SCOPE_DATA_EXPORT,
        }
    }

    fn value(self, tokens: &Tokens) -> &str {
        match self {
            Self::Paas => &tokens.paas_token,
            Self::Api => &tokens.api_token,
        }
    }

    fn value_mut(self, tokens: &mut Tokens) -> &mut String {
        match self {
            Self::Paas => &mut tokens.paas_token,
            Self::Api => &mut tokens.api_token,
        }
    }

    fn enabled(self, options: &ReconcilerOptions) -> bool {
        match self {
            Self::Paas => options.update_paas_token,
            Self::Api => options.update_api_token,
        }
    }
}

const TOKEN_KINDS: [TokenKind; 2] = [TokenKind::Paas, TokenKind::Api];

fn read_token(secret: &Secret, key: &str) -> String {
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8_lossy(&value.0).trim().to_string();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Tokens stored in `secret`, empty when a key is absent
pub fn read_tokens(secret: &Secret) -> Tokens {
    Tokens {
        paas_token: read_token(secret, PAAS_TOKEN_KEY),
        api_token: read_token(secret, API_TOKEN_KEY),
    }
}

/// Whether the secret opted in to having rotated tokens written back
pub fn accepts_rotation(secret: &Secret) -> bool {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_ACCEPT_TOKEN_ROTATION))
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn set_false(status: &mut OneAgentStatus, kind: TokenKind, reason: &str, message: String) {
    status.set_condition(Condition::new(kind.condition_type(), false, reason, message));
}

/// Resolve, rotate and validate the tokens of `rec`.
///
/// Returns a client built from the validated tokens. Both tokens are checked
/// before the first failure is returned so both conditions reflect this pass.
///
/// Rotation only has an effect with clients that implement
/// `get_rotated_token`. The HTTP client does not, so annotated secrets are
/// left as they are in production.
pub async fn reconcile_credentials(
    cluster: &dyn ClusterClient,
    factory: &dyn DynatraceClientFactory,
    options: &ReconcilerOptions,
    rec: &mut Reconciliation,
) -> Result<Arc<dyn DynatraceClientTrait>, ControllerError> {
    let namespace = rec.namespace();
    let secret_name = rec.status().tokens.clone();

    let Some(mut secret) = cluster.get_secret(&namespace, &secret_name).await? else {
        let message = format!("Secret '{}' not found", secret_name);
        for kind in TOKEN_KINDS {
            set_false(rec.status_mut(), kind, REASON_TOKEN_SECRET_NOT_FOUND, message.clone());
        }
        return Err(ControllerError::Configuration(format!(
            "token secret {}/{} not found",
            namespace, secret_name
        )));
    };

    let mut tokens = read_tokens(&secret);
    if accepts_rotation(&secret) && TOKEN_KINDS.iter().any(|k| k.enabled(options)) {
        let client = factory.build(&rec.instance, &tokens)?;
        if rotate_tokens(client.as_ref(), options, &mut tokens).await? {
            write_tokens(&mut secret, &tokens);
            cluster
                .replace_secret(&namespace, &secret)
                .await
                .map_err(kube_write_error)?;
            info!(namespace = %namespace, secret = %secret_name, "Wrote rotated tokens to secret");
        }
    }

    let client = factory.build(&rec.instance, &tokens)?;
    let mut first_error = None;
    for kind in TOKEN_KINDS {
        if let Err(e) = check_token(client.as_ref(), options, rec.status_mut(), kind, &tokens, &secret_name).await {
            warn!(namespace = %namespace, secret = %secret_name, "Token check failed: {}", e);
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(client),
    }
}

/// Replace tokens the API reports a successor for. Returns whether any changed.
async fn rotate_tokens(
    client: &dyn DynatraceClientTrait,
    options: &ReconcilerOptions,
    tokens: &mut Tokens,
) -> Result<bool, ControllerError> {
    let mut rotated = false;
    for kind in TOKEN_KINDS {
        let current = kind.value(tokens);
        if !kind.enabled(options) || current.is_empty() {
            continue;
        }
        if let Some(successor) = client.get_rotated_token(current).await? {
            if !successor.is_empty() && successor != current {
                debug!(key = kind.key(), "Token rotated");
                *kind.value_mut(tokens) = successor;
                rotated = true;
            }
        }
    }
    Ok(rotated)
}

fn write_tokens(secret: &mut Secret, tokens: &Tokens) {
    let data = secret.data.get_or_insert_with(Default::default);
    for kind in TOKEN_KINDS {
        data.insert(kind.key().to_string(), ByteString(kind.value(tokens).as_bytes().to_vec()));
    }
    if let Some(string_data) = secret.string_data.as_mut() {
        for kind in TOKEN_KINDS {
            string_data.remove(kind.key());
        }
    }
}

async fn check_token(
    client: &dyn DynatraceClientTrait,
    options: &ReconcilerOptions,
    status: &mut OneAgentStatus,
    kind: TokenKind,
    tokens: &Tokens,
    secret_name: &str,
) -> Result<(), ControllerError> {
    let token = kind.value(tokens);
    if token.is_empty() {
        set_false(
            status,
            kind,
            REASON_TOKEN_MISSING,
            format!("Token {} on secret {} missing", kind.key(), secret_name),
        );
        return Err(ControllerError::Configuration(format!(
            "token {} missing from secret {}",
            kind.key(),
            secret_name
        )));
    }

    if !kind.enabled(options) {
        return Ok(());
    }

    match client.get_token_scopes(token).await {
        Ok(scopes) if scopes.contains(kind.required_scope()) => {
            status.set_condition(Condition::new(kind.condition_type(), true, REASON_TOKEN_READY, "Ready"));
            Ok(())
        }
        Ok(_) => {
            set_false(
                status,
                kind,
                REASON_TOKEN_SCOPE_MISSING,
                format!("Token on secret {} missing scope {}", secret_name, kind.required_scope()),
            );
            Err(ControllerError::InsufficientScope(format!(
                "token {} on secret {} lacks scope {}",
                kind.key(),
                secret_name,
                kind.required_scope()
            )))
        }
        Err(e @ DynatraceError::Authentication(_)) => {
            set_false(
                status,
                kind,
                REASON_TOKEN_UNAUTHORIZED,
                format!("Token on secret {} unauthorized", secret_name),
            );
            Err(ControllerError::Upstream(e))
        }
        Err(e) => {
            set_false(
                status,
                kind,
                REASON_TOKEN_ERROR,
                format!("Failed to verify token on secret {}: {}", secret_name, e),
            );
            Err(ControllerError::Upstream(e))
        }
    }
}
