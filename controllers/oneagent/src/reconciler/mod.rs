//! Reconciliation engine for OneAgent resources.
//!
//! One pass runs these steps in order, stopping at the first error:
//! - `credentials`: resolve the token secret, rotate and validate tokens
//! - `version`: decide the fleet-wide agent version
//! - DaemonSet apply (create, replace or recreate)
//! - `instances`: refresh the per-node records from the agent pods
//!
//! The phase is then derived by `phase::next_phase` and the status is written
//! once, only if it differs from what the pass started with.

pub mod credentials;
pub mod instances;
pub mod phase;
pub mod status;
pub mod version;


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crds::{OneAgent, OneAgentStatus};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::client_factory::DynatraceClientFactory;
use crate::cluster::ClusterClient;
use crate::config::OperatorConfig;
use crate::daemonset::{DaemonSetUpdate, build_daemonset, plan_update};
use crate::error::{ControllerError, is_not_found, kube_write_error};
use phase::{StepResults, next_phase};

/// Attempts of a pass that keeps hitting write conflicts
const MAX_CONFLICT_ATTEMPTS: usize = 3;

static EMPTY_STATUS: OneAgentStatus = OneAgentStatus {
    phase: None,
    version: String::new(),
    tokens: String::new(),
    instances: BTreeMap::new(),
    conditions: Vec::new(),
};

/// Engine settings taken from the operator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerOptions {
    pub requeue_interval: Duration,
    pub update_paas_token: bool,
    pub update_api_token: bool,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self::from(&OperatorConfig::default())
    }
}

impl From<&OperatorConfig> for ReconcilerOptions {
    fn from(config: &OperatorConfig) -> Self {
        Self {
            requeue_interval: config.requeue_interval,
            update_paas_token: config.update_paas_token,
            update_api_token: config.update_api_token,
        }
    }
}

/// State of one reconcile pass.
///
/// `instance.status` is the working status; `original` is what was read at the
/// start of the pass and decides whether a write is needed.
pub struct Reconciliation {
    pub instance: OneAgent,
    original: OneAgentStatus,
    /// The fleet-wide version was adopted for the first time during this pass
    pub version_bootstrapped: bool,
}

impl Reconciliation {
    pub fn new(mut instance: OneAgent) -> Self {
        let original = instance.status.clone().unwrap_or_default();
        instance.status = Some(original.clone());
        Self {
            instance,
            original,
            version_bootstrapped: false,
        }
    }

    pub fn name(&self) -> String {
        self.instance.name_any()
    }

    pub fn namespace(&self) -> String {
        self.instance.namespace().unwrap_or_default()
    }

    pub fn status(&self) -> &OneAgentStatus {
        self.instance.status.as_ref().unwrap_or(&EMPTY_STATUS)
    }

    pub fn status_mut(&mut self) -> &mut OneAgentStatus {
        self.instance.status.get_or_insert_with(Default::default)
    }

    pub fn original_status(&self) -> &OneAgentStatus {
        &self.original
    }

    /// The working status differs from the one read at the start of the pass
    pub fn is_dirty(&self) -> bool {
        *self.status() != self.original
    }
}

/// Drives OneAgent resources towards their desired state.
pub struct Reconciler {
    cluster: Arc<dyn ClusterClient>,
    client_factory: Arc<dyn DynatraceClientFactory>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        client_factory: Arc<dyn DynatraceClientFactory>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            cluster,
            client_factory,
            options,
        }
    }

    /// Reconcile the OneAgent `namespace/name`.
    ///
    /// A pass that loses an optimistic-concurrency race is re-run from a fresh
    /// read, up to `MAX_CONFLICT_ATTEMPTS` times.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action, ControllerError> {
        let span = info_span!("reconcile", %namespace, %name);
        async move {
            let mut attempt = 1;
            loop {
                match self.reconcile_once(namespace, name).await {
                    Err(ControllerError::Conflict(msg)) if attempt < MAX_CONFLICT_ATTEMPTS => {
                        debug!(attempt, "Write conflict, re-running pass: {}", msg);
                        attempt += 1;
                    }
                    result => return result,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn reconcile_once(&self, namespace: &str, name: &str) -> Result<Action, ControllerError> {
        let Some(instance) = self.cluster.get_oneagent(namespace, name).await? else {
            debug!("OneAgent no longer exists");
            return Ok(Action::await_change());
        };

        let mut rec = Reconciliation::new(instance);
        let result = self.reconcile_impl(&mut rec).await;
        if let Err(e @ ControllerError::Conflict(_)) = result {
            return Err(e);
        }

        let results = StepResults {
            failed: result.is_err(),
            version_bootstrapped: rec.version_bootstrapped,
        };
        let phase = next_phase(rec.status().phase, &results);
        rec.status_mut().phase = phase;

        match self.persist_status(&rec).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("OneAgent deleted during the pass");
                return Ok(Action::await_change());
            }
            Err(e @ ControllerError::Conflict(_)) => return Err(e),
            Err(e) => match result {
                // the pass error is the more useful one to report
                Err(_) => warn!("Failed to persist status: {}", e),
                Ok(()) => return Err(e),
            },
        }

        result.map(|_| Action::requeue(self.options.requeue_interval))
    }

    async fn reconcile_impl(&self, rec: &mut Reconciliation) -> Result<(), ControllerError> {
        let tokens_name = rec.instance.tokens_name();
        if rec.status().tokens != tokens_name {
            debug!(tokens = %tokens_name, "Token secret name changed");
            rec.status_mut().tokens = tokens_name;
        }

        let client = credentials::reconcile_credentials(
            self.cluster.as_ref(),
            self.client_factory.as_ref(),
            &self.options,
            rec,
        )
        .await?;

        let connection_info = client.get_connection_info().await?;

        version::reconcile_version(client.as_ref(), rec).await?;

        self.reconcile_daemonset(rec, &connection_info.tenant_uuid).await?;

        instances::reconcile_instances(self.cluster.as_ref(), client.as_ref(), rec).await
    }

    async fn reconcile_daemonset(&self, rec: &Reconciliation, tenant_uuid: &str) -> Result<(), ControllerError> {
        let namespace = rec.namespace();
        let name = rec.name();
        let mut desired = build_daemonset(&rec.instance, tenant_uuid)?;
        let live = self.cluster.get_daemonset(&namespace, &name).await?;

        match plan_update(&desired, live.as_ref()) {
            DaemonSetUpdate::Create => {
                info!("Creating DaemonSet");
                self.cluster
                    .create_daemonset(&namespace, &desired)
                    .await
                    .map_err(kube_write_error)?;
            }
            DaemonSetUpdate::Replace => {
                info!("Updating DaemonSet");
                desired.metadata.resource_version = live.and_then(|ds| ds.metadata.resource_version);
                self.cluster
                    .replace_daemonset(&namespace, &desired)
                    .await
                    .map_err(kube_write_error)?;
            }
            DaemonSetUpdate::Recreate => {
                info!("Immutable DaemonSet fields changed, recreating");
                self.cluster
                    .delete_daemonset(&namespace, &name)
                    .await
                    .map_err(kube_write_error)?;
                self.cluster
                    .create_daemonset(&namespace, &desired)
                    .await
                    .map_err(kube_write_error)?;
            }
            DaemonSetUpdate::Unchanged => debug!("DaemonSet up to date"),
        }
        Ok(())
    }

    /// Write the status if it changed. Returns false when the OneAgent is gone.
    async fn persist_status(&self, rec: &Reconciliation) -> Result<bool, ControllerError> {
        if !rec.is_dirty() {
            return Ok(true);
        }

        let patch = status::status_patch(
            rec.original_status(),
            rec.status(),
            rec.instance.metadata.resource_version.as_deref(),
        )?;
        match self
            .cluster
            .patch_oneagent_status(&rec.namespace(), &rec.name(), &patch)
            .await
        {
            Ok(_) => {
                debug!(phase = ?rec.status().phase, version = %rec.status().version, "Status updated");
                Ok(true)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(kube_write_error(e)),
        }
    }
}
