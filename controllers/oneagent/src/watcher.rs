//! Kubernetes resource watcher.
//!
//! Runs a `kube_runtime::Controller` over OneAgent resources. Changes to the
//! owned DaemonSets, the token secrets and the agent pods are mapped back to
//! the OneAgent they belong to, so each of them triggers a pass.

use std::sync::Arc;
use std::time::Duration;

use crds::OneAgent;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher};
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffTracker;
use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;

/// Requeue delay after a pass that kept losing write races
const CONFLICT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Label carried by every agent pod, used to narrow the pod watch
const AGENT_POD_SELECTOR: &str = "dynatrace=oneagent";

/// Shared state of the reconcile and error policy callbacks
pub struct Context {
    pub reconciler: Arc<Reconciler>,
    pub backoff: BackoffTracker,
    pub reconcile_timeout: Duration,
    pub requeue_interval: Duration,
}

impl Context {
    pub fn new(reconciler: Arc<Reconciler>, config: &OperatorConfig) -> Self {
        Self {
            reconciler,
            backoff: BackoffTracker::default(),
            reconcile_timeout: config.reconcile_timeout,
            requeue_interval: config.requeue_interval,
        }
    }
}

fn resource_key(namespace: Option<&str>, name: &str) -> String {
    format!("{}/{}", namespace.unwrap_or_default(), name)
}

fn object_key(oneagent: &OneAgent) -> String {
    resource_key(oneagent.namespace().as_deref(), &oneagent.name_any())
}

type RunError = kube_runtime::controller::Error<ControllerError, watcher::Error>;

/// Forget the retry state of a OneAgent that was deleted while it kept failing.
///
/// No pass runs for a deleted object, so its backoff entry would never be reset.
pub fn forget_deleted(error: &RunError, backoff: &BackoffTracker) -> bool {
    match error {
        kube_runtime::controller::Error::ObjectNotFound(obj) => {
            backoff.reset(&resource_key(obj.namespace.as_deref(), &obj.name));
            true
        }
        _ => false,
    }
}

/// Requeue decision after a failed pass.
///
/// Errors the user has to fix wait for the steady-state interval (or a watch
/// event), conflicts retry quickly and everything else backs off per resource.
pub fn retry_action(error: &ControllerError, backoff: &BackoffTracker, key: &str, steady: Duration) -> Action {
    if error.is_user_fixable() {
        Action::requeue(steady)
    } else if matches!(error, ControllerError::Conflict(_)) {
        Action::requeue(CONFLICT_RETRY_DELAY)
    } else {
        Action::requeue(backoff.next_delay(key))
    }
}

/// The OneAgent an agent pod belongs to, from its `oneagent` label
pub fn oneagent_for_pod(pod: &Pod) -> Option<ObjectRef<OneAgent>> {
    let namespace = pod.namespace()?;
    let name = pod.labels().get("oneagent")?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// OneAgents in the secret's namespace that read their tokens from it
pub fn oneagents_for_secret(secret: &Secret, oneagents: &[Arc<OneAgent>]) -> Vec<ObjectRef<OneAgent>> {
    let Some(namespace) = secret.namespace() else {
        return vec![];
    };
    let name = secret.name_any();

    oneagents
        .iter()
        .filter(|oa| oa.namespace().as_deref() == Some(namespace.as_str()) && oa.tokens_name() == name)
        .map(|oa| ObjectRef::from_obj(oa.as_ref()))
        .collect()
}

async fn reconcile(oneagent: Arc<OneAgent>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let namespace = oneagent.namespace().unwrap_or_default();
    let name = oneagent.name_any();
    debug!("Reconciling OneAgent {}/{}", namespace, name);

    let result = match tokio::time::timeout(ctx.reconcile_timeout, ctx.reconciler.reconcile(&namespace, &name)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(ControllerError::Timeout(ctx.reconcile_timeout)),
    };

    let action = result?;
    ctx.backoff.reset(&object_key(&oneagent));
    Ok(action)
}

fn error_policy(oneagent: Arc<OneAgent>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let key = object_key(&oneagent);
    if error.is_user_fixable() {
        warn!("OneAgent {} needs attention: {}", key, error);
    } else {
        error!("Reconciliation failed for OneAgent {}: {}", key, error);
    }
    retry_action(error, &ctx.backoff, &key, ctx.requeue_interval)
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Watch OneAgents (in `namespace`, or cluster-wide) until shutdown
pub async fn watch_oneagents(
    client: Client,
    namespace: Option<String>,
    concurrency: u16,
    ctx: Arc<Context>,
) -> Result<(), ControllerError> {
    info!(
        "Starting OneAgent watcher in {}",
        namespace.as_deref().unwrap_or("all namespaces")
    );

    let oneagents: Api<OneAgent> = api(&client, namespace.as_deref());
    let daemonsets: Api<DaemonSet> = api(&client, namespace.as_deref());
    let secrets: Api<Secret> = api(&client, namespace.as_deref());
    let pods: Api<Pod> = api(&client, namespace.as_deref());

    let controller = Controller::new(oneagents, watcher::Config::default());
    let store = controller.store();
    let backoff_ctx = Arc::clone(&ctx);

    controller
        .owns(daemonsets, watcher::Config::default())
        .watches(secrets, watcher::Config::default(), move |secret| {
            oneagents_for_secret(&secret, &store.state())
        })
        .watches(
            pods,
            watcher::Config::default().labels(AGENT_POD_SELECTOR),
            |pod| oneagent_for_pod(&pod),
        )
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            let ctx = Arc::clone(&backoff_ctx);
            async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled OneAgent {}", obj),
                    Err(e) if forget_deleted(&e, &ctx.backoff) => debug!("Dropped retry state of deleted OneAgent: {}", e),
                    Err(e) => warn!("Controller error for OneAgent: {}", e),
                }
            }
        })
        .await;

    info!("OneAgent watcher stopped");
    Ok(())
}
