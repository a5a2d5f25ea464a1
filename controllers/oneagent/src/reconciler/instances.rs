//! Per-node instance aggregation.
//!
//! Rebuilds `status.instances` from the agent pods on every pass. Nodes whose
//! pod disappeared are dropped because the map is rebuilt rather than updated.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crds::OneAgentInstance;
use dynatrace_client::DynatraceClientTrait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::Reconciliation;
use crate::cluster::ClusterClient;
use crate::daemonset::pod_label_selector;
use crate::error::ControllerError;

/// List the agent pods of `rec` and refresh `status.instances`
pub async fn reconcile_instances(
    cluster: &dyn ClusterClient,
    client: &dyn DynatraceClientTrait,
    rec: &mut Reconciliation,
) -> Result<(), ControllerError> {
    let pods = cluster
        .list_pods(&rec.namespace(), &pod_label_selector(&rec.name()))
        .await?;
    debug!(namespace = %rec.namespace(), name = %rec.name(), pods = pods.len(), "Aggregating agent instances");

    let instances = aggregate_instances(client, &rec.status().instances, pods, Utc::now()).await;
    rec.status_mut().instances = instances;
    Ok(())
}

/// Build the instance map for `pods`.
///
/// Pods without a host IP are not scheduled yet and are skipped. When a node
/// runs more than one agent pod, a pod that is not terminating wins. A failed
/// per-host version lookup keeps the previously recorded version of that node.
/// `last_updated` only moves when the record itself changes.
pub async fn aggregate_instances(
    client: &dyn DynatraceClientTrait,
    previous: &BTreeMap<String, OneAgentInstance>,
    mut pods: Vec<Pod>,
    now: DateTime<Utc>,
) -> BTreeMap<String, OneAgentInstance> {
    // Terminating pods sort first so a live pod on the same node replaces them
    pods.sort_by_key(|pod| (pod.metadata.deletion_timestamp.is_none(), pod.name_any()));

    let mut scheduled = BTreeMap::new();
    for pod in pods {
        let pod_name = pod.name_any();
        let Some(ip) = pod
            .status
            .as_ref()
            .and_then(|s| s.host_ip.clone())
            .filter(|ip| !ip.is_empty())
        else {
            debug!(pod = %pod_name, "Pod has no host IP yet, skipping");
            continue;
        };
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| pod_name.clone());
        scheduled.insert(node, (pod_name, ip));
    }

    let mut instances = BTreeMap::new();
    for (node, (pod_name, ip)) in scheduled {
        let cached = previous.get(&node);
        let version = match client.get_agent_version_for_ip(&ip).await {
            Ok(version) => version,
            Err(e) => {
                warn!(node = %node, ip = %ip, "Failed to resolve agent version for host: {}", e);
                cached.map(|c| c.version.clone()).unwrap_or_default()
            }
        };

        let mut record = OneAgentInstance {
            pod_name,
            ip_address: ip,
            version,
            last_updated: Some(now),
        };
        if let Some(cached) = cached {
            if cached.pod_name == record.pod_name
                && cached.ip_address == record.ip_address
                && cached.version == record.version
            {
                record.last_updated = cached.last_updated;
            }
        }

        instances.insert(node, record);
    }

    instances
}
