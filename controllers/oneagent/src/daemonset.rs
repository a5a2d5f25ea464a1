//! OneAgent DaemonSet builder.
//!
//! Pure functions turning a `OneAgent` into the DaemonSet that runs the agent
//! on every node. The output depends only on the input, so the content hashes
//! stored in the annotations identify a spec. Hand edits to the live pod
//! template are caught by comparing the fields the builder sets.

use std::collections::BTreeMap;

use crds::{
    DEFAULT_DNS_POLICY, DEFAULT_ONEAGENT_IMAGE, DEFAULT_SERVICE_ACCOUNT, DNS_POLICIES, OneAgent, PAAS_TOKEN_KEY,
};
use dynatrace_client::{INSTALLER_TYPE_DEFAULT, OS_UNIX};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ExecAction, HostPathVolumeSource, PodSpec, PodTemplateSpec, Probe,
    SecretKeySelector, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ControllerError;

pub const CONTAINER_NAME: &str = "dynatrace-oneagent";

/// SHA-256 of the DaemonSet spec
pub const ANNOTATION_TEMPLATE_HASH: &str = "oneagent.dynatrace.com/template-hash";

/// SHA-256 of the fields Kubernetes refuses to change in place
pub const ANNOTATION_IMMUTABLE_HASH: &str = "oneagent.dynatrace.com/immutable-hash";

const HOST_ROOT_VOLUME: &str = "host-root";
const HOST_ROOT_MOUNT_PATH: &str = "/mnt/root";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "dynatrace-oneagent-operator";

/// Labels selecting the agent pods of one OneAgent
pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("dynatrace".to_string(), "oneagent".to_string()),
        ("oneagent".to_string(), name.to_string()),
    ])
}

/// Label selector string for listing the agent pods of one OneAgent
pub fn pod_label_selector(name: &str) -> String {
    selector_labels(name)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Selector labels plus the user overlay. The overlay wins over the other base labels.
pub fn build_labels(instance: &OneAgent) -> BTreeMap<String, String> {
    let mut labels = selector_labels(&instance.name_any());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels.extend(instance.spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    labels
}

/// Effective DNS policy of the agent pods
pub fn dns_policy(instance: &OneAgent) -> &str {
    instance
        .spec
        .dns_policy
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_DNS_POLICY)
}

/// Reject specs no valid DaemonSet can be built from
pub fn validate_spec(instance: &OneAgent) -> Result<(), ControllerError> {
    let name = instance
        .meta()
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ControllerError::Configuration("OneAgent has no name".to_string()))?;
    if instance.namespace().filter(|ns| !ns.is_empty()).is_none() {
        return Err(ControllerError::Configuration(format!("OneAgent {} has no namespace", name)));
    }

    let api_url = instance.spec.api_url.trim_end_matches('/');
    if !(api_url.starts_with("https://") || api_url.starts_with("http://")) || !api_url.ends_with("/api") {
        return Err(ControllerError::Configuration(format!(
            "apiUrl '{}' must be an http(s) URL ending in /api",
            instance.spec.api_url
        )));
    }

    let policy = dns_policy(instance);
    if !DNS_POLICIES.contains(&policy) {
        return Err(ControllerError::Configuration(format!(
            "dnsPolicy '{}' is not one of {:?}",
            policy, DNS_POLICIES
        )));
    }

    for (key, value) in selector_labels(name) {
        if let Some(overlay) = instance.spec.labels.get(&key) {
            if *overlay != value {
                return Err(ControllerError::Configuration(format!(
                    "label '{}' is reserved for the pod selector and must be '{}'",
                    key, value
                )));
            }
        }
    }

    Ok(())
}

/// Installer download URL, pinned to `version` when known
pub fn installer_url(api_url: &str, version: &str) -> String {
    let target = if version.is_empty() {
        "latest".to_string()
    } else {
        format!("version/{}", version)
    };
    format!(
        "{}/v1/deployment/installer/agent/{}/{}/{}?Api-Token=$(ONEAGENT_INSTALLER_TOKEN)&arch=x86&flavor=default",
        api_url.trim_end_matches('/'),
        OS_UNIX,
        INSTALLER_TYPE_DEFAULT,
        target
    )
}

fn env_value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn build_env(instance: &OneAgent, tenant_uuid: &str) -> Vec<EnvVar> {
    let version = instance.status.as_ref().map(|s| s.version.as_str()).unwrap_or_default();

    let mut env = vec![
        EnvVar {
            name: "ONEAGENT_INSTALLER_TOKEN".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: instance.tokens_name(),
                    key: PAAS_TOKEN_KEY.to_string(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        env_value("ONEAGENT_INSTALLER_SCRIPT_URL", installer_url(&instance.spec.api_url, version)),
        env_value("ONEAGENT_INSTALLER_SKIP_CERT_CHECK", instance.spec.skip_cert_check.to_string()),
        env_value("ONEAGENT_TENANT_UUID", tenant_uuid),
    ];

    if let Some(path) = instance.spec.install_path.as_deref().filter(|p| !p.is_empty()) {
        env.push(env_value("ONEAGENT_INSTALL_PATH", path));
    }
    if let Some(proxy) = instance.spec.proxy.as_deref().filter(|p| !p.is_empty()) {
        env.push(env_value("https_proxy", proxy));
    }

    env.extend(instance.spec.env.iter().cloned());
    env
}

fn build_container(instance: &OneAgent, tenant_uuid: &str) -> Container {
    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(
            instance
                .spec
                .image
                .clone()
                .filter(|i| !i.is_empty())
                .unwrap_or_else(|| DEFAULT_ONEAGENT_IMAGE.to_string()),
        ),
        args: (!instance.spec.args.is_empty()).then(|| instance.spec.args.clone()),
        env: Some(build_env(instance, tenant_uuid)),
        resources: instance.spec.resources.clone(),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: HOST_ROOT_VOLUME.to_string(),
            mount_path: HOST_ROOT_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "grep -q oneagentwatchdo /proc/[0-9]*/stat".to_string(),
                ]),
            }),
            initial_delay_seconds: Some(30),
            period_seconds: Some(30),
            timeout_seconds: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_tolerations(instance: &OneAgent) -> Vec<Toleration> {
    if instance.spec.tolerations.is_empty() {
        vec![Toleration {
            operator: Some("Exists".to_string()),
            ..Default::default()
        }]
    } else {
        instance.spec.tolerations.clone()
    }
}

fn build_pod_spec(instance: &OneAgent, tenant_uuid: &str) -> PodSpec {
    PodSpec {
        containers: vec![build_container(instance, tenant_uuid)],
        host_network: Some(instance.spec.host_network),
        host_pid: Some(instance.spec.host_pid),
        dns_policy: Some(dns_policy(instance).to_string()),
        node_selector: (!instance.spec.node_selector.is_empty()).then(|| instance.spec.node_selector.clone()),
        tolerations: Some(build_tolerations(instance)),
        priority_class_name: instance.spec.priority_class_name.clone(),
        service_account_name: Some(
            instance
                .spec
                .service_account_name
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string()),
        ),
        volumes: Some(vec![Volume {
            name: HOST_ROOT_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Hex SHA-256 of the JSON form of `data`
pub fn content_hash<T: Serialize>(data: &T) -> Result<String, ControllerError> {
    let json = serde_json::to_vec(data)?;
    let mut hasher = Sha256::new();
    hasher.update(&json);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImmutableFields<'a> {
    selector: &'a BTreeMap<String, String>,
    dns_policy: &'a str,
    host_network: bool,
    #[serde(rename = "hostPID")]
    host_pid: bool,
}

/// Build the DaemonSet running the agent for `instance`.
///
/// `tenant_uuid` comes from the tenant connection info.
pub fn build_daemonset(instance: &OneAgent, tenant_uuid: &str) -> Result<DaemonSet, ControllerError> {
    validate_spec(instance)?;

    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();
    let owner = instance
        .controller_owner_ref(&())
        .ok_or_else(|| ControllerError::Configuration(format!("OneAgent {}/{} has no uid", namespace, name)))?;

    let selector = selector_labels(&name);
    let labels = build_labels(instance);

    let spec = DaemonSetSpec {
        selector: LabelSelector {
            match_labels: Some(selector.clone()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels.clone()),
                ..Default::default()
            }),
            spec: Some(build_pod_spec(instance, tenant_uuid)),
        },
        ..Default::default()
    };

    let template_hash = content_hash(&spec)?;
    let immutable_hash = content_hash(&ImmutableFields {
        selector: &selector,
        dns_policy: dns_policy(instance),
        host_network: instance.spec.host_network,
        host_pid: instance.spec.host_pid,
    })?;
    debug!(%namespace, %name, %template_hash, "Built OneAgent DaemonSet");

    Ok(DaemonSet {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([
                (ANNOTATION_TEMPLATE_HASH.to_string(), template_hash),
                (ANNOTATION_IMMUTABLE_HASH.to_string(), immutable_hash),
            ])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    })
}

/// What to do to bring the live DaemonSet in line with the desired one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSetUpdate {
    Create,
    Replace,
    /// Immutable fields changed: delete, then create
    Recreate,
    Unchanged,
}

fn annotation<'a>(ds: &'a DaemonSet, key: &str) -> Option<&'a str> {
    ds.metadata.annotations.as_ref()?.get(key).map(String::as_str)
}

/// Pod template fields set by the builder, in a form unaffected by API server defaulting
#[derive(Debug, PartialEq)]
struct ManagedFields<'a> {
    image: Option<&'a str>,
    args: Option<&'a Vec<String>>,
    env: Vec<EnvVar>,
    volume_mounts: Option<&'a Vec<VolumeMount>>,
    security_context: Option<&'a SecurityContext>,
    volumes: Vec<(&'a str, Option<&'a str>)>,
    node_selector: Option<&'a BTreeMap<String, String>>,
    tolerations: Option<&'a Vec<Toleration>>,
    service_account_name: Option<&'a str>,
    priority_class_name: Option<&'a str>,
}

// Empty values are dropped on the wire and fieldRef.apiVersion is defaulted.
fn normalize_env(env: &EnvVar) -> EnvVar {
    let mut env = env.clone();
    env.value = env.value.filter(|v| !v.is_empty());
    if let Some(field_ref) = env.value_from.as_mut().and_then(|f| f.field_ref.as_mut()) {
        field_ref.api_version = None;
    }
    env
}

fn managed_fields(ds: &DaemonSet) -> Option<ManagedFields<'_>> {
    let pod = ds.spec.as_ref()?.template.spec.as_ref()?;
    let container = pod.containers.iter().find(|c| c.name == CONTAINER_NAME)?;

    Some(ManagedFields {
        image: container.image.as_deref(),
        args: container.args.as_ref().filter(|a| !a.is_empty()),
        env: container.env.iter().flatten().map(normalize_env).collect(),
        volume_mounts: container.volume_mounts.as_ref(),
        security_context: container.security_context.as_ref(),
        // hostPath.type is defaulted by the API server
        volumes: pod
            .volumes
            .iter()
            .flatten()
            .map(|v| (v.name.as_str(), v.host_path.as_ref().map(|h| h.path.as_str())))
            .collect(),
        node_selector: pod.node_selector.as_ref().filter(|n| !n.is_empty()),
        tolerations: pod.tolerations.as_ref(),
        service_account_name: pod.service_account_name.as_deref(),
        priority_class_name: pod.priority_class_name.as_deref(),
    })
}

/// Whether the live pod template was edited away from what the builder produces
pub fn template_drifted(desired: &DaemonSet, live: &DaemonSet) -> bool {
    managed_fields(desired) != managed_fields(live)
}

/// Compare desired and live DaemonSets through their hash annotations and the
/// builder-controlled fields of the live pod template
pub fn plan_update(desired: &DaemonSet, live: Option<&DaemonSet>) -> DaemonSetUpdate {
    let Some(live) = live else {
        return DaemonSetUpdate::Create;
    };

    if annotation(desired, ANNOTATION_IMMUTABLE_HASH) != annotation(live, ANNOTATION_IMMUTABLE_HASH) {
        DaemonSetUpdate::Recreate
    } else if annotation(desired, ANNOTATION_TEMPLATE_HASH) != annotation(live, ANNOTATION_TEMPLATE_HASH)
        || desired.metadata.labels != live.metadata.labels
        || template_drifted(desired, live)
    {
        DaemonSetUpdate::Replace
    } else {
        DaemonSetUpdate::Unchanged
    }
}
