//! OneAgent CRD
//!
//! Declares the desired rollout of the Dynatrace OneAgent as a per-node
//! workload and carries the operator-observed state in its status.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, Toleration};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

/// Default OneAgent container image
pub const DEFAULT_ONEAGENT_IMAGE: &str = "docker.io/dynatrace/oneagent:latest";

/// Default service account the OneAgent pods run as
pub const DEFAULT_SERVICE_ACCOUNT: &str = "dynatrace-oneagent";

/// Default DNS policy for host-networked agent pods
pub const DEFAULT_DNS_POLICY: &str = "ClusterFirstWithHostNet";

/// DNS policies accepted by the pod spec
pub const DNS_POLICIES: [&str; 4] = ["ClusterFirst", "ClusterFirstWithHostNet", "Default", "None"];

/// Secret key holding the PaaS (installer download) token
pub const PAAS_TOKEN_KEY: &str = "paasToken";

/// Secret key holding the API (data export) token
pub const API_TOKEN_KEY: &str = "apiToken";

/// Secret annotation allowing the operator to write rotated tokens back
pub const ANNOTATION_ACCEPT_TOKEN_ROTATION: &str = "oneagent.dynatrace.com/accept-token-rotation";

fn default_true() -> bool {
    true
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "dynatrace.com",
    version = "v1alpha1",
    kind = "OneAgent",
    namespaced,
    status = "OneAgentStatus",
    shortname = "oa",
    printcolumn = r#"{"name":"ApiUrl","type":"string","jsonPath":".spec.apiUrl"}"#,
    printcolumn = r#"{"name":"Tokens","type":"string","jsonPath":".status.tokens"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentSpec {
    /// Dynatrace management API base URL, e.g. `https://ENVIRONMENTID.live.dynatrace.com/api`
    pub api_url: String,

    /// Disable TLS certificate validation towards the management API
    #[serde(default)]
    pub skip_cert_check: bool,

    /// Name of the secret holding the `apiToken` and `paasToken` fields.
    /// Defaults to the name of this resource when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tokens: String,

    /// Keep the currently deployed agent version instead of following new releases
    #[serde(default)]
    pub disable_agent_update: bool,

    /// DNS policy of the agent pods (defaults to `ClusterFirstWithHostNet`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,

    /// Extra labels applied to the DaemonSet and its pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Run the agent pods in the host network namespace
    #[serde(default = "default_true")]
    pub host_network: bool,

    /// Run the agent pods in the host PID namespace
    #[serde(default = "default_true", rename = "hostPID")]
    pub host_pid: bool,

    /// Installation directory of the agent on the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,

    /// Proxy used by the installer to reach the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Restrict the nodes the agent is scheduled on
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations for the agent pods. When empty, every taint is tolerated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Agent container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Extra installer arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment variables for the agent container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Compute resources of the agent container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Priority class of the agent pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Service account of the agent pods (defaults to `dynatrace-oneagent`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Coarse lifecycle phase of a OneAgent rollout.
///
/// An absent phase is the steady state. `Running` is part of the schema for
/// consumers but is never written by the operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum OneAgentPhase {
    /// A new agent version is being rolled out
    Deploying,

    /// The rollout is complete
    Running,

    /// The last reconciliation failed
    Error,
}

/// Observed agent on a single node
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentInstance {
    /// Pod running the agent on this node
    #[serde(default)]
    pub pod_name: String,

    /// Host IP address reported by the pod
    #[serde(default)]
    pub ip_address: String,

    /// Agent version installed on the host, empty if not yet reported
    #[serde(default)]
    pub version: String,

    /// When this record last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentStatus {
    /// Current rollout phase, absent in the steady state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<OneAgentPhase>,

    /// Agent version currently targeted across the fleet
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Name of the token secret in effect
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tokens: String,

    /// Per-node agent records keyed by node name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instances: BTreeMap<String, OneAgentInstance>,

    /// Token health conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl OneAgent {
    /// Name of the secret holding the tokens: `spec.tokens`, or the resource name when unset.
    pub fn tokens_name(&self) -> String {
        if self.spec.tokens.is_empty() {
            self.name_any()
        } else {
            self.spec.tokens.clone()
        }
    }
}
