//! Test utilities for unit testing the reconciler
//!
//! Helpers for building test objects, an in-memory `ClusterClient` and a
//! client factory handing out a shared `MockDynatraceClient`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crds::{API_TOKEN_KEY, OneAgent, OneAgentSpec, PAAS_TOKEN_KEY};
use dynatrace_client::{DynatraceClientTrait, MockDynatraceClient, TOKEN_SCOPE_DATA_EXPORT, TOKEN_SCOPE_INSTALLER_DOWNLOAD};
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::error::ErrorResponse;
use kube::{Resource, ResourceExt};
use serde_json::{Map, Value, json};

use crate::client_factory::{DynatraceClientFactory, Tokens};
use crate::cluster::ClusterClient;
use crate::daemonset::selector_labels;
use crate::error::ControllerError;
use crate::reconciler::{Reconciler, ReconcilerOptions};

pub const TEST_API_URL: &str = "https://ENVIRONMENTID.live.dynatrace.com/api";
pub const TEST_PAAS_TOKEN: &str = "42";
pub const TEST_API_TOKEN: &str = "84";

/// Helper to create a test OneAgent with spec defaults applied
pub fn create_test_oneagent(name: &str, namespace: &str) -> OneAgent {
    let spec: OneAgentSpec = serde_json::from_value(json!({ "apiUrl": TEST_API_URL })).unwrap();
    OneAgent {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Helper to create a token secret
pub fn create_test_secret(name: &str, namespace: &str, paas_token: &str, api_token: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (PAAS_TOKEN_KEY.to_string(), ByteString(paas_token.as_bytes().to_vec())),
            (API_TOKEN_KEY.to_string(), ByteString(api_token.as_bytes().to_vec())),
        ])),
        ..Default::default()
    }
}

/// Helper to create an agent pod of `oneagent`
pub fn create_test_pod(
    name: &str,
    namespace: &str,
    oneagent: &str,
    node_name: Option<&str>,
    host_ip: Option<&str>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(selector_labels(oneagent)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node_name.map(str::to_string),
            ..Default::default()
        }),
        status: Some(PodStatus {
            host_ip: host_ip.map(str::to_string),
            ..Default::default()
        }),
    }
}

/// Mock client granting the test tokens their required scopes
pub fn create_valid_mock_client() -> MockDynatraceClient {
    let client = MockDynatraceClient::new();
    client.set_latest_version("42");
    client.set_tenant_uuid("abc123456");
    client.set_token_scopes(TEST_PAAS_TOKEN, &[TOKEN_SCOPE_INSTALLER_DOWNLOAD]);
    client.set_token_scopes(TEST_API_TOKEN, &[TOKEN_SCOPE_DATA_EXPORT]);
    client
}

/// Factory returning the same mock client on every build
pub struct StaticClientFactory {
    client: MockDynatraceClient,
    built_with: Mutex<Vec<Tokens>>,
}

impl StaticClientFactory {
    pub fn new(client: MockDynatraceClient) -> Self {
        Self {
            client,
            built_with: Mutex::new(Vec::new()),
        }
    }

    /// Tokens passed to each `build` call, in order
    pub fn built_with(&self) -> Vec<Tokens> {
        self.built_with.lock().unwrap().clone()
    }
}

impl DynatraceClientFactory for StaticClientFactory {
    fn build(&self, _instance: &OneAgent, tokens: &Tokens) -> Result<Arc<dyn DynatraceClientTrait>, ControllerError> {
        self.built_with.lock().unwrap().push(tokens.clone());
        Ok(Arc::new(self.client.clone()))
    }
}

/// Reconciler over a fake cluster and a mock client
pub fn create_test_reconciler(
    cluster: Arc<FakeCluster>,
    client: MockDynatraceClient,
) -> (Reconciler, Arc<StaticClientFactory>) {
    let factory = Arc::new(StaticClientFactory::new(client));
    let reconciler = Reconciler::new(cluster, factory.clone(), ReconcilerOptions::default());
    (reconciler, factory)
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

fn not_found(kind: &str, namespace: &str, name: &str) -> kube::Error {
    api_error(404, "NotFound", format!("{} {}/{} not found", kind, namespace, name))
}

fn conflict(message: String) -> kube::Error {
    api_error(409, "Conflict", message)
}

/// Apply an RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                merge_patch(target_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

#[derive(Default)]
struct FakeState {
    oneagents: BTreeMap<Key, OneAgent>,
    secrets: BTreeMap<Key, Secret>,
    daemonsets: BTreeMap<Key, DaemonSet>,
    pods: BTreeMap<Key, Pod>,
    resource_version: u64,
    writes: Vec<String>,
    status_conflicts: usize,
}

impl FakeState {
    fn stamp(&mut self, meta: &mut ObjectMeta) {
        self.resource_version += 1;
        meta.resource_version = Some(self.resource_version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
    }
}

/// In-memory cluster with resourceVersion-based optimistic concurrency.
///
/// Every successful write is recorded so tests can assert that a pass was a no-op.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_oneagent(&self, mut oneagent: OneAgent) {
        let mut state = self.state();
        state.stamp(&mut oneagent.metadata);
        let k = key(&oneagent.namespace().unwrap_or_default(), &oneagent.name_any());
        state.oneagents.insert(k, oneagent);
    }

    /// Change a stored OneAgent the way a user edit would
    pub fn update_oneagent(&self, namespace: &str, name: &str, f: impl FnOnce(&mut OneAgent)) {
        let mut state = self.state();
        let mut oneagent = state.oneagents.get(&key(namespace, name)).cloned().unwrap();
        f(&mut oneagent);
        state.stamp(&mut oneagent.metadata);
        state.oneagents.insert(key(namespace, name), oneagent);
    }

    pub fn delete_oneagent(&self, namespace: &str, name: &str) {
        self.state().oneagents.remove(&key(namespace, name));
    }

    pub fn add_secret(&self, mut secret: Secret) {
        let mut state = self.state();
        state.stamp(&mut secret.metadata);
        let k = key(&secret.namespace().unwrap_or_default(), &secret.name_any());
        state.secrets.insert(k, secret);
    }

    pub fn add_daemonset(&self, mut daemonset: DaemonSet) {
        let mut state = self.state();
        state.stamp(&mut daemonset.metadata);
        let k = key(&daemonset.namespace().unwrap_or_default(), &daemonset.name_any());
        state.daemonsets.insert(k, daemonset);
    }

    pub fn add_pod(&self, pod: Pod) {
        let k = key(&pod.namespace().unwrap_or_default(), &pod.name_any());
        self.state().pods.insert(k, pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.state().pods.remove(&key(namespace, name));
    }

    pub fn oneagent(&self, namespace: &str, name: &str) -> Option<OneAgent> {
        self.state().oneagents.get(&key(namespace, name)).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn daemonset(&self, namespace: &str, name: &str) -> Option<DaemonSet> {
        self.state().daemonsets.get(&key(namespace, name)).cloned()
    }

    /// Successful writes, as `"<operation> <namespace>/<name>"`
    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// Reject the next `n` status patches with 409
    pub fn inject_status_conflicts(&self, n: usize) {
        self.state().status_conflicts = n;
    }
}

fn check_resource_version<K: Resource>(desired: &K, live: &K) -> Result<(), kube::Error> {
    match desired.meta().resource_version.as_deref() {
        Some(rv) if Some(rv) != live.meta().resource_version.as_deref() => Err(conflict(format!(
            "resourceVersion {} is stale",
            rv
        ))),
        _ => Ok(()),
    }
}

fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let labels = pod.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

#[async_trait::async_trait]
impl ClusterClient for FakeCluster {
    async fn get_oneagent(&self, namespace: &str, name: &str) -> Result<Option<OneAgent>, kube::Error> {
        Ok(self.oneagent(namespace, name))
    }

    async fn patch_oneagent_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<OneAgent, kube::Error> {
        let mut state = self.state();
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            return Err(conflict("injected conflict".to_string()));
        }

        let current = state
            .oneagents
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("OneAgent", namespace, name))?;
        if let Some(rv) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            if Some(rv) != current.metadata.resource_version.as_deref() {
                return Err(conflict(format!("resourceVersion {} is stale", rv)));
            }
        }

        let mut value = serde_json::to_value(&current).map_err(kube::Error::SerdeError)?;
        if let Some(status) = patch.get("status") {
            merge_patch(&mut value["status"], status);
        }
        let mut updated: OneAgent = serde_json::from_value(value).map_err(kube::Error::SerdeError)?;
        state.stamp(&mut updated.metadata);
        state.oneagents.insert(key(namespace, name), updated.clone());
        state.writes.push(format!("patch_status {}/{}", namespace, name));
        Ok(updated)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        Ok(self.secret(namespace, name))
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        let mut state = self.state();
        let name = secret.name_any();
        let live = state
            .secrets
            .get(&key(namespace, &name))
            .ok_or_else(|| not_found("Secret", namespace, &name))?;
        check_resource_version(secret, live)?;

        let mut stored = secret.clone();
        stored.metadata.uid = live.metadata.uid.clone();
        state.stamp(&mut stored.metadata);
        state.secrets.insert(key(namespace, &name), stored.clone());
        state.writes.push(format!("replace_secret {}/{}", namespace, name));
        Ok(stored)
    }

    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>, kube::Error> {
        Ok(self.daemonset(namespace, name))
    }

    async fn create_daemonset(&self, namespace: &str, daemonset: &DaemonSet) -> Result<DaemonSet, kube::Error> {
        let mut state = self.state();
        let name = daemonset.name_any();
        if state.daemonsets.contains_key(&key(namespace, &name)) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("DaemonSet {}/{} already exists", namespace, name),
            ));
        }

        let mut stored = daemonset.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        state.stamp(&mut stored.metadata);
        state.daemonsets.insert(key(namespace, &name), stored.clone());
        state.writes.push(format!("create_daemonset {}/{}", namespace, name));
        Ok(stored)
    }

    async fn replace_daemonset(&self, namespace: &str, daemonset: &DaemonSet) -> Result<DaemonSet, kube::Error> {
        let mut state = self.state();
        let name = daemonset.name_any();
        let live = state
            .daemonsets
            .get(&key(namespace, &name))
            .ok_or_else(|| not_found("DaemonSet", namespace, &name))?;
        check_resource_version(daemonset, live)?;

        let mut stored = daemonset.clone();
        stored.metadata.uid = live.metadata.uid.clone();
        state.stamp(&mut stored.metadata);
        state.daemonsets.insert(key(namespace, &name), stored.clone());
        state.writes.push(format!("replace_daemonset {}/{}", namespace, name));
        Ok(stored)
    }

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let mut state = self.state();
        if state.daemonsets.remove(&key(namespace, name)).is_some() {
            state.writes.push(format!("delete_daemonset {}/{}", namespace, name));
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && matches_selector(pod, label_selector))
            .map(|(_, pod)| pod.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_patch_rfc7386() {
        let mut target = json!({"a": "b", "c": {"d": "e", "f": "g"}, "l": [1, 2]});
        merge_patch(&mut target, &json!({"a": "z", "c": {"f": null}, "l": [3]}));
        assert_eq!(target, json!({"a": "z", "c": {"d": "e"}, "l": [3]}));
    }

    #[test]
    fn test_selector_matching() {
        let pod = create_test_pod("p", "dynatrace", "oneagent", None, None);
        assert!(matches_selector(&pod, "dynatrace=oneagent,oneagent=oneagent"));
        assert!(!matches_selector(&pod, "dynatrace=oneagent,oneagent=other"));
    }

    #[tokio::test]
    async fn test_stale_status_patch_conflicts() {
        let cluster = FakeCluster::new();
        cluster.add_oneagent(create_test_oneagent("oneagent", "dynatrace"));
        let rv = cluster.oneagent("dynatrace", "oneagent").unwrap().metadata.resource_version.unwrap();

        let patch = json!({"metadata": {"resourceVersion": rv}, "status": {"tokens": "oneagent"}});
        cluster.patch_oneagent_status("dynatrace", "oneagent", &patch).await.unwrap();

        let err = cluster
            .patch_oneagent_status("dynatrace", "oneagent", &patch)
            .await
            .unwrap_err();
        assert!(crate::error::is_conflict(&err));
        assert_eq!(cluster.writes().len(), 1);
    }
}
