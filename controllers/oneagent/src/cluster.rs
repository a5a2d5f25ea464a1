//! Kubernetes API access used by the reconciler.
//!
//! `ClusterClient` is the seam between the reconciliation engine and the
//! cluster: production code talks to the API server through `KubeClusterClient`,
//! tests use an in-memory fake.

use crds::OneAgent;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

use crate::error::is_not_found;

/// Cluster operations needed by one reconcile pass.
///
/// `get_*` return `Ok(None)` when the object does not exist.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_oneagent(&self, namespace: &str, name: &str) -> Result<Option<OneAgent>, kube::Error>;

    /// Apply a JSON merge patch to the status subresource
    async fn patch_oneagent_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<OneAgent, kube::Error>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error>;

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error>;

    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>, kube::Error>;

    async fn create_daemonset(&self, namespace: &str, daemonset: &DaemonSet) -> Result<DaemonSet, kube::Error>;

    async fn replace_daemonset(&self, namespace: &str, daemonset: &DaemonSet) -> Result<DaemonSet, kube::Error>;

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Pods in `namespace` matching a `key=value,...` label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, kube::Error>;
}

/// `ClusterClient` backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, kube::Error>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

fn object_name<K: kube::Resource>(obj: &K) -> Result<&str, kube::Error> {
    obj.meta()
        .name
        .as_deref()
        .ok_or_else(|| kube::Error::Service("object has no metadata.name".into()))
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_oneagent(&self, namespace: &str, name: &str) -> Result<Option<OneAgent>, kube::Error> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn patch_oneagent_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<OneAgent, kube::Error> {
        debug!(namespace, name, "Patching OneAgent status");
        let api: Api<OneAgent> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch)).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.replace(object_name(secret)?, &PostParams::default(), secret).await
    }

    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>, kube::Error> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn create_daemonset(&self, namespace: &str, daemonset: &DaemonSet) -> Result<DaemonSet, kube::Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), daemonset).await
    }

    async fn replace_daemonset(&self, namespace: &str, daemonset: &DaemonSet) -> Result<DaemonSet, kube::Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.replace(object_name(daemonset)?, &PostParams::default(), daemonset).await
    }

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(label_selector)).await?.items)
    }
}
