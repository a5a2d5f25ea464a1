//! Main controller implementation.
//!
//! Wires the Kubernetes client, the Dynatrace client factory and the
//! reconciler together and runs the OneAgent watcher in a background task.

use std::sync::Arc;

use kube::Client;
use tokio::task::JoinHandle;
use tracing::info;

use crate::client_factory::HttpDynatraceClientFactory;
use crate::cluster::KubeClusterClient;
use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crate::reconciler::{Reconciler, ReconcilerOptions};
use crate::watcher::{Context, watch_oneagents};

/// Main controller for OneAgent rollouts.
pub struct Controller {
    oneagent_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts watching.
    pub async fn new(config: OperatorConfig) -> Result<Self, ControllerError> {
        info!("Initializing OneAgent Controller");

        let kube_client = Client::try_default().await?;

        let cluster = Arc::new(KubeClusterClient::new(kube_client.clone()));
        let client_factory = Arc::new(HttpDynatraceClientFactory::default());
        let reconciler = Arc::new(Reconciler::new(
            cluster,
            client_factory,
            ReconcilerOptions::from(&config),
        ));
        let context = Arc::new(Context::new(reconciler, &config));

        let namespace = config.namespace.clone();
        let concurrency = config.max_concurrent_reconciles;
        let oneagent_watcher =
            tokio::spawn(async move { watch_oneagents(kube_client, namespace, concurrency, context).await });

        Ok(Self { oneagent_watcher })
    }

    /// Runs the controller until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("OneAgent Controller running");

        self.oneagent_watcher
            .await
            .map_err(|e| ControllerError::Watch(format!("OneAgent watcher panicked: {}", e)))?
    }
}
