//! OneAgent Operator
//!
//! Rolls out the Dynatrace OneAgent to every node of a cluster. Each `OneAgent`
//! resource is reconciled into a DaemonSet running the agent installer, with the
//! agent version, token health and per-node agent records kept in its status.

mod backoff;
mod client_factory;
mod cluster;
mod config;
mod controller;
mod daemonset;
mod error;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::{LogFormat, OperatorConfig};
use crate::controller::Controller;
use crate::error::ControllerError;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // Install the ring crypto provider before any TLS client is built
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = OperatorConfig::from_env()?;
    init_logging(config.log_format);

    info!("Starting OneAgent Operator");
    debug!("Configuration: {:?}", config);
    info!(
        "  Namespace: {}",
        config.namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("  Requeue interval: {:?}", config.requeue_interval);
    info!("  Max concurrent reconciles: {}", config.max_concurrent_reconciles);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    info!("OneAgent Operator stopped");
    Ok(())
}

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .compact()
                .init();
        }
    }
}
