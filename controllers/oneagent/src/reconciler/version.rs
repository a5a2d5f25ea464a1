//! Fleet-wide agent version resolution.

use dynatrace_client::{DynatraceClientTrait, DynatraceError, INSTALLER_TYPE_DEFAULT, OS_UNIX};
use tracing::{debug, info};

use super::Reconciliation;
use crate::error::ControllerError;

/// Decide the agent version the DaemonSet rolls out.
///
/// An empty `status.version` is always resolved and adopted (bootstrap). Otherwise the
/// latest version is only looked up when agent updates are enabled, and adopted when
/// it differs from the current one.
pub async fn reconcile_version(
    client: &dyn DynatraceClientTrait,
    rec: &mut Reconciliation,
) -> Result<(), ControllerError> {
    let current = rec.status().version.clone();

    if current.is_empty() {
        let latest = latest_version(client).await?;
        info!(namespace = %rec.namespace(), name = %rec.name(), version = %latest, "Adopting initial agent version");
        rec.status_mut().version = latest;
        rec.version_bootstrapped = true;
        return Ok(());
    }

    if rec.instance.spec.disable_agent_update {
        debug!(namespace = %rec.namespace(), name = %rec.name(), "Agent updates disabled, keeping version {}", current);
        return Ok(());
    }

    let latest = latest_version(client).await?;
    if latest != current {
        info!(
            namespace = %rec.namespace(),
            name = %rec.name(),
            from = %current,
            to = %latest,
            "New agent version available"
        );
        rec.status_mut().version = latest;
    }
    Ok(())
}

async fn latest_version(client: &dyn DynatraceClientTrait) -> Result<String, ControllerError> {
    let latest = client.get_latest_agent_version(OS_UNIX, INSTALLER_TYPE_DEFAULT).await?;
    if latest.is_empty() {
        return Err(ControllerError::Upstream(DynatraceError::Api(
            "latest agent version is empty".to_string(),
        )));
    }
    Ok(latest)
}
