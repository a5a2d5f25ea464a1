//! Status write.
//!
//! The whole status goes out in a single JSON merge patch. The patch carries
//! the resourceVersion the pass started from, so a concurrent writer turns it
//! into a 409 instead of a lost update. Fields that were cleared are sent as
//! explicit `null`s because a merge patch leaves absent keys untouched.

use crds::OneAgentStatus;
use serde_json::{Map, Value, json};

use crate::error::ControllerError;

/// Merge patch turning `previous` into `next`
pub fn status_patch(
    previous: &OneAgentStatus,
    next: &OneAgentStatus,
    resource_version: Option<&str>,
) -> Result<Value, ControllerError> {
    let mut instances = Map::new();
    for node in previous.instances.keys() {
        if !next.instances.contains_key(node) {
            instances.insert(node.clone(), Value::Null);
        }
    }
    for (node, instance) in &next.instances {
        instances.insert(node.clone(), serde_json::to_value(instance)?);
    }

    let status = json!({
        "phase": next.phase,
        "version": next.version,
        "tokens": next.tokens,
        "instances": instances,
        "conditions": next.conditions,
    });

    let mut patch = json!({ "status": status });
    if let Some(rv) = resource_version {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    Ok(patch)
}
