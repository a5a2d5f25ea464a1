//! Prints the OneAgent CustomResourceDefinition as YAML.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > deploy/crds/oneagent.yaml
//! ```

use crds::OneAgent;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&OneAgent::crd())?);
    Ok(())
}
