//! OneAgent CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the OneAgent operator.

pub mod conditions;
pub mod oneagent;

pub use conditions::*;
pub use oneagent::*;
