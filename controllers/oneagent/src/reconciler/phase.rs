//! Phase state machine.
//!
//! The only place that decides `status.phase`. `Running` is part of the schema
//! but never asserted: an absent phase is the steady state.

use crds::OneAgentPhase;

/// Outcome of one reconcile pass relevant to the phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepResults {
    /// A step returned an error
    pub failed: bool,
    /// The fleet-wide version was adopted for the first time
    pub version_bootstrapped: bool,
}

/// Phase after a pass, given the phase before it
pub fn next_phase(current: Option<OneAgentPhase>, results: &StepResults) -> Option<OneAgentPhase> {
    if results.failed {
        Some(OneAgentPhase::Error)
    } else if results.version_bootstrapped {
        Some(OneAgentPhase::Deploying)
    } else if current == Some(OneAgentPhase::Error) {
        None
    } else {
        current
    }
}
