//! Job state machine
//!
//! The transition table every [`JobState`] change is checked against.
//! `Active` and `RolledBack` are terminal; every non-terminal state other
//! than `Failed` may fail.

use crate::error::StateMachineError;
use crate::types::JobState;

/// Validates a job state transition.
///
/// Besides the linear pipeline, two edges support the bounded commit retry:
/// `Committing -> ResolvingDependencies` on a stale snapshot, and
/// `ResolvingDependencies -> Committing` once re-validation passes (the
/// generate/build/test stages are not repeated).
pub fn validate_transition(from: JobState, to: JobState) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step
pub fn allowed_transitions(from: JobState) -> Vec<JobState> {
    use JobState::*;
    match from {
        Pending => vec![Validating, Failed],
        Validating => vec![Downloading, Failed],
        Downloading => vec![VerifyingSignature, Failed],
        VerifyingSignature => vec![ResolvingDependencies, Failed],
        ResolvingDependencies => vec![Generating, Committing, Failed],
        Generating => vec![Building, Failed],
        Building => vec![Testing, Failed],
        Testing => vec![Committing, Failed],
        Committing => vec![Active, ResolvingDependencies, Failed],
        Failed => vec![RolledBack],
        Active => vec![],
        RolledBack => vec![],
    }
}

fn allowed(from: JobState, to: JobState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
