//! Core types for the injection kernel
//!
//! - Job identifiers
//! - Job pipeline states
//! - Job status views

use crate::error::FailureReason;
use ota_registry::EntrySummary;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique job identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Generate new job ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s.trim()).map(Self)
    }
}

/// Pipeline state of an injection job
///
/// ```text
/// Pending -> Validating -> Downloading -> VerifyingSignature -> ResolvingDependencies
///   -> Generating -> Building -> Testing -> Committing -> Active
/// any non-terminal -> Failed -> RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Validating,
    Downloading,
    VerifyingSignature,
    ResolvingDependencies,
    Generating,
    Building,
    Testing,
    Committing,
    Active,
    Failed,
    RolledBack,
}

impl JobState {
    /// Every state, in pipeline order
    pub const ALL: [JobState; 12] = [
        JobState::Pending,
        JobState::Validating,
        JobState::Downloading,
        JobState::VerifyingSignature,
        JobState::ResolvingDependencies,
        JobState::Generating,
        JobState::Building,
        JobState::Testing,
        JobState::Committing,
        JobState::Active,
        JobState::Failed,
        JobState::RolledBack,
    ];

    /// No further transitions
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, JobState::Active | JobState::RolledBack)
    }

    /// Cancellation is still honoured in this state
    #[inline]
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        !matches!(
            self,
            JobState::Committing | JobState::Active | JobState::Failed | JobState::RolledBack
        )
    }

    /// Name as it appears in status and audit output
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Validating => "Validating",
            JobState::Downloading => "Downloading",
            JobState::VerifyingSignature => "VerifyingSignature",
            JobState::ResolvingDependencies => "ResolvingDependencies",
            JobState::Generating => "Generating",
            JobState::Building => "Building",
            JobState::Testing => "Testing",
            JobState::Committing => "Committing",
            JobState::Active => "Active",
            JobState::Failed => "Failed",
            JobState::RolledBack => "RolledBack",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// Job status response
///
/// `detail` is only set once the job has failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    /// `name@version` of the candidate
    pub service: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_entry: Option<EntrySummary>,
}

impl JobView {
    pub(crate) fn pending(job_id: JobId, service: String) -> Self {
        Self {
            job_id,
            service,
            state: JobState::Pending,
            detail: None,
            registry_entry: None,
        }
    }

    /// Terminal `Active`
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_parses_its_display() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-ulid".parse::<JobId>().is_err());
    }

    #[test]
    fn state_names_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
            assert_eq!(serde_json::to_string(&state).unwrap(), format!("\"{state}\""));
        }
    }

    #[test]
    fn terminal_and_cancellable_states() {
        assert!(JobState::Active.is_terminal());
        assert!(JobState::RolledBack.is_terminal());
        assert!(!JobState::Failed.is_terminal());

        assert!(JobState::Testing.is_cancellable());
        assert!(!JobState::Committing.is_cancellable());
        assert!(!JobState::Failed.is_cancellable());
    }
}
