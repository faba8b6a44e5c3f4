//! Error types for the injection kernel
//!
//! Job failures are data: a failed job carries a [`FailureReason`] rather
//! than propagating an error. The `Result`-returning types below cover the
//! manager API, the audit store, and the collaborator seams.

use crate::types::{JobId, JobState};
use ota_registry::{DescriptorError, RegistryError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Failure tag carried by a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DependencyMissing,
    VersionIncompatible,
    CyclicDependency,
    DuplicateVersion,
    FetchError,
    IntegrityError,
    GenerationError,
    BuildError,
    TestFailure,
    ConcurrentModification,
    AuditUnavailable,
    RegistryUnavailable,
    Timeout,
    Cancelled,
    Interrupted,
    ManagerHalted,
}

/// Coarse grouping of failure kinds, used for process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Fixable only by changing the descriptor
    Validation,
    /// The service's own source failed to generate, build or test
    BuildTest,
    /// Environment, transport, or operator action
    Infrastructure,
}

impl ErrorKind {
    const ALL: [ErrorKind; 16] = [
        ErrorKind::DependencyMissing,
        ErrorKind::VersionIncompatible,
        ErrorKind::CyclicDependency,
        ErrorKind::DuplicateVersion,
        ErrorKind::FetchError,
        ErrorKind::IntegrityError,
        ErrorKind::GenerationError,
        ErrorKind::BuildError,
        ErrorKind::TestFailure,
        ErrorKind::ConcurrentModification,
        ErrorKind::AuditUnavailable,
        ErrorKind::RegistryUnavailable,
        ErrorKind::Timeout,
        ErrorKind::Cancelled,
        ErrorKind::Interrupted,
        ErrorKind::ManagerHalted,
    ];

    /// Tag as it appears on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DependencyMissing => "DependencyMissing",
            ErrorKind::VersionIncompatible => "VersionIncompatible",
            ErrorKind::CyclicDependency => "CyclicDependency",
            ErrorKind::DuplicateVersion => "DuplicateVersion",
            ErrorKind::FetchError => "FetchError",
            ErrorKind::IntegrityError => "IntegrityError",
            ErrorKind::GenerationError => "GenerationError",
            ErrorKind::BuildError => "BuildError",
            ErrorKind::TestFailure => "TestFailure",
            ErrorKind::ConcurrentModification => "ConcurrentModification",
            ErrorKind::AuditUnavailable => "AuditUnavailable",
            ErrorKind::RegistryUnavailable => "RegistryUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Interrupted => "Interrupted",
            ErrorKind::ManagerHalted => "ManagerHalted",
        }
    }

    /// Exit-code class
    #[must_use]
    pub const fn class(self) -> ErrorClass {
        match self {
            ErrorKind::DependencyMissing
            | ErrorKind::VersionIncompatible
            | ErrorKind::CyclicDependency
            | ErrorKind::DuplicateVersion => ErrorClass::Validation,
            ErrorKind::GenerationError | ErrorKind::BuildError | ErrorKind::TestFailure => ErrorClass::BuildTest,
            ErrorKind::FetchError
            | ErrorKind::IntegrityError
            | ErrorKind::ConcurrentModification
            | ErrorKind::AuditUnavailable
            | ErrorKind::RegistryUnavailable
            | ErrorKind::Timeout
            | ErrorKind::Cancelled
            | ErrorKind::Interrupted
            | ErrorKind::ManagerHalted => ErrorClass::Infrastructure,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown error kind: {s}"))
    }
}

/// Why a job failed: error-kind tag plus a human-readable message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureReason {
    /// Create a failure reason
    #[inline]
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Stage expiry, tagged with the stage that ran out of time
    #[must_use]
    pub fn timeout(stage: JobState, after: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Timeout({stage}) after {}ms", after.as_millis()),
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, message) = s.split_once(": ").unwrap_or((s, ""));
        Ok(Self::new(kind.parse()?, message))
    }
}

impl From<&ValidationError> for FailureReason {
    fn from(err: &ValidationError) -> Self {
        let kind = match err {
            ValidationError::DependencyMissing(_) => ErrorKind::DependencyMissing,
            ValidationError::VersionIncompatible { .. } => ErrorKind::VersionIncompatible,
            ValidationError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            ValidationError::DuplicateVersion { .. } => ErrorKind::DuplicateVersion,
        };
        Self::new(kind, err.to_string())
    }
}

/// Job pipeline transition errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// The target state is not reachable from the current one
    #[error("illegal state transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },
}

/// Package fetch failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The source has no package for this service version
    #[error("package not found: {0}")]
    NotFound(String),

    /// The source could not be reached or read
    #[error("package source unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    /// Transient failures are retried with backoff
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Signature or integrity check failure; never retried
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("integrity check failed: {0}")]
pub struct IntegrityError(pub String);

/// Failure reported by a generate/build/test collaborator
///
/// `diagnostic` is attached to the job verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{diagnostic}")]
pub struct CollaboratorFailure {
    pub diagnostic: String,
}

impl CollaboratorFailure {
    /// Wrap a diagnostic payload
    #[inline]
    #[must_use]
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostic: diagnostic.into(),
        }
    }
}

/// Audit store failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// The store refused or failed the write
    #[error("audit store unavailable: {0}")]
    Unavailable(String),

    /// A record's hash or chain link does not match
    #[error("audit chain broken at record {seq}")]
    IntegrityViolation { seq: u64 },

    /// A stored record could not be decoded
    #[error("corrupt audit record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Configuration loading failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The trusted verifying key is malformed
    #[error("invalid trusted key: {0}")]
    InvalidKey(String),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Injection manager API errors
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The request could not be turned into a descriptor
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),

    /// No job with this ID in memory or in the audit trail
    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    /// The job is committing or already finished
    #[error("job {job_id} cannot be cancelled in state {state}")]
    CancelRejected { job_id: JobId, state: JobState },

    /// `revert` found no retired version to go back to
    #[error("no previous version of {0} to revert to")]
    NoPreviousVersion(String),

    /// An invariant violation stopped the manager
    #[error("manager halted: {0}")]
    Halted(String),

    /// Registry could not be opened or read
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Audit log could not be opened or appended to
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// Configuration problem
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ManagerError {
    /// The manager refuses all further work
    #[inline]
    #[must_use]
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Halted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    #[test]
    fn failure_reason_display_parses_back() {
        let reason = FailureReason::new(ErrorKind::BuildError, "error[E0308]: mismatched types");
        let text = reason.to_string();
        assert_eq!(text, "BuildError: error[E0308]: mismatched types");
        assert_eq!(text.parse::<FailureReason>().unwrap(), reason);
    }

    #[test]
    fn validation_errors_map_to_their_tag() {
        let err = ValidationError::VersionIncompatible {
            name: "A".into(),
            required: ">=2.0.0".into(),
            found: Version::new(1, 0, 0),
        };
        let reason = FailureReason::from(&err);
        assert_eq!(reason.kind, ErrorKind::VersionIncompatible);
        assert_eq!(reason.kind.as_str(), err.tag());
        assert_eq!(reason.kind.class(), ErrorClass::Validation);
    }

    #[test]
    fn classes_partition_kinds() {
        assert_eq!(ErrorKind::TestFailure.class(), ErrorClass::BuildTest);
        assert_eq!(ErrorKind::IntegrityError.class(), ErrorClass::Infrastructure);
        assert_eq!(ErrorKind::Timeout.class(), ErrorClass::Infrastructure);
        for kind in ErrorKind::ALL {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn only_unavailable_fetches_retry() {
        assert!(FetchError::Unavailable("timeout".into()).is_retryable());
        assert!(!FetchError::NotFound("A-1.0.0.pkg".into()).is_retryable());
    }

    #[test]
    fn timeout_reason_names_the_stage() {
        let reason = FailureReason::timeout(JobState::Building, std::time::Duration::from_millis(50));
        assert_eq!(reason.kind, ErrorKind::Timeout);
        assert!(reason.message.starts_with("Timeout(Building)"));
    }
}
