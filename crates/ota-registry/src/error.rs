//! Error types for the registry layer
//!
//! - Descriptor admission failures (malformed injection requests)
//! - Resolver validation failures (the user-visible validation taxonomy)
//! - Registry transaction and storage failures

use semver::Version;

/// Rejection of a malformed service definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// Name is empty or contains characters outside `[A-Za-z0-9_.-]`
    #[error("invalid service name: {0:?}")]
    InvalidName(String),

    /// Language tag is not one of the supported toolchains
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Version is not a plain `MAJOR.MINOR.PATCH`
    #[error("invalid version {input:?}: {reason}")]
    InvalidVersion { input: String, reason: String },

    /// Dependency constraint could not be parsed
    #[error("dependency {dependency}: {source}")]
    InvalidConstraint {
        dependency: String,
        #[source]
        source: ConstraintError,
    },

    /// Interface names must be non-empty
    #[error("empty interface name")]
    EmptyInterface,

    /// The same dependency was declared twice
    #[error("duplicate dependency: {0}")]
    DuplicateDependency(String),
}

/// Unparsable version constraint
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version constraint {input:?}: {reason}")]
pub struct ConstraintError {
    /// Raw constraint text
    pub input: String,
    /// Parser diagnostic
    pub reason: String,
}

/// Resolver verdicts that block an injection
///
/// Non-retryable without changing the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A declared dependency has no Active entry
    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    /// A dependency is Active but at a version outside the constraint
    #[error("version incompatible: {name} requires {required}, found {found}")]
    VersionIncompatible {
        name: String,
        required: String,
        found: Version,
    },

    /// Inserting the candidate would close a dependency cycle
    #[error("cyclic dependency: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    /// Same name and version already Active with different content
    #[error("duplicate version: {name}@{version} is already active with different content")]
    DuplicateVersion { name: String, version: Version },
}

impl ValidationError {
    /// Stable tag used in job status and audit details
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::DependencyMissing(_) => "DependencyMissing",
            Self::VersionIncompatible { .. } => "VersionIncompatible",
            Self::CyclicDependency { .. } => "CyclicDependency",
            Self::DuplicateVersion { .. } => "DuplicateVersion",
        }
    }
}

/// Registry transaction and storage failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The registry advanced past the snapshot a transaction was based on
    #[error("stale snapshot: based on v{expected}, registry at v{found}")]
    StaleSnapshot { expected: u64, found: u64 },

    /// No Active entry for the requested name
    #[error("service not found: {0}")]
    NotFound(String),

    /// Persisted state could not be read or written
    #[error("registry storage unavailable: {0}")]
    Storage(String),

    /// Commit path observed a state that serialized commits cannot produce
    #[error("registry invariant violated: {0}")]
    InvariantViolation(String),
}

impl RegistryError {
    /// Optimistic-concurrency conflict, resolved by re-validating
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleSnapshot { .. })
    }

    /// Unrecoverable: the manager must halt for inspection
    #[inline]
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}
