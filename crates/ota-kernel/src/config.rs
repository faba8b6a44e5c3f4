//! Manager and process configuration
//!
//! [`ManagerConfig`] tunes the injection pipeline. [`OtaConfig`] is the
//! TOML file read by the `ota-kernel` binary:
//!
//! ```toml
//! state_dir = "/var/lib/ota"
//!
//! [manager]
//! max_concurrent_jobs = 4
//! compatibility = "same_major_minimum"
//!
//! [manager.timeouts]
//! build_ms = 600000
//!
//! [source]
//! root = "/srv/ota/packages"
//!
//! [verifier]
//! trusted_key = "3b6a27bc..."
//!
//! [toolchains.rust]
//! build = ["cargo", "build", "--release"]
//! test = ["cargo", "test"]
//! ```

use crate::collaborators::CommandToolchain;
use crate::error::ConfigError;
use crate::types::JobState;
use ota_registry::{CompatibilityPolicy, Language};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-stage time limits in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub validate_ms: u64,
    pub fetch_ms: u64,
    pub verify_ms: u64,
    pub resolve_ms: u64,
    pub generate_ms: u64,
    pub build_ms: u64,
    pub test_ms: u64,
    pub commit_ms: u64,
}

impl StageTimeouts {
    /// Same limit for every stage
    #[must_use]
    pub fn uniform(ms: u64) -> Self {
        Self {
            validate_ms: ms,
            fetch_ms: ms,
            verify_ms: ms,
            resolve_ms: ms,
            generate_ms: ms,
            build_ms: ms,
            test_ms: ms,
            commit_ms: ms,
        }
    }

    /// Limit for the stage entered at `state`
    #[must_use]
    pub fn for_stage(&self, state: JobState) -> Duration {
        let ms = match state {
            JobState::Validating => self.validate_ms,
            JobState::Downloading => self.fetch_ms,
            JobState::VerifyingSignature => self.verify_ms,
            JobState::ResolvingDependencies => self.resolve_ms,
            JobState::Generating => self.generate_ms,
            JobState::Building => self.build_ms,
            JobState::Testing => self.test_ms,
            _ => self.commit_ms,
        };
        Duration::from_millis(ms)
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            validate_ms: 5_000,
            fetch_ms: 60_000,
            verify_ms: 10_000,
            resolve_ms: 5_000,
            generate_ms: 300_000,
            build_ms: 600_000,
            test_ms: 600_000,
            commit_ms: 5_000,
        }
    }
}

/// Injection manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Jobs allowed past `Pending` at once
    pub max_concurrent_jobs: usize,
    /// Extra download attempts after a transient fetch failure
    pub fetch_retries: u32,
    /// Delay before the first fetch retry; doubles per attempt
    pub fetch_backoff_ms: u64,
    /// Re-validations allowed after a stale commit
    pub commit_retries: u32,
    /// How open-ended version constraints are matched
    pub compatibility: CompatibilityPolicy,
    /// Per-stage time limits
    pub timeouts: StageTimeouts,
}

impl ManagerConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With max concurrent jobs
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// With fetch retry policy
    #[inline]
    #[must_use]
    pub fn with_fetch_retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.fetch_retries = retries;
        self.fetch_backoff_ms = backoff_ms;
        self
    }

    /// With commit retry budget
    #[inline]
    #[must_use]
    pub fn with_commit_retries(mut self, retries: u32) -> Self {
        self.commit_retries = retries;
        self
    }

    /// With compatibility policy
    #[inline]
    #[must_use]
    pub fn with_compatibility(mut self, policy: CompatibilityPolicy) -> Self {
        self.compatibility = policy;
        self
    }

    /// With stage timeouts
    #[inline]
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Reject values the manager cannot run with
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid("max_concurrent_jobs must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            fetch_retries: 2,
            fetch_backoff_ms: 100,
            commit_retries: 1,
            compatibility: CompatibilityPolicy::default(),
            timeouts: StageTimeouts::default(),
        }
    }
}

/// `[source]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory holding `<name>-<version>.pkg` files
    pub root: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("packages"),
        }
    }
}

/// `[verifier]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Hex ed25519 public key; unset means integrity-only checks
    pub trusted_key: Option<String>,
}

/// Process configuration for the `ota-kernel` binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Where `registry.json` and `audit.jsonl` live
    pub state_dir: PathBuf,
    pub manager: ManagerConfig,
    pub source: SourceConfig,
    pub verifier: VerifierConfig,
    /// Toolchain commands keyed by language tag
    pub toolchains: BTreeMap<String, CommandToolchain>,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".ota"),
            manager: ManagerConfig::default(),
            source: SourceConfig::default(),
            verifier: VerifierConfig::default(),
            toolchains: BTreeMap::new(),
        }
    }
}

impl OtaConfig {
    /// Load and validate a TOML file
    ///
    /// # Errors
    /// I/O, parse, or validation failure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// Parse or validation failure.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// [`ConfigError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.manager.validate()?;
        for tag in self.toolchains.keys() {
            tag.parse::<Language>()
                .map_err(|_| ConfigError::Invalid(format!("toolchain for unsupported language {tag:?}")))?;
        }
        if let Some(key) = &self.verifier.trusted_key {
            let valid = key.trim().len() == 64 && key.trim().chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(ConfigError::InvalidKey("expected 64 hex characters".into()));
            }
        }
        Ok(())
    }

    /// Configured toolchains keyed by parsed language
    #[must_use]
    pub fn toolchains_by_language(&self) -> Vec<(Language, CommandToolchain)> {
        self.toolchains
            .iter()
            .filter_map(|(tag, tc)| tag.parse().ok().map(|lang| (lang, tc.clone())))
            .collect()
    }
}
