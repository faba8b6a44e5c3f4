//! External collaborators consumed by injection jobs
//!
//! The kernel never fetches, verifies, generates, builds or tests anything
//! itself. Each of those steps goes through a narrow trait so deployments
//! (and tests) can plug in their own implementations. Generation, build and
//! test are selected per [`Language`] through a [`ToolchainRegistry`]; the
//! job runner never branches on the language itself.

mod source;
mod toolchain;
mod verify;

pub use source::{package_file_name, DirectorySource};
pub use toolchain::{CommandToolchain, PassthroughToolchain, StageCommand};
pub use verify::{signing_message, DigestVerifier, Ed25519Verifier};

use crate::error::{CollaboratorFailure, FetchError, IntegrityError};
use ota_registry::{Language, ServiceDescriptor};
use semver::Version;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A fetched service artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePackage {
    pub name: String,
    pub version: Version,
    pub payload: Vec<u8>,
    /// Detached signature, if the source provides one
    pub signature: Option<Vec<u8>>,
    /// Where the payload lives on disk, if anywhere
    pub location: Option<PathBuf>,
}

/// Fetches the package for a descriptor
#[async_trait::async_trait]
pub trait PackageSource: Send + Sync {
    /// Fetch the package; [`FetchError::Unavailable`] is retried by the caller
    async fn fetch(&self, descriptor: &ServiceDescriptor) -> Result<ServicePackage, FetchError>;
}

/// Checks a fetched package's signature or integrity
#[async_trait::async_trait]
pub trait PackageVerifier: Send + Sync {
    /// Verify `package` against `descriptor`
    async fn verify(&self, descriptor: &ServiceDescriptor, package: &ServicePackage) -> Result<(), IntegrityError>;
}

/// Code generation capability
#[async_trait::async_trait]
pub trait Generate: Send + Sync {
    async fn generate(&self, descriptor: &ServiceDescriptor, package: &ServicePackage)
        -> Result<(), CollaboratorFailure>;
}

/// Build capability
#[async_trait::async_trait]
pub trait Build: Send + Sync {
    async fn build(&self, descriptor: &ServiceDescriptor, package: &ServicePackage) -> Result<(), CollaboratorFailure>;
}

/// Test capability
#[async_trait::async_trait]
pub trait Test: Send + Sync {
    async fn test(&self, descriptor: &ServiceDescriptor, package: &ServicePackage) -> Result<(), CollaboratorFailure>;
}

/// Everything a language needs to go from package to tested service
pub trait Toolchain: Generate + Build + Test {}

impl<T: Generate + Build + Test> Toolchain for T {}

/// Toolchains keyed by language tag
#[derive(Clone, Default)]
pub struct ToolchainRegistry {
    by_language: HashMap<Language, Arc<dyn Toolchain>>,
}

impl ToolchainRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The same toolchain for every supported language
    #[must_use]
    pub fn uniform(toolchain: Arc<dyn Toolchain>) -> Self {
        let by_language = Language::ALL
            .into_iter()
            .map(|lang| (lang, Arc::clone(&toolchain)))
            .collect();
        Self { by_language }
    }

    /// Register (or replace) the toolchain for `language`
    #[must_use]
    pub fn with(mut self, language: Language, toolchain: Arc<dyn Toolchain>) -> Self {
        self.by_language.insert(language, toolchain);
        self
    }

    /// Toolchain for `language`
    #[must_use]
    pub fn get(&self, language: Language) -> Option<Arc<dyn Toolchain>> {
        self.by_language.get(&language).cloned()
    }

    /// Languages with a toolchain
    #[must_use]
    pub fn languages(&self) -> Vec<Language> {
        let mut langs: Vec<_> = self.by_language.keys().copied().collect();
        langs.sort_unstable();
        langs
    }
}

impl std::fmt::Debug for ToolchainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolchainRegistry")
            .field("languages", &self.languages())
            .finish()
    }
}

/// The full set of collaborators a manager drives
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn PackageSource>,
    pub verifier: Arc<dyn PackageVerifier>,
    pub toolchains: ToolchainRegistry,
}

impl Collaborators {
    /// Bundle collaborators
    #[must_use]
    pub fn new(source: Arc<dyn PackageSource>, verifier: Arc<dyn PackageVerifier>, toolchains: ToolchainRegistry) -> Self {
        Self {
            source,
            verifier,
            toolchains,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("toolchains", &self.toolchains)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_registry_covers_every_language() {
        let registry = ToolchainRegistry::uniform(Arc::new(PassthroughToolchain));
        assert_eq!(registry.languages(), Language::ALL.to_vec());
    }

    #[test]
    fn lookup_is_by_language_tag() {
        let registry = ToolchainRegistry::new().with(Language::Rust, Arc::new(PassthroughToolchain));
        assert!(registry.get(Language::Rust).is_some());
        assert!(registry.get(Language::Java).is_none());
    }
}
