//! Service descriptors
//!
//! A [`ServiceDescriptor`] is the immutable description of one service
//! version. A new version is a new descriptor; nothing mutates one in
//! place. Descriptors enter the system through [`InjectionRequest`], the
//! wire form accepted by the injection manager, and are validated on the
//! way in.

use crate::error::DescriptorError;
use crate::version::VersionConstraint;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Version assumed when a request omits one
pub const DEFAULT_VERSION: &str = "1.0.0";

/// Implementation language of a service
///
/// Informational to the registry; the kernel uses it to pick a toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// C
    C,
    /// C++
    Cpp,
    /// Rust
    Rust,
    /// Java
    Java,
    /// Python
    Python,
}

impl Language {
    /// All supported languages
    pub const ALL: [Language; 5] = [
        Language::C,
        Language::Cpp,
        Language::Rust,
        Language::Java,
        Language::Python,
    ];

    /// Lowercase tag as it appears on the wire
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
            Language::Java => "java",
            Language::Python => "python",
        }
    }
}

impl Display for Language {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" => Ok(Language::C),
            "cpp" | "c++" => Ok(Language::Cpp),
            "rust" => Ok(Language::Rust),
            "java" => Ok(Language::Java),
            "python" => Ok(Language::Python),
            _ => Err(DescriptorError::UnsupportedLanguage(s.to_string())),
        }
    }
}

/// 32-byte blake3 digest of a descriptor's canonical form
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Raw digest bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 16 hex chars
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContentDigest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// A declared dependency on another service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    /// Name of the required service
    pub name: String,
    /// Acceptable versions of it
    pub constraint: VersionConstraint,
}

/// Immutable description of one service version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "InjectionRequest", into = "InjectionRequest")]
pub struct ServiceDescriptor {
    name: String,
    language: Language,
    version: Version,
    interfaces: BTreeSet<String>,
    dependencies: Vec<Dependency>,
    digest: ContentDigest,
}

impl ServiceDescriptor {
    /// Start building a descriptor
    #[must_use]
    pub fn builder(name: impl Into<String>, language: Language, version: Version) -> DescriptorBuilder {
        DescriptorBuilder {
            name: name.into(),
            language,
            version,
            interfaces: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// Unique name within the application
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Implementation language
    #[inline]
    #[must_use]
    pub fn language(&self) -> Language {
        self.language
    }

    /// Service version
    #[inline]
    #[must_use]
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Exposed operation names
    #[inline]
    #[must_use]
    pub fn interfaces(&self) -> &BTreeSet<String> {
        &self.interfaces
    }

    /// Declared dependencies, in declaration order
    #[inline]
    #[must_use]
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Content digest over every field
    #[inline]
    #[must_use]
    pub fn digest(&self) -> ContentDigest {
        self.digest
    }

    /// `name@version`
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// True if both describe the same version with the same content
    #[inline]
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Display for ServiceDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.version, self.language)
    }
}

/// Builder for [`ServiceDescriptor`]
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    name: String,
    language: Language,
    version: Version,
    interfaces: Vec<String>,
    dependencies: Vec<(String, String)>,
}

impl DescriptorBuilder {
    /// Add an exposed operation
    #[must_use]
    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.interfaces.push(name.into());
        self
    }

    /// Add a dependency with a textual constraint
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.dependencies.push((name.into(), constraint.into()));
        self
    }

    /// Validate and freeze the descriptor
    ///
    /// # Errors
    /// Returns [`DescriptorError`] for a malformed name, version,
    /// interface, or dependency.
    pub fn build(self) -> Result<ServiceDescriptor, DescriptorError> {
        validate_name(&self.name)?;
        if !self.version.pre.is_empty() || !self.version.build.is_empty() {
            return Err(DescriptorError::InvalidVersion {
                input: self.version.to_string(),
                reason: "pre-release and build metadata are not supported".to_string(),
            });
        }

        let mut interfaces = BTreeSet::new();
        for interface in self.interfaces {
            let interface = interface.trim().to_string();
            if interface.is_empty() {
                return Err(DescriptorError::EmptyInterface);
            }
            interfaces.insert(interface);
        }

        let mut seen = HashSet::new();
        let mut dependencies = Vec::with_capacity(self.dependencies.len());
        for (name, constraint) in self.dependencies {
            validate_name(&name)?;
            if !seen.insert(name.clone()) {
                return Err(DescriptorError::DuplicateDependency(name));
            }
            let constraint = constraint
                .parse()
                .map_err(|source| DescriptorError::InvalidConstraint {
                    dependency: name.clone(),
                    source,
                })?;
            dependencies.push(Dependency { name, constraint });
        }

        let digest = compute_digest(&self.name, self.language, &self.version, &interfaces, &dependencies);

        Ok(ServiceDescriptor {
            name: self.name,
            language: self.language,
            version: self.version,
            interfaces,
            dependencies,
            digest,
        })
    }
}

fn validate_name(name: &str) -> Result<(), DescriptorError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DescriptorError::InvalidName(name.to_string()))
    }
}

fn compute_digest(
    name: &str,
    language: Language,
    version: &Version,
    interfaces: &BTreeSet<String>,
    dependencies: &[Dependency],
) -> ContentDigest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(&[0]);
    hasher.update(language.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(version.to_string().as_bytes());
    hasher.update(&[0]);
    for interface in interfaces {
        hasher.update(b"i:");
        hasher.update(interface.as_bytes());
        hasher.update(&[0]);
    }
    for dep in dependencies {
        hasher.update(b"d:");
        hasher.update(dep.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(dep.constraint.to_string().as_bytes());
        hasher.update(&[0]);
    }
    ContentDigest(*hasher.finalize().as_bytes())
}

/// Wire form of an injection request
///
/// ```json
/// { "name": "A", "language": "rust", "version": "1.0.0",
///   "interfaces": ["read"], "dependencies": [{"name": "B", "versionConstraint": ">=1.0.0"}] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionRequest {
    /// Unique per application
    pub name: String,
    /// Informational language tag
    pub language: String,
    /// `MAJOR.MINOR.PATCH`, defaults to [`DEFAULT_VERSION`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Exposed operation names
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Declared dependencies
    #[serde(default)]
    pub dependencies: Vec<DependencyRequest>,
}

/// Wire form of a dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRequest {
    /// Required service
    pub name: String,
    /// Constraint text
    pub version_constraint: String,
}

impl TryFrom<InjectionRequest> for ServiceDescriptor {
    type Error = DescriptorError;

    fn try_from(request: InjectionRequest) -> Result<Self, Self::Error> {
        let language: Language = request.language.parse()?;
        let raw_version = request.version.as_deref().unwrap_or(DEFAULT_VERSION);
        let version = Version::parse(raw_version.trim()).map_err(|e| DescriptorError::InvalidVersion {
            input: raw_version.to_string(),
            reason: e.to_string(),
        })?;

        let builder = request
            .interfaces
            .into_iter()
            .fold(ServiceDescriptor::builder(request.name, language, version), |b, i| b.interface(i));

        request
            .dependencies
            .into_iter()
            .fold(builder, |b, dep| b.depends_on(dep.name, dep.version_constraint))
            .build()
    }
}

impl From<ServiceDescriptor> for InjectionRequest {
    fn from(descriptor: ServiceDescriptor) -> Self {
        Self {
            name: descriptor.name,
            language: descriptor.language.as_str().to_string(),
            version: Some(descriptor.version.to_string()),
            interfaces: descriptor.interfaces.into_iter().collect(),
            dependencies: descriptor
                .dependencies
                .into_iter()
                .map(|d| DependencyRequest {
                    name: d.name,
                    version_constraint: d.constraint.to_string(),
                })
                .collect(),
        }
    }
}
