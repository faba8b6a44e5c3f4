use super::{PackageSource, ServicePackage};
use crate::error::FetchError;
use ota_registry::ServiceDescriptor;
use semver::Version;
use std::io;
use std::path::{Path, PathBuf};

/// `<name>-<version>.pkg`
#[must_use]
pub fn package_file_name(name: &str, version: &Version) -> String {
    format!("{name}-{version}.pkg")
}

/// Reads packages from a local directory
///
/// A package is `<root>/<name>-<version>.pkg`; an optional detached
/// signature sits next to it as `<file>.sig`, hex encoded.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Source rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Package directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_signature(path: &Path) -> Result<Option<Vec<u8>>, FetchError> {
        match tokio::fs::read_to_string(path).await {
            // undecodable text is passed through for the verifier to reject
            Ok(text) => Ok(Some(hex::decode(text.trim()).unwrap_or_else(|_| text.into_bytes()))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FetchError::Unavailable(format!("{}: {e}", path.display()))),
        }
    }
}

#[async_trait::async_trait]
impl PackageSource for DirectorySource {
    async fn fetch(&self, descriptor: &ServiceDescriptor) -> Result<ServicePackage, FetchError> {
        let path = self
            .root
            .join(package_file_name(descriptor.name(), descriptor.version()));

        let payload = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                FetchError::NotFound(path.display().to_string())
            } else {
                FetchError::Unavailable(format!("{}: {e}", path.display()))
            }
        })?;

        let mut sig_path = path.clone().into_os_string();
        sig_path.push(".sig");
        let signature = Self::read_signature(Path::new(&sig_path)).await?;

        tracing::debug!(
            service = descriptor.name(),
            path = %path.display(),
            bytes = payload.len(),
            signed = signature.is_some(),
            "package fetched"
        );

        Ok(ServicePackage {
            name: descriptor.name().to_string(),
            version: descriptor.version().clone(),
            payload,
            signature,
            location: Some(path),
        })
    }
}
