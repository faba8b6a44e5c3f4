//! JSON persistence for registry state

use crate::error::RegistryError;
use crate::registry::RegistryState;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// File name used inside a state directory
pub const REGISTRY_FILE: &str = "registry.json";

/// Durable copy of the registry on disk
///
/// Writes go to a sibling temp file and are renamed into place, so a crash
/// leaves either the previous or the next state, never a torn one.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    /// Store at an explicit file path
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/registry.json`
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(REGISTRY_FILE))
    }

    /// Backing file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read persisted state, `None` if nothing has been written yet
    pub(crate) fn load(&self) -> Result<Option<RegistryState>, RegistryError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.storage_error("read", &e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| self.storage_error("parse", &e))
    }

    /// Durably replace the persisted state
    pub(crate) fn persist(&self, state: &RegistryState) -> Result<(), RegistryError> {
        let json = serde_json::to_vec_pretty(state).map_err(|e| self.storage_error("encode", &e))?;
        let tmp = self.path.with_extension("json.tmp");

        let write = || -> io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };

        write().map_err(|e| {
            tracing::error!(path = %self.path.display(), error = %e, "registry persist failed");
            self.storage_error("write", &e)
        })
    }

    fn storage_error(&self, op: &str, err: &dyn std::fmt::Display) -> RegistryError {
        RegistryError::Storage(format!("{op} {}: {err}", self.path.display()))
    }
}
