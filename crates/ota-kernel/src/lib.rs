//! OTA Injection Kernel
//!
//! Drives candidate services from submission to `Active` (or a clean
//! `RolledBack`) against an [`ota_registry::ServiceRegistry`].
//!
//! # Core Concepts
//!
//! - [`JobState`]: the injection pipeline, checked by [`state_machine`]
//! - [`InjectionManager`]: submit, status, cancel, wait, revert
//! - [`AuditLog`]: hash-chained record of every transition, written before
//!   the transition takes effect
//! - [`collaborators`]: fetch, verify, generate, build and test seams
//!
//! # Example
//!
//! ```rust,no_run
//! use ota_kernel::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), ManagerError> {
//! let collaborators = Collaborators::new(
//!     Arc::new(DirectorySource::new("packages")),
//!     Arc::new(DigestVerifier),
//!     ToolchainRegistry::uniform(Arc::new(PassthroughToolchain)),
//! );
//! let manager = InjectionManager::open(ManagerConfig::default(), collaborators, ".ota")?;
//!
//! let request: InjectionRequest = serde_json::from_str(r#"{"name": "A", "language": "rust"}"#)
//!     .expect("valid json");
//! let job_id = manager.submit(request)?;
//! let view = manager.wait(job_id).await?;
//! assert_eq!(view.state, JobState::Active);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod audit;
pub mod collaborators;
pub mod config;
pub mod error;
mod job;
pub mod manager;
pub mod state_machine;
pub mod types;

pub use audit::{AuditEntry, AuditLog, AuditRecord, AuditStore, JsonlAuditStore, MemoryAuditStore};
pub use collaborators::Collaborators;
pub use config::{ManagerConfig, OtaConfig, StageTimeouts};
pub use error::{ErrorClass, ErrorKind, FailureReason, ManagerError};
pub use manager::InjectionManager;
pub use types::{JobId, JobState, JobView};

/// Prelude for common imports
pub mod prelude {
    pub use crate::collaborators::{
        Collaborators, DigestVerifier, DirectorySource, PassthroughToolchain, ToolchainRegistry,
    };
    pub use crate::{
        AuditLog, ErrorKind, FailureReason, InjectionManager, JobId, JobState, JobView, ManagerConfig, ManagerError,
    };
    pub use ota_registry::{InjectionRequest, ServiceDescriptor};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
