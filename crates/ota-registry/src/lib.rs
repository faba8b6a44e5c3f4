//! OTA Service Registry
//!
//! Versioned map of active services with optimistic, atomically published
//! commits and a dependency-aware resolver.
//!
//! # Core Concepts
//!
//! - [`ServiceDescriptor`]: immutable description of one service version
//! - [`ServiceRegistry`]: the authoritative Active map, read through [`Snapshot`]s
//! - [`Resolver`]: validates a candidate against a snapshot (existence,
//!   version compatibility, acyclicity, collisions)
//! - [`DependencyGraph`]: graph view derived on demand from descriptors
//!
//! # Example
//!
//! ```rust
//! use ota_registry::prelude::*;
//! use semver::Version;
//!
//! let registry = ServiceRegistry::new();
//! let candidate = ServiceDescriptor::builder("auth", Language::Rust, Version::new(1, 0, 0))
//!     .interface("login")
//!     .build()
//!     .unwrap();
//!
//! let snapshot = registry.snapshot();
//! assert_eq!(
//!     Resolver::default().validate(&candidate, &snapshot),
//!     Ok(Resolution::Admissible)
//! );
//!
//! let txn = registry.begin_transaction(&snapshot).unwrap();
//! registry.commit(txn, candidate).unwrap();
//! assert_eq!(registry.version(), 1);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod descriptor;
pub mod error;
pub mod graph;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod store;
pub mod version;

pub use descriptor::{
    ContentDigest, Dependency, DependencyRequest, DescriptorBuilder, InjectionRequest, Language, ServiceDescriptor,
    DEFAULT_VERSION,
};
pub use error::{ConstraintError, DescriptorError, RegistryError, ValidationError};
pub use graph::DependencyGraph;
pub use registry::{EntryStatus, EntrySummary, RegistryEntry, RegistryState, ServiceRegistry, Snapshot, TxnHandle};
pub use resolver::{Resolution, Resolver};
pub use store::RegistryStore;
pub use version::{CompatibilityPolicy, VersionConstraint};

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        CompatibilityPolicy, DependencyGraph, EntryStatus, InjectionRequest, Language, RegistryEntry, RegistryError,
        Resolution, Resolver, ServiceDescriptor, ServiceRegistry, Snapshot, ValidationError, VersionConstraint,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
