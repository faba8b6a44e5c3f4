//! The authoritative map of active services
//!
//! # Concurrency
//!
//! - Readers load the current [`Snapshot`] through an `ArcSwap` and never
//!   block, even while a commit is in progress.
//! - Every mutation goes through [`ServiceRegistry::commit`], which holds a
//!   short critical section, checks the transaction's base version, builds
//!   the successor state and publishes it with a single pointer swap.
//! - The version counter advances by exactly one per commit; a snapshot
//!   tagged `v` is the state after the `v`-th commit.

use crate::descriptor::ServiceDescriptor;
use crate::error::RegistryError;
use crate::graph::DependencyGraph;
use crate::store::RegistryStore;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

/// Lifecycle status of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Currently serving
    Active,
    /// Superseded by a newer activation
    Retired,
}

/// A descriptor as installed in the registry
///
/// Only created by a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    descriptor: ServiceDescriptor,
    status: EntryStatus,
    activated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retired_at: Option<DateTime<Utc>>,
    /// Registry version produced by the commit that installed this entry
    commit_version: u64,
}

impl RegistryEntry {
    /// The installed descriptor
    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Service name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Service version
    #[inline]
    #[must_use]
    pub fn version(&self) -> &Version {
        self.descriptor.version()
    }

    /// Active or Retired
    #[inline]
    #[must_use]
    pub fn status(&self) -> EntryStatus {
        self.status
    }

    /// When the commit installed this entry
    #[inline]
    #[must_use]
    pub fn activated_at(&self) -> DateTime<Utc> {
        self.activated_at
    }

    /// When a newer version replaced it
    #[inline]
    #[must_use]
    pub fn retired_at(&self) -> Option<DateTime<Utc>> {
        self.retired_at
    }

    /// Registry version of the installing commit
    #[inline]
    #[must_use]
    pub fn commit_version(&self) -> u64 {
        self.commit_version
    }

    /// Wire summary used by list/query responses
    #[must_use]
    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            name: self.name().to_string(),
            version: self.version().to_string(),
            status: self.status,
            activated_at: self.activated_at,
        }
    }

    fn retire(mut self, at: DateTime<Utc>) -> Self {
        self.status = EntryStatus::Retired;
        self.retired_at = Some(at);
        self
    }
}

/// `{ name, version, status, activatedAt }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    pub name: String,
    pub version: String,
    pub status: EntryStatus,
    pub activated_at: DateTime<Utc>,
}

/// Complete registry contents at one version
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryState {
    version: u64,
    active: BTreeMap<String, RegistryEntry>,
    history: Vec<RegistryEntry>,
}

impl RegistryState {
    /// Version counter this state was published at
    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Active entry for `name`
    #[inline]
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.active.get(name)
    }

    /// Whether `name` has an Active entry
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.active.contains_key(name)
    }

    /// Active entries ordered by name
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.active.values()
    }

    /// Retired entries for `name`, oldest first
    pub fn history(&self, name: &str) -> impl Iterator<Item = &RegistryEntry> + '_ {
        let name = name.to_string();
        self.history.iter().filter(move |e| e.name() == name)
    }

    /// Active services exposing `interface`, ordered by name
    pub fn providers_of<'s>(&'s self, interface: &'s str) -> impl Iterator<Item = &'s RegistryEntry> + 's {
        self.active
            .values()
            .filter(move |e| e.descriptor.interfaces().contains(interface))
    }

    /// All retired entries, oldest first
    #[inline]
    #[must_use]
    pub fn retired(&self) -> &[RegistryEntry] {
        &self.history
    }

    /// Number of Active services
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// No Active services
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Structural check used when loading persisted state
    pub(crate) fn check_consistency(&self) -> Result<(), RegistryError> {
        for (name, entry) in &self.active {
            if entry.name() != name || entry.status != EntryStatus::Active {
                return Err(RegistryError::InvariantViolation(format!(
                    "active slot {name} holds {} in status {:?}",
                    entry.descriptor.id(),
                    entry.status
                )));
            }
            if entry.commit_version > self.version {
                return Err(RegistryError::InvariantViolation(format!(
                    "{} committed at v{} beyond registry v{}",
                    entry.descriptor.id(),
                    entry.commit_version,
                    self.version
                )));
            }
        }
        if let Some(entry) = self.history.iter().find(|e| e.status != EntryStatus::Retired) {
            return Err(RegistryError::InvariantViolation(format!(
                "history holds non-retired {}",
                entry.descriptor.id()
            )));
        }
        Ok(())
    }

    fn successor(&self, descriptor: ServiceDescriptor, now: DateTime<Utc>) -> (Self, RegistryEntry) {
        let mut next = self.clone();
        next.version = self.version + 1;

        if let Some(prior) = next.active.remove(descriptor.name()) {
            next.history.push(prior.retire(now));
        }

        let entry = RegistryEntry {
            descriptor,
            status: EntryStatus::Active,
            activated_at: now,
            retired_at: None,
            commit_version: next.version,
        };
        next.active.insert(entry.name().to_string(), entry.clone());
        (next, entry)
    }
}

/// Immutable, version-tagged view of the registry
///
/// Cheap to clone; holds the state it was taken from alive.
#[derive(Debug, Clone, Default)]
pub struct Snapshot(Arc<RegistryState>);

impl Snapshot {
    /// Wrap an explicit state (tests, offline tooling)
    #[must_use]
    pub fn from_state(state: RegistryState) -> Self {
        Self(Arc::new(state))
    }

    /// Whether two snapshots share the same published state
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for Snapshot {
    type Target = RegistryState;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Handle for an open optimistic transaction
///
/// Dropping it is equivalent to [`ServiceRegistry::rollback`].
#[derive(Debug)]
#[must_use = "a transaction must be committed or rolled back"]
pub struct TxnHandle {
    base_version: u64,
}

impl TxnHandle {
    /// Registry version the transaction was opened against
    #[inline]
    #[must_use]
    pub fn base_version(&self) -> u64 {
        self.base_version
    }
}

/// Versioned service registry with atomic commit
pub struct ServiceRegistry {
    state: ArcSwap<RegistryState>,
    /// Serializes commits; holds the last version published through them
    commit_lock: Mutex<u64>,
    store: Option<RegistryStore>,
}

impl ServiceRegistry {
    /// Create an empty, in-memory registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(RegistryState::default()),
            commit_lock: Mutex::new(0),
            store: None,
        }
    }

    /// Open a registry backed by `store`, loading any persisted state
    ///
    /// # Errors
    /// Returns [`RegistryError::Storage`] if the file exists but cannot be
    /// read, or [`RegistryError::InvariantViolation`] if its contents are
    /// inconsistent.
    pub fn open(store: RegistryStore) -> Result<Self, RegistryError> {
        let state = store.load()?.unwrap_or_default();
        state.check_consistency()?;
        tracing::info!(
            path = %store.path().display(),
            version = state.version(),
            services = state.len(),
            "registry loaded"
        );
        Ok(Self {
            commit_lock: Mutex::new(state.version()),
            state: ArcSwap::from_pointee(state),
            store: Some(store),
        })
    }

    /// Point-in-time view; never observes a partial commit
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.state.load_full())
    }

    /// Current version counter
    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.load().version
    }

    /// Open a transaction based on `snapshot`
    ///
    /// # Errors
    /// [`RegistryError::StaleSnapshot`] if the registry has advanced past it.
    pub fn begin_transaction(&self, snapshot: &Snapshot) -> Result<TxnHandle, RegistryError> {
        let found = self.version();
        if found != snapshot.version() {
            return Err(RegistryError::StaleSnapshot {
                expected: snapshot.version(),
                found,
            });
        }
        Ok(TxnHandle {
            base_version: snapshot.version(),
        })
    }

    /// Install `descriptor` as the Active entry for its name
    ///
    /// Retires the prior Active entry (if any) into history and advances
    /// the version counter, all in one publication.
    ///
    /// # Errors
    /// - [`RegistryError::StaleSnapshot`] if another commit interleaved
    /// - [`RegistryError::Storage`] if persisting the new state failed
    ///   (the registry is left unchanged)
    /// - [`RegistryError::InvariantViolation`] if the published state
    ///   changed underneath the critical section, or the version counter
    ///   would not move past the last published commit
    pub fn commit(&self, txn: TxnHandle, descriptor: ServiceDescriptor) -> Result<RegistryEntry, RegistryError> {
        let mut published = self.commit_lock.lock();

        let current = self.state.load_full();
        if current.version != txn.base_version {
            return Err(RegistryError::StaleSnapshot {
                expected: txn.base_version,
                found: current.version,
            });
        }

        let (next, entry) = current.successor(descriptor, Utc::now());
        if next.version <= *published {
            return Err(RegistryError::InvariantViolation(format!(
                "commit would publish v{} after v{} was already published",
                next.version, *published
            )));
        }

        if let Some(store) = &self.store {
            store.persist(&next)?;
        }

        let next_version = next.version;
        let previous = self.state.compare_and_swap(&current, Arc::new(next));
        if !Arc::ptr_eq(&previous, &current) {
            return Err(RegistryError::InvariantViolation(format!(
                "registry moved from v{} to v{} outside the commit path",
                current.version, previous.version
            )));
        }
        *published = next_version;

        tracing::info!(
            service = entry.name(),
            version = %entry.version(),
            registry_version = next_version,
            "registry commit"
        );
        Ok(entry)
    }

    /// Discard a transaction; the registry is unchanged
    pub fn rollback(&self, txn: TxnHandle) {
        tracing::debug!(base_version = txn.base_version, "transaction rolled back");
    }

    /// Active entry for `name`
    ///
    /// # Errors
    /// [`RegistryError::NotFound`] if no version of `name` is Active.
    pub fn query(&self, name: &str) -> Result<RegistryEntry, RegistryError> {
        self.state
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// All Active entries ordered by name
    #[must_use]
    pub fn list(&self) -> Vec<RegistryEntry> {
        self.state.load().entries().cloned().collect()
    }

    /// Retired entries of `name`, oldest first
    #[must_use]
    pub fn history(&self, name: &str) -> Vec<RegistryEntry> {
        self.state.load().history(name).cloned().collect()
    }

    /// Active services and the names each one depends on
    #[must_use]
    pub fn dependency_graph(&self) -> BTreeMap<String, Vec<String>> {
        self.state
            .load()
            .entries()
            .map(|e| {
                let deps = e.descriptor.dependencies().iter().map(|d| d.name.clone()).collect();
                (e.name().to_string(), deps)
            })
            .collect()
    }

    /// Active services, dependencies before dependents
    ///
    /// # Errors
    /// [`RegistryError::InvariantViolation`] if the Active graph has a cycle.
    pub fn activation_order(&self) -> Result<Vec<String>, RegistryError> {
        let state = self.state.load_full();
        let graph = DependencyGraph::from_state(&state);
        let order = graph.activation_order().ok_or_else(|| {
            RegistryError::InvariantViolation(format!(
                "active dependency graph is cyclic: {}",
                graph.find_cycle().unwrap_or_default().join(" -> ")
            ))
        })?;
        // declared-but-absent dependencies are graph nodes too
        Ok(order
            .into_iter()
            .filter(|name| state.contains(name))
            .map(str::to_string)
            .collect())
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("version", &self.version())
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}
