//! Testing utilities for the OTA workspace
//!
//! Descriptor fixtures, scripted collaborators and a failing audit store.

#![allow(missing_docs)]

use ota_kernel::audit::{AuditRecord, AuditStore, MemoryAuditStore};
use ota_kernel::collaborators::{
    Build, Collaborators, DigestVerifier, Generate, PackageSource, ServicePackage, Test, ToolchainRegistry,
};
use ota_kernel::error::{AuditError, CollaboratorFailure, FetchError};
use ota_kernel::{InjectionManager, ManagerConfig, StageTimeouts};
use ota_registry::{DependencyRequest, InjectionRequest, Language, ServiceDescriptor, ServiceRegistry};
use parking_lot::Mutex;
use semver::Version;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn descriptor(name: &str, version: &str) -> ServiceDescriptor {
    descriptor_with_deps(name, version, &[])
}

pub fn descriptor_with_deps(name: &str, version: &str, deps: &[(&str, &str)]) -> ServiceDescriptor {
    let mut builder = ServiceDescriptor::builder(name, Language::Rust, Version::parse(version).unwrap());
    for (dep, constraint) in deps {
        builder = builder.depends_on(*dep, *constraint);
    }
    builder.build().unwrap()
}

pub fn request(name: &str, version: &str, deps: &[(&str, &str)]) -> InjectionRequest {
    InjectionRequest {
        name: name.to_string(),
        language: "rust".to_string(),
        version: Some(version.to_string()),
        interfaces: Vec::new(),
        dependencies: deps
            .iter()
            .map(|(dep, constraint)| DependencyRequest {
                name: (*dep).to_string(),
                version_constraint: (*constraint).to_string(),
            })
            .collect(),
    }
}

/// In-memory registry with `descriptors` committed in order
pub fn seeded_registry(descriptors: &[ServiceDescriptor]) -> ServiceRegistry {
    let registry = ServiceRegistry::new();
    for descriptor in descriptors {
        let txn = registry.begin_transaction(&registry.snapshot()).unwrap();
        registry.commit(txn, descriptor.clone()).unwrap();
    }
    registry
}

pub fn package_for(descriptor: &ServiceDescriptor) -> ServicePackage {
    ServicePackage {
        name: descriptor.name().to_string(),
        version: descriptor.version().clone(),
        payload: descriptor.id().into_bytes(),
        signature: None,
        location: None,
    }
}

/// Package source serving a synthetic package for every descriptor,
/// after any scripted failures for that service name
#[derive(Debug, Default)]
pub struct ScriptedSource {
    failures: Mutex<HashMap<String, VecDeque<FetchError>>>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next fetches of `name` with `errors`, in order
    #[must_use]
    pub fn failing(self, name: &str, errors: impl IntoIterator<Item = FetchError>) -> Self {
        self.failures
            .lock()
            .entry(name.to_string())
            .or_default()
            .extend(errors);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PackageSource for ScriptedSource {
    async fn fetch(&self, descriptor: &ServiceDescriptor) -> Result<ServicePackage, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .failures
            .lock()
            .get_mut(descriptor.name())
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(err) => Err(err),
            None => Ok(package_for(descriptor)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Generate,
    Build,
    Test,
}

/// Rendezvous point that holds jobs at a stage until released
#[derive(Debug)]
pub struct Gate {
    arrived: Semaphore,
    open: Semaphore,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            arrived: Semaphore::new(0),
            open: Semaphore::new(0),
        })
    }

    /// Wait until `n` jobs are held at the gate
    pub async fn arrivals(&self, n: u32) {
        self.arrived.acquire_many(n).await.unwrap().forget();
    }

    /// Let `n` held jobs through
    pub fn release(&self, n: usize) {
        self.open.add_permits(n);
    }

    async fn pass(&self) {
        self.arrived.add_permits(1);
        self.open.acquire().await.unwrap().forget();
    }
}

/// Toolchain whose stages succeed unless scripted otherwise
#[derive(Debug, Default)]
pub struct ScriptedToolchain {
    failures: HashMap<(String, Stage), String>,
    panics: HashMap<(String, Stage), String>,
    delays: HashMap<Stage, Duration>,
    gates: HashMap<Stage, Arc<Gate>>,
    calls: Mutex<Vec<(Stage, String)>>,
}

impl ScriptedToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// `stage` fails for service `name` with `diagnostic`
    #[must_use]
    pub fn failing(mut self, name: &str, stage: Stage, diagnostic: &str) -> Self {
        self.failures.insert((name.to_string(), stage), diagnostic.to_string());
        self
    }

    /// `stage` panics for service `name` with `message`
    #[must_use]
    pub fn panicking(mut self, name: &str, stage: Stage, message: &str) -> Self {
        self.panics.insert((name.to_string(), stage), message.to_string());
        self
    }

    #[must_use]
    pub fn with_delay(mut self, stage: Stage, delay: Duration) -> Self {
        self.delays.insert(stage, delay);
        self
    }

    #[must_use]
    pub fn gated(mut self, stage: Stage, gate: Arc<Gate>) -> Self {
        self.gates.insert(stage, gate);
        self
    }

    /// Stages run so far, as `(stage, name@version)`
    pub fn calls(&self) -> Vec<(Stage, String)> {
        self.calls.lock().clone()
    }

    async fn run(&self, stage: Stage, descriptor: &ServiceDescriptor) -> Result<(), CollaboratorFailure> {
        self.calls.lock().push((stage, descriptor.id()));
        if let Some(gate) = self.gates.get(&stage) {
            gate.pass().await;
        }
        if let Some(delay) = self.delays.get(&stage) {
            tokio::time::sleep(*delay).await;
        }
        let key = (descriptor.name().to_string(), stage);
        if let Some(message) = self.panics.get(&key) {
            panic!("{message}");
        }
        match self.failures.get(&key) {
            Some(diagnostic) => Err(CollaboratorFailure::new(diagnostic.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Generate for ScriptedToolchain {
    async fn generate(&self, descriptor: &ServiceDescriptor, _: &ServicePackage) -> Result<(), CollaboratorFailure> {
        self.run(Stage::Generate, descriptor).await
    }
}

#[async_trait::async_trait]
impl Build for ScriptedToolchain {
    async fn build(&self, descriptor: &ServiceDescriptor, _: &ServicePackage) -> Result<(), CollaboratorFailure> {
        self.run(Stage::Build, descriptor).await
    }
}

#[async_trait::async_trait]
impl Test for ScriptedToolchain {
    async fn test(&self, descriptor: &ServiceDescriptor, _: &ServicePackage) -> Result<(), CollaboratorFailure> {
        self.run(Stage::Test, descriptor).await
    }
}

/// Audit store that stops accepting writes after `limit` appends
#[derive(Debug)]
pub struct FailingAuditStore {
    inner: MemoryAuditStore,
    remaining: AtomicUsize,
}

impl FailingAuditStore {
    pub fn after(limit: usize) -> Self {
        Self {
            inner: MemoryAuditStore::new(),
            remaining: AtomicUsize::new(limit),
        }
    }
}

impl AuditStore for FailingAuditStore {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let admitted = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !admitted {
            return Err(AuditError::Unavailable("disk full".into()));
        }
        self.inner.append(record)
    }

    fn load(&self) -> Result<Vec<AuditRecord>, AuditError> {
        self.inner.load()
    }
}

pub fn collaborators(source: Arc<ScriptedSource>, toolchain: Arc<ScriptedToolchain>) -> Collaborators {
    Collaborators::new(source, Arc::new(DigestVerifier), ToolchainRegistry::uniform(toolchain))
}

/// Short timeouts, no fetch backoff
pub fn fast_config() -> ManagerConfig {
    ManagerConfig::new()
        .with_fetch_retries(2, 1)
        .with_timeouts(StageTimeouts::uniform(5_000))
}

/// In-memory manager with default scripted collaborators
pub fn setup_manager() -> InjectionManager {
    InjectionManager::new(
        fast_config(),
        collaborators(Arc::new(ScriptedSource::new()), Arc::new(ScriptedToolchain::new())),
    )
    .unwrap()
}
