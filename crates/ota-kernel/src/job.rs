//! Injection job runner
//!
//! One [`InjectionJob`] drives one candidate descriptor through the
//! pipeline. Every transition is written to the audit log before it takes
//! effect, so a job whose record cannot be written never advances.
//!
//! # Invariants
//!
//! - The registry is only mutated by the single `commit` call made while in
//!   `Committing`; a job that fails anywhere leaves it untouched.
//! - Validation runs twice: once on admission and again in
//!   `ResolvingDependencies` against a fresh snapshot.
//! - A stale commit loops back to `ResolvingDependencies` at most
//!   `commit_retries` times; generate/build/test are not repeated.
//! - Cancellation is honoured up to, but not including, `Committing`.

use crate::audit::{AuditLog, RecordDraft, ServiceRef};
use crate::collaborators::{Collaborators, ServicePackage};
use crate::config::ManagerConfig;
use crate::error::{AuditError, ErrorKind, FailureReason, FetchError};
use crate::state_machine::validate_transition;
use crate::types::{JobId, JobState, JobView};
use futures::FutureExt;
use ota_registry::{RegistryEntry, RegistryError, Resolution, Resolver, ServiceDescriptor, ServiceRegistry, Snapshot};
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

/// Halt switch shared by all jobs
#[derive(Debug, Default)]
pub(crate) struct Supervisor {
    halted: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl Supervisor {
    /// Stop the manager; the first reason wins
    pub(crate) fn halt(&self, reason: &str) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            tracing::error!(reason, "invariant violated, halting injection manager");
            *slot = Some(reason.to_string());
        }
        self.halted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn halt_reason(&self) -> Option<String> {
        if self.halted.load(Ordering::SeqCst) {
            self.reason.lock().clone()
        } else {
            None
        }
    }
}

/// Shared, immutable wiring for every job of one manager
pub(crate) struct JobContext {
    pub(crate) registry: Arc<ServiceRegistry>,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) resolver: Resolver,
    pub(crate) collaborators: Collaborators,
    pub(crate) config: ManagerConfig,
    pub(crate) supervisor: Supervisor,
    pub(crate) permits: Arc<Semaphore>,
}

struct Control {
    state: JobState,
    cancel_requested: bool,
}

/// Control block shared between a running job and the manager
pub(crate) struct JobSlot {
    pub(crate) id: JobId,
    pub(crate) descriptor: Arc<ServiceDescriptor>,
    service: ServiceRef,
    control: Mutex<Control>,
    cancel: watch::Sender<bool>,
    view: watch::Sender<JobView>,
}

impl JobSlot {
    pub(crate) fn new(id: JobId, descriptor: ServiceDescriptor) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        let (view, _) = watch::channel(JobView::pending(id, descriptor.id()));
        Arc::new(Self {
            id,
            service: ServiceRef::from(&descriptor),
            descriptor: Arc::new(descriptor),
            control: Mutex::new(Control {
                state: JobState::Pending,
                cancel_requested: false,
            }),
            cancel,
            view,
        })
    }

    pub(crate) fn view(&self) -> JobView {
        self.view.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<JobView> {
        self.view.subscribe()
    }

    /// Flag the job for cancellation, or report the state that forbids it
    pub(crate) fn request_cancel(&self) -> Result<(), JobState> {
        let mut control = self.control.lock();
        if !control.state.is_cancellable() {
            return Err(control.state);
        }
        control.cancel_requested = true;
        self.cancel.send_replace(true);
        Ok(())
    }
}

enum Completion {
    Committed(RegistryEntry),
    AlreadyActive(RegistryEntry),
}

/// How a job ended
pub(crate) struct Settled {
    pub(crate) view: JobView,
    /// The closing record reached the audit trail
    pub(crate) recorded: bool,
}

/// One injection attempt
pub(crate) struct InjectionJob {
    slot: Arc<JobSlot>,
    ctx: Arc<JobContext>,
    state: JobState,
    /// Registry version the job was admitted against
    registry_snapshot_id: Option<u64>,
    cancelled: watch::Receiver<bool>,
    recorded: bool,
}

impl InjectionJob {
    pub(crate) fn new(slot: Arc<JobSlot>, ctx: Arc<JobContext>) -> Self {
        let cancelled = slot.cancel.subscribe();
        Self {
            slot,
            ctx,
            state: JobState::Pending,
            registry_snapshot_id: None,
            cancelled,
            recorded: false,
        }
    }

    /// Run to a terminal state
    ///
    /// A panicking collaborator fails the job like any other stage error.
    pub(crate) async fn run(mut self) -> Settled {
        let outcome = AssertUnwindSafe(self.drive()).catch_unwind().await;
        match outcome {
            Ok(Ok(Completion::Committed(entry))) => self.finish_committed(&entry),
            Ok(Ok(Completion::AlreadyActive(entry))) => self.finish_no_op(&entry),
            Ok(Err(reason)) => self.fail(reason),
            Err(panic) => {
                let reason = FailureReason::new(
                    ErrorKind::Interrupted,
                    format!("panicked during {}: {}", self.state, panic_message(panic.as_ref())),
                );
                self.fail(reason);
            }
        }
        Settled {
            view: self.slot.view(),
            recorded: self.recorded,
        }
    }

    async fn drive(&mut self) -> Result<Completion, FailureReason> {
        self.ctx
            .audit
            .append(
                RecordDraft::transition(self.slot.id, self.slot.service.clone(), None, JobState::Pending)
                    .with_detail("submitted"),
            )
            .map_err(audit_unavailable)?;

        let permits = Arc::clone(&self.ctx.permits);
        let _permit = self
            .cancellable(permits.acquire_owned())
            .await?
            .map_err(|_| FailureReason::new(ErrorKind::ManagerHalted, "job scheduler closed"))?;

        self.advance(JobState::Validating, None)?;
        let snapshot = self.ctx.registry.snapshot();
        self.registry_snapshot_id = Some(snapshot.version());
        if let Some(done) = self.resolve(&snapshot)? {
            return Ok(done);
        }
        drop(snapshot);

        self.advance(JobState::Downloading, None)?;
        let package = self
            .guarded(self.fetch_with_retry())
            .await?
            .map_err(|e| FailureReason::new(ErrorKind::FetchError, e.to_string()))?;

        self.advance(JobState::VerifyingSignature, None)?;
        self.guarded(self.ctx.collaborators.verifier.verify(&self.slot.descriptor, &package))
            .await?
            .map_err(|e| {
                tracing::warn!(
                    job_id = %self.slot.id,
                    service = self.slot.descriptor.name(),
                    version = %self.slot.descriptor.version(),
                    error = %e,
                    "package integrity check failed"
                );
                FailureReason::new(ErrorKind::IntegrityError, e.to_string())
            })?;

        let mut retries_left = self.ctx.config.commit_retries;
        let mut built = false;
        loop {
            let detail = built.then(|| "re-validating after concurrent commit".to_string());
            self.advance(JobState::ResolvingDependencies, detail)?;
            let snapshot = self.ctx.registry.snapshot();
            if let Some(done) = self.resolve(&snapshot)? {
                return Ok(done);
            }

            if !built {
                self.generate_build_test(&package).await?;
                built = true;
            }

            self.advance(JobState::Committing, Some(format!("base registry v{}", snapshot.version())))?;
            match self.commit(&snapshot) {
                Ok(entry) => return Ok(Completion::Committed(entry)),
                Err(err) if err.is_stale() && retries_left > 0 => {
                    retries_left -= 1;
                    tracing::info!(job_id = %self.slot.id, error = %err, "stale snapshot at commit, re-validating");
                }
                Err(err) => return Err(self.commit_failure(err)),
            }
        }
    }

    fn resolve(&self, snapshot: &Snapshot) -> Result<Option<Completion>, FailureReason> {
        match self.ctx.resolver.validate(&self.slot.descriptor, snapshot) {
            Ok(Resolution::Admissible) => Ok(None),
            Ok(Resolution::AlreadyActive) => Ok(snapshot
                .get(self.slot.descriptor.name())
                .cloned()
                .map(Completion::AlreadyActive)),
            Err(err) => {
                tracing::info!(job_id = %self.slot.id, error = %err, "candidate rejected by resolver");
                Err(FailureReason::from(&err))
            }
        }
    }

    async fn fetch_with_retry(&self) -> Result<ServicePackage, FetchError> {
        let config = &self.ctx.config;
        let mut attempt = 0u32;
        loop {
            match self.ctx.collaborators.source.fetch(&self.slot.descriptor).await {
                Ok(package) => return Ok(package),
                Err(err) if err.is_retryable() && attempt < config.fetch_retries => {
                    let delay = Duration::from_millis(config.fetch_backoff_ms.saturating_mul(1u64 << attempt.min(16)));
                    attempt += 1;
                    tracing::warn!(
                        job_id = %self.slot.id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn generate_build_test(&mut self, package: &ServicePackage) -> Result<(), FailureReason> {
        let descriptor = Arc::clone(&self.slot.descriptor);

        self.advance(JobState::Generating, None)?;
        let toolchain = self
            .ctx
            .collaborators
            .toolchains
            .get(descriptor.language())
            .ok_or_else(|| {
                FailureReason::new(
                    ErrorKind::GenerationError,
                    format!("no toolchain registered for language {}", descriptor.language()),
                )
            })?;
        self.guarded(toolchain.generate(&descriptor, package))
            .await?
            .map_err(|f| FailureReason::new(ErrorKind::GenerationError, f.diagnostic))?;

        self.advance(JobState::Building, None)?;
        self.guarded(toolchain.build(&descriptor, package))
            .await?
            .map_err(|f| FailureReason::new(ErrorKind::BuildError, f.diagnostic))?;

        self.advance(JobState::Testing, None)?;
        self.guarded(toolchain.test(&descriptor, package))
            .await?
            .map_err(|f| FailureReason::new(ErrorKind::TestFailure, f.diagnostic))?;
        Ok(())
    }

    fn commit(&self, snapshot: &Snapshot) -> Result<RegistryEntry, RegistryError> {
        let registry = &self.ctx.registry;
        let txn = registry.begin_transaction(snapshot)?;
        registry.commit(txn, (*self.slot.descriptor).clone())
    }

    fn commit_failure(&self, err: RegistryError) -> FailureReason {
        match err {
            RegistryError::StaleSnapshot { expected, found } => FailureReason::new(
                ErrorKind::ConcurrentModification,
                format!("registry advanced from v{expected} to v{found}; retry budget exhausted"),
            ),
            RegistryError::InvariantViolation(msg) => {
                self.ctx.supervisor.halt(&msg);
                FailureReason::new(ErrorKind::ManagerHalted, msg)
            }
            RegistryError::Storage(msg) => FailureReason::new(ErrorKind::RegistryUnavailable, msg),
            RegistryError::NotFound(name) => {
                FailureReason::new(ErrorKind::RegistryUnavailable, format!("registry lost entry {name}"))
            }
        }
    }

    /// Record and enter the next pipeline state
    fn advance(&mut self, to: JobState, detail: Option<String>) -> Result<(), FailureReason> {
        if let Err(err) = validate_transition(self.state, to) {
            let msg = err.to_string();
            self.ctx.supervisor.halt(&msg);
            return Err(FailureReason::new(ErrorKind::ManagerHalted, msg));
        }

        let mut control = self.slot.control.lock();
        if control.cancel_requested {
            return Err(self.cancelled_reason());
        }
        if let Some(reason) = self.ctx.supervisor.halt_reason() {
            return Err(FailureReason::new(ErrorKind::ManagerHalted, reason));
        }

        let mut draft = RecordDraft::transition(self.slot.id, self.slot.service.clone(), Some(self.state), to);
        if let Some(detail) = detail {
            draft = draft.with_detail(detail);
        }
        self.ctx.audit.append(draft).map_err(audit_unavailable)?;
        control.state = to;
        drop(control);

        tracing::info!(
            job_id = %self.slot.id,
            service = self.slot.descriptor.name(),
            version = %self.slot.descriptor.version(),
            from = %self.state,
            state = %to,
            "job transition"
        );
        self.state = to;
        self.slot.view.send_modify(|view| view.state = to);
        Ok(())
    }

    fn finish_committed(&mut self, entry: &RegistryEntry) {
        let draft = RecordDraft::transition(self.slot.id, self.slot.service.clone(), Some(self.state), JobState::Active)
            .with_detail(format!("registry v{}", entry.commit_version()));
        match self.ctx.audit.append(draft) {
            Ok(_) => self.recorded = true,
            // the commit is already published; recovery closes the job on restart
            Err(err) => {
                tracing::error!(job_id = %self.slot.id, error = %err, "Active record not written for committed job");
            }
        }
        self.settle(JobState::Active, None, Some(entry));
        tracing::info!(
            job_id = %self.slot.id,
            service = entry.name(),
            version = %entry.version(),
            registry_version = entry.commit_version(),
            "service activated"
        );
    }

    fn finish_no_op(&mut self, entry: &RegistryEntry) {
        let draft = RecordDraft::transition(self.slot.id, self.slot.service.clone(), Some(self.state), self.state)
            .with_detail(format!("no-op: {} already active", entry.descriptor().id()))
            .closing();
        if let Err(err) = self.ctx.audit.append(draft) {
            return self.fail(audit_unavailable(err));
        }
        self.recorded = true;
        tracing::info!(job_id = %self.slot.id, service = entry.name(), "identical descriptor already active");
        self.settle(JobState::Active, None, Some(entry));
    }

    /// `Failed` then `RolledBack`; the registry was never touched
    fn fail(&mut self, reason: FailureReason) {
        tracing::warn!(
            job_id = %self.slot.id,
            service = self.slot.descriptor.name(),
            version = %self.slot.descriptor.version(),
            state = %self.state,
            kind = %reason.kind,
            error = %reason.message,
            "job failed"
        );

        if self.state != JobState::Failed {
            let draft = RecordDraft::transition(self.slot.id, self.slot.service.clone(), Some(self.state), JobState::Failed)
                .with_detail(reason.to_string());
            if let Err(err) = self.ctx.audit.append(draft) {
                tracing::error!(job_id = %self.slot.id, error = %err, "Failed record not written");
            }
            self.settle(JobState::Failed, Some(reason.clone()), None);
        }

        let detail = match self.registry_snapshot_id {
            Some(v) => format!("registry untouched; admitted at v{v}"),
            None => "registry untouched".to_string(),
        };
        let draft = RecordDraft::transition(self.slot.id, self.slot.service.clone(), Some(JobState::Failed), JobState::RolledBack)
            .with_detail(detail);
        match self.ctx.audit.append(draft) {
            Ok(_) => self.recorded = true,
            Err(err) => tracing::error!(job_id = %self.slot.id, error = %err, "RolledBack record not written"),
        }
        self.settle(JobState::RolledBack, Some(reason), None);
    }

    fn settle(&mut self, state: JobState, detail: Option<FailureReason>, entry: Option<&RegistryEntry>) {
        self.slot.control.lock().state = state;
        self.state = state;
        let summary = entry.map(RegistryEntry::summary);
        self.slot.view.send_modify(|view| {
            view.state = state;
            view.detail = detail;
            view.registry_entry = summary;
        });
    }

    fn cancelled_reason(&self) -> FailureReason {
        FailureReason::new(ErrorKind::Cancelled, format!("cancelled during {}", self.state))
    }

    /// Race `fut` against a cancellation request
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, FailureReason> {
        tokio::select! {
            out = fut => Ok(out),
            () = cancel_requested(self.cancelled.clone()) => Err(self.cancelled_reason()),
        }
    }

    /// [`Self::cancellable`] plus the current stage's time limit
    async fn guarded<F: Future>(&self, fut: F) -> Result<F::Output, FailureReason> {
        let limit = self.ctx.config.timeouts.for_stage(self.state);
        self.cancellable(tokio::time::timeout(limit, fut)).await?.map_err(|_| {
            tracing::warn!(
                job_id = %self.slot.id,
                stage = %self.state,
                limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                "stage timed out"
            );
            FailureReason::timeout(self.state, limit)
        })
    }
}

async fn cancel_requested(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn audit_unavailable(err: AuditError) -> FailureReason {
    FailureReason::new(ErrorKind::AuditUnavailable, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("linker crashed"));
        let other: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "linker crashed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn first_halt_reason_is_kept() {
        let supervisor = Supervisor::default();
        assert!(supervisor.halt_reason().is_none());
        supervisor.halt("first");
        supervisor.halt("second");
        assert_eq!(supervisor.halt_reason().as_deref(), Some("first"));
    }

    #[test]
    fn cancel_is_refused_once_committing() {
        use ota_registry::Language;
        use semver::Version;

        let d = ServiceDescriptor::builder("A", Language::C, Version::new(1, 0, 0))
            .build()
            .unwrap();
        let slot = JobSlot::new(JobId::new(), d);
        assert!(slot.request_cancel().is_ok());
        assert!(*slot.cancel.borrow());

        slot.control.lock().state = JobState::Committing;
        assert_eq!(slot.request_cancel(), Err(JobState::Committing));
    }
}
