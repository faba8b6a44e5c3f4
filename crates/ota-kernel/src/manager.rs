//! Injection manager
//!
//! Accepts descriptors, spawns one [`InjectionJob`] per submission and
//! answers status, cancellation and listing requests. At most
//! `max_concurrent_jobs` jobs run past `Pending` at once; commits are
//! serialized by the registry.
//!
//! # Recovery
//!
//! Construction replays the audit trail. A job without a closing record
//! was interrupted:
//!
//! - last seen in `Committing` with its digest Active in the registry: the
//!   commit landed, so the job is closed as `Active`
//! - otherwise it is closed as `Failed(Interrupted)` then `RolledBack`
//!
//! A job is kept in memory only until its closing record is written;
//! afterwards its status is read back from the audit trail.

use crate::audit::{AuditLog, AuditRecord, JsonlAuditStore, RecordDraft};
use crate::collaborators::Collaborators;
use crate::config::ManagerConfig;
use crate::error::{AuditError, ErrorKind, FailureReason, ManagerError};
use crate::job::{InjectionJob, JobContext, JobSlot, Supervisor};
use crate::types::{JobId, JobState, JobView};
use dashmap::DashMap;
use ota_registry::{
    InjectionRequest, RegistryEntry, RegistryError, RegistryStore, Resolver, ServiceDescriptor, ServiceRegistry,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::Instrument;

/// Runs injection jobs against one registry and audit trail
pub struct InjectionManager {
    ctx: Arc<JobContext>,
    /// Jobs still running, or whose closing record never reached the audit trail
    jobs: Arc<DashMap<JobId, Arc<JobSlot>>>,
}

impl InjectionManager {
    /// In-memory registry and audit trail
    ///
    /// # Errors
    /// [`ManagerError::Config`] if `config` is invalid.
    pub fn new(config: ManagerConfig, collaborators: Collaborators) -> Result<Self, ManagerError> {
        Self::from_parts(config, collaborators, ServiceRegistry::new(), AuditLog::in_memory())
    }

    /// Registry and audit trail persisted under `state_dir`
    ///
    /// # Errors
    /// Invalid config, unreadable state, or a broken audit chain.
    pub fn open(
        config: ManagerConfig,
        collaborators: Collaborators,
        state_dir: impl AsRef<Path>,
    ) -> Result<Self, ManagerError> {
        let state_dir = state_dir.as_ref();
        let registry = ServiceRegistry::open(RegistryStore::in_dir(state_dir))?;
        let audit = AuditLog::open(Box::new(JsonlAuditStore::in_dir(state_dir)))?;
        tracing::info!(
            state_dir = %state_dir.display(),
            registry_version = registry.version(),
            audit_records = audit.len(),
            "state loaded"
        );
        Self::from_parts(config, collaborators, registry, audit)
    }

    /// Assemble from explicit parts and reconcile interrupted jobs
    ///
    /// # Errors
    /// Invalid config, or an audit write failed during recovery.
    pub fn from_parts(
        config: ManagerConfig,
        collaborators: Collaborators,
        registry: ServiceRegistry,
        audit: AuditLog,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let recovered = recover(&registry, &audit)?;
        if recovered > 0 {
            tracing::warn!(jobs = recovered, "closed jobs interrupted by a previous shutdown");
        }

        let ctx = JobContext {
            supervisor: Supervisor::default(),
            registry: Arc::new(registry),
            audit: Arc::new(audit),
            resolver: Resolver::new(config.compatibility),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            collaborators,
            config,
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            jobs: Arc::new(DashMap::new()),
        })
    }

    /// Queue an injection request
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// [`ManagerError::InvalidDescriptor`] for a malformed request,
    /// [`ManagerError::Halted`] once the manager has stopped.
    pub fn submit(&self, request: InjectionRequest) -> Result<JobId, ManagerError> {
        let descriptor = ServiceDescriptor::try_from(request)?;
        self.submit_descriptor(descriptor)
    }

    /// Queue an already-built descriptor
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// [`ManagerError::Halted`] once the manager has stopped.
    pub fn submit_descriptor(&self, descriptor: ServiceDescriptor) -> Result<JobId, ManagerError> {
        if let Some(reason) = self.ctx.supervisor.halt_reason() {
            return Err(ManagerError::Halted(reason));
        }

        let job_id = JobId::new();
        let span = tracing::info_span!("job", %job_id, service = %descriptor.id());
        let slot = JobSlot::new(job_id, descriptor);
        self.jobs.insert(job_id, Arc::clone(&slot));

        let job = InjectionJob::new(slot, Arc::clone(&self.ctx));
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(
            async move {
                let settled = job.run().await;
                // the audit trail serves finished jobs from here on
                if settled.recorded {
                    jobs.remove(&settled.view.job_id);
                }
            }
            .instrument(span),
        );
        tracing::info!(%job_id, "job submitted");
        Ok(job_id)
    }

    /// Current view of a job
    ///
    /// Finished jobs, including those of earlier runs, are reconstructed
    /// from the audit trail.
    ///
    /// # Errors
    /// [`ManagerError::UnknownJob`] if the ID was never seen.
    pub fn status(&self, job_id: JobId) -> Result<JobView, ManagerError> {
        if let Some(slot) = self.jobs.get(&job_id) {
            return Ok(slot.view());
        }
        self.view_from_audit(job_id).ok_or(ManagerError::UnknownJob(job_id))
    }

    /// Views of in-flight jobs, oldest first
    #[must_use]
    pub fn jobs(&self) -> Vec<JobView> {
        let mut views: Vec<_> = self.jobs.iter().map(|slot| slot.view()).collect();
        views.sort_by_key(|v| v.job_id);
        views
    }

    /// Wait until the job reaches `Active` or `RolledBack`
    ///
    /// # Errors
    /// [`ManagerError::UnknownJob`] if the ID was never seen.
    pub async fn wait(&self, job_id: JobId) -> Result<JobView, ManagerError> {
        let Some(slot) = self.jobs.get(&job_id).map(|s| Arc::clone(&s)) else {
            return self.status(job_id);
        };
        let mut rx = slot.subscribe();
        let view = match rx.wait_for(|v| v.state.is_terminal()).await {
            Ok(view) => view.clone(),
            Err(_) => slot.view(),
        };
        Ok(view)
    }

    /// Wait for every in-flight job to finish
    pub async fn drain(&self) -> Vec<JobView> {
        let ids: Vec<JobId> = self.jobs.iter().map(|slot| *slot.key()).collect();
        let views = futures::future::join_all(ids.into_iter().map(|id| self.wait(id))).await;
        let mut views: Vec<_> = views.into_iter().filter_map(Result::ok).collect();
        views.sort_by_key(|v| v.job_id);
        views
    }

    /// Request cancellation
    ///
    /// Honoured at the job's next step; the job then ends `RolledBack`.
    ///
    /// # Errors
    /// [`ManagerError::CancelRejected`] once the job is `Committing` or
    /// later, [`ManagerError::UnknownJob`] if the ID was never seen.
    pub fn cancel(&self, job_id: JobId) -> Result<(), ManagerError> {
        let Some(slot) = self.jobs.get(&job_id).map(|s| Arc::clone(&s)) else {
            let view = self.view_from_audit(job_id).ok_or(ManagerError::UnknownJob(job_id))?;
            return Err(ManagerError::CancelRejected {
                job_id,
                state: view.state,
            });
        };
        slot.request_cancel()
            .map_err(|state| ManagerError::CancelRejected { job_id, state })?;
        tracing::info!(%job_id, "cancellation requested");
        Ok(())
    }

    /// Re-inject the most recent retired version of `name`
    ///
    /// # Errors
    /// [`ManagerError::NoPreviousVersion`] if `name` is not Active or has
    /// no retired version with different content.
    pub fn revert(&self, name: &str) -> Result<JobId, ManagerError> {
        let active = self
            .ctx
            .registry
            .query(name)
            .map_err(|_| ManagerError::NoPreviousVersion(name.to_string()))?;
        let previous = self
            .ctx
            .registry
            .history(name)
            .into_iter()
            .rev()
            .find(|e| !e.descriptor().same_content(active.descriptor()))
            .ok_or_else(|| ManagerError::NoPreviousVersion(name.to_string()))?;

        tracing::info!(
            service = name,
            from = %active.version(),
            to = %previous.version(),
            "reverting service"
        );
        self.submit_descriptor(previous.descriptor().clone())
    }

    /// Active entries ordered by name
    #[must_use]
    pub fn list(&self) -> Vec<RegistryEntry> {
        self.ctx.registry.list()
    }

    /// Active entry for `name`
    ///
    /// # Errors
    /// [`RegistryError::NotFound`] if nothing by that name is Active.
    pub fn query(&self, name: &str) -> Result<RegistryEntry, RegistryError> {
        self.ctx.registry.query(name)
    }

    /// The registry
    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.ctx.registry
    }

    /// The audit trail
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.ctx.audit
    }

    /// Stopped after an invariant violation
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.ctx.supervisor.halt_reason().is_some()
    }

    /// Why the manager stopped
    #[must_use]
    pub fn halt_reason(&self) -> Option<String> {
        self.ctx.supervisor.halt_reason()
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.ctx.config
    }

    fn view_from_audit(&self, job_id: JobId) -> Option<JobView> {
        let history = self.ctx.audit.history(job_id);
        let last = history.last()?;

        // a closing record on a non-terminal state is an idempotent no-op
        let state = if last.closes_job && !last.to_state.is_terminal() {
            JobState::Active
        } else {
            last.to_state
        };
        let detail = history
            .iter()
            .rev()
            .find(|r| r.to_state == JobState::Failed)
            .and_then(|r| r.detail.as_deref())
            .and_then(|d| d.parse::<FailureReason>().ok());
        let registry_entry = if state == JobState::Active {
            self.ctx
                .registry
                .query(&last.service.name)
                .ok()
                .filter(|e| e.descriptor().digest().to_string() == last.service.digest)
                .map(|e| e.summary())
        } else {
            None
        };

        Some(JobView {
            job_id,
            service: format!("{}@{}", last.service.name, last.service.version),
            state,
            detail,
            registry_entry,
        })
    }
}

impl std::fmt::Debug for InjectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionManager")
            .field("jobs", &self.jobs.len())
            .field("registry_version", &self.ctx.registry.version())
            .field("halted", &self.is_halted())
            .finish_non_exhaustive()
    }
}

/// Close every job the audit trail left open
fn recover(registry: &ServiceRegistry, audit: &AuditLog) -> Result<usize, AuditError> {
    let open = audit.open_jobs();
    let snapshot = registry.snapshot();
    for last in &open {
        let committed = last.to_state == JobState::Committing
            && snapshot
                .get(&last.service.name)
                .is_some_and(|e| e.descriptor().digest().to_string() == last.service.digest);

        if committed {
            audit.append(
                transition(last, JobState::Committing, JobState::Active)
                    .with_detail("recovered: commit present in registry"),
            )?;
            tracing::info!(job_id = %last.job_id, service = %last.service.name, "recovered committed job");
            continue;
        }

        if last.to_state != JobState::Failed {
            let reason = FailureReason::new(
                ErrorKind::Interrupted,
                format!("process stopped during {}", last.to_state),
            );
            audit.append(transition(last, last.to_state, JobState::Failed).with_detail(reason.to_string()))?;
        }
        audit.append(transition(last, JobState::Failed, JobState::RolledBack).with_detail("registry untouched"))?;
        tracing::info!(job_id = %last.job_id, service = %last.service.name, state = %last.to_state, "rolled back interrupted job");
    }
    Ok(open.len())
}

fn transition(last: &AuditRecord, from: JobState, to: JobState) -> RecordDraft {
    RecordDraft::transition(last.job_id, last.service.clone(), Some(from), to)
}
