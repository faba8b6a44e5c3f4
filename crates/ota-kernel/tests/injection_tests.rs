use ed25519_dalek::SigningKey;
use ota_kernel::audit::{AuditLog, JsonlAuditStore, MemoryAuditStore, RecordDraft, ServiceRef};
use ota_kernel::collaborators::{Collaborators, Ed25519Verifier, ToolchainRegistry};
use ota_kernel::error::FetchError;
use ota_kernel::{ErrorKind, InjectionManager, JobId, JobState, JobView, ManagerConfig, ManagerError, StageTimeouts};
use ota_registry::{EntryStatus, ServiceRegistry};
use ota_test_utils::{
    collaborators, descriptor, descriptor_with_deps, fast_config, request, seeded_registry, setup_manager,
    FailingAuditStore, Gate, ScriptedSource, ScriptedToolchain, Stage,
};
use pretty_assertions::assert_eq;
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;

fn manager_with(config: ManagerConfig, source: ScriptedSource, toolchain: ScriptedToolchain) -> InjectionManager {
    InjectionManager::new(config, collaborators(Arc::new(source), Arc::new(toolchain))).unwrap()
}

fn manager_over(registry: ServiceRegistry, toolchain: ScriptedToolchain) -> InjectionManager {
    InjectionManager::from_parts(
        fast_config(),
        collaborators(Arc::new(ScriptedSource::new()), Arc::new(toolchain)),
        registry,
        AuditLog::in_memory(),
    )
    .unwrap()
}

async fn inject(manager: &InjectionManager, name: &str, version: &str, deps: &[(&str, &str)]) -> JobView {
    let job_id = manager.submit(request(name, version, deps)).unwrap();
    manager.wait(job_id).await.unwrap()
}

async fn wait_all(manager: &InjectionManager, ids: &[JobId]) -> Vec<JobView> {
    let mut views = Vec::with_capacity(ids.len());
    for id in ids {
        views.push(manager.wait(*id).await.unwrap());
    }
    views
}

fn path_of(manager: &InjectionManager, job_id: JobId) -> Vec<JobState> {
    manager.audit().history(job_id).iter().map(|r| r.to_state).collect()
}

fn failure_kind(view: &JobView) -> ErrorKind {
    view.detail.as_ref().expect("failed job carries a reason").kind
}

#[tokio::test]
async fn test_fresh_service_becomes_active() {
    let manager = setup_manager();
    let view = inject(&manager, "A", "1.0.0", &[]).await;

    assert_eq!(view.state, JobState::Active);
    assert!(view.detail.is_none());
    let entry = view.registry_entry.unwrap();
    assert_eq!(entry.name, "A");
    assert_eq!(entry.version, "1.0.0");
    assert_eq!(entry.status, EntryStatus::Active);

    assert_eq!(manager.query("A").unwrap().version().to_string(), "1.0.0");
    assert_eq!(manager.registry().version(), 1);
    assert_eq!(
        path_of(&manager, view.job_id),
        vec![
            JobState::Pending,
            JobState::Validating,
            JobState::Downloading,
            JobState::VerifyingSignature,
            JobState::ResolvingDependencies,
            JobState::Generating,
            JobState::Building,
            JobState::Testing,
            JobState::Committing,
            JobState::Active,
        ]
    );
    assert!(manager.audit().verify_integrity().is_ok());
}

#[tokio::test]
async fn test_incompatible_dependency_fails_validation() {
    let manager = setup_manager();
    assert!(inject(&manager, "A", "1.0.0", &[]).await.succeeded());

    let view = inject(&manager, "B", "1.0.0", &[("A", ">=2.0.0")]).await;
    assert_eq!(view.state, JobState::RolledBack);
    assert_eq!(failure_kind(&view), ErrorKind::VersionIncompatible);
    assert!(manager.query("B").is_err());
    assert_eq!(manager.registry().version(), 1);
    assert_eq!(
        path_of(&manager, view.job_id),
        vec![JobState::Pending, JobState::Validating, JobState::Failed, JobState::RolledBack]
    );
}

#[tokio::test]
async fn test_missing_dependency_fails_before_download() {
    let source = Arc::new(ScriptedSource::new());
    let manager = InjectionManager::new(
        fast_config(),
        collaborators(Arc::clone(&source), Arc::new(ScriptedToolchain::new())),
    )
    .unwrap();

    let view = inject(&manager, "B", "1.0.0", &[("A", "1.0.0")]).await;
    assert_eq!(failure_kind(&view), ErrorKind::DependencyMissing);
    assert_eq!(source.fetch_count(), 0);
}

#[tokio::test]
async fn test_concurrent_mutual_dependencies_admit_exactly_one() {
    let gate = Gate::new();
    let manager = manager_over(
        seeded_registry(&[descriptor("C", "1.0.0"), descriptor("D", "1.0.0")]),
        ScriptedToolchain::new().gated(Stage::Build, Arc::clone(&gate)),
    );

    let c = manager.submit(request("C", "1.1.0", &[("D", ">=1.0.0")])).unwrap();
    let d = manager.submit(request("D", "1.1.0", &[("C", ">=1.0.0")])).unwrap();

    // both validated against the same registry before either commits
    gate.arrivals(2).await;
    gate.release(2);

    let views = [manager.wait(c).await.unwrap(), manager.wait(d).await.unwrap()];
    let active = views.iter().filter(|v| v.succeeded()).count();
    let cyclic: Vec<_> = views
        .iter()
        .filter(|v| v.detail.as_ref().is_some_and(|d| d.kind == ErrorKind::CyclicDependency))
        .collect();
    assert_eq!(active, 1);
    assert_eq!(cyclic.len(), 1);
    assert_eq!(cyclic[0].state, JobState::RolledBack);

    let order = manager.registry().activation_order().unwrap();
    assert_eq!(order.len(), 2);
}

#[tokio::test]
async fn test_stale_commit_retries_once_and_succeeds() {
    let gate = Gate::new();
    let manager = manager_with(
        fast_config(),
        ScriptedSource::new(),
        ScriptedToolchain::new().gated(Stage::Build, Arc::clone(&gate)),
    );

    let a = manager.submit(request("A", "1.0.0", &[])).unwrap();
    let b = manager.submit(request("B", "1.0.0", &[])).unwrap();
    gate.arrivals(2).await;
    gate.release(2);

    let views = wait_all(&manager, &[a, b]).await;
    assert_eq!(views.len(), 2);
    assert!(views.iter().all(JobView::succeeded));
    assert_eq!(manager.registry().version(), 2);

    let retried: Vec<_> = [a, b]
        .into_iter()
        .filter(|id| {
            manager
                .audit()
                .history(*id)
                .iter()
                .any(|r| r.from_state == Some(JobState::Committing) && r.to_state == JobState::ResolvingDependencies)
        })
        .collect();
    assert_eq!(retried.len(), 1);
}

#[tokio::test]
async fn test_stale_commit_without_retry_budget_is_concurrent_modification() {
    let gate = Gate::new();
    let manager = manager_with(
        fast_config().with_commit_retries(0),
        ScriptedSource::new(),
        ScriptedToolchain::new().gated(Stage::Build, Arc::clone(&gate)),
    );

    let a = manager.submit(request("A", "1.0.0", &[])).unwrap();
    let b = manager.submit(request("B", "1.0.0", &[])).unwrap();
    gate.arrivals(2).await;
    gate.release(2);

    let views = wait_all(&manager, &[a, b]).await;
    let failed: Vec<_> = views.iter().filter(|v| !v.succeeded()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failure_kind(failed[0]), ErrorKind::ConcurrentModification);
    assert_eq!(manager.registry().version(), 1);
}

#[tokio::test]
async fn test_failed_test_leaves_registry_identical() {
    let manager = manager_with(
        fast_config(),
        ScriptedSource::new(),
        ScriptedToolchain::new().failing("B", Stage::Test, "assertion failed: 2 != 3\n"),
    );
    assert!(inject(&manager, "A", "1.0.0", &[]).await.succeeded());
    let before = manager.registry().snapshot();

    let view = inject(&manager, "B", "1.0.0", &[("A", "^1.0.0")]).await;
    assert_eq!(view.state, JobState::RolledBack);
    let reason = view.detail.unwrap();
    assert_eq!(reason.kind, ErrorKind::TestFailure);
    assert_eq!(reason.message, "assertion failed: 2 != 3\n");

    let after = manager.registry().snapshot();
    assert_eq!(*before, *after);
}

#[tokio::test]
async fn test_build_diagnostic_is_verbatim() {
    let manager = manager_with(
        fast_config(),
        ScriptedSource::new(),
        ScriptedToolchain::new().failing("A", Stage::Build, "error[E0308]: mismatched types"),
    );
    let view = inject(&manager, "A", "1.0.0", &[]).await;
    let reason = view.detail.unwrap();
    assert_eq!(reason.kind, ErrorKind::BuildError);
    assert_eq!(reason.message, "error[E0308]: mismatched types");

    let failed = manager
        .audit()
        .history(view.job_id)
        .into_iter()
        .find(|r| r.to_state == JobState::Failed)
        .unwrap();
    assert_eq!(failed.from_state, Some(JobState::Building));
    assert_eq!(failed.detail.as_deref(), Some("BuildError: error[E0308]: mismatched types"));
}

#[tokio::test]
async fn test_identical_reinjection_is_a_no_op() {
    let manager = setup_manager();
    let first = inject(&manager, "A", "1.0.0", &[]).await;
    let second = inject(&manager, "A", "1.0.0", &[]).await;

    assert_eq!(second.state, JobState::Active);
    assert_eq!(second.registry_entry, first.registry_entry);
    assert_eq!(manager.registry().version(), 1);

    let records = manager.audit().history(second.job_id);
    assert!(records.iter().all(|r| r.to_state != JobState::Active));
    assert!(records.last().unwrap().closes_job);
    assert!(manager.audit().open_jobs().is_empty());
    assert_eq!(manager.status(second.job_id).unwrap().state, JobState::Active);
}

#[tokio::test]
async fn test_same_version_different_content_is_duplicate() {
    let manager = setup_manager();
    assert!(inject(&manager, "A", "1.0.0", &[]).await.succeeded());
    assert!(inject(&manager, "B", "1.0.0", &[]).await.succeeded());

    let view = inject(&manager, "A", "1.0.0", &[("B", "1.0.0")]).await;
    assert_eq!(failure_kind(&view), ErrorKind::DuplicateVersion);
}

#[tokio::test]
async fn test_transient_fetch_errors_are_retried() {
    let source = Arc::new(ScriptedSource::new().failing(
        "A",
        [
            FetchError::Unavailable("connection reset".into()),
            FetchError::Unavailable("connection reset".into()),
        ],
    ));
    let manager = InjectionManager::new(
        fast_config(),
        collaborators(Arc::clone(&source), Arc::new(ScriptedToolchain::new())),
    )
    .unwrap();

    let view = inject(&manager, "A", "1.0.0", &[]).await;
    assert!(view.succeeded());
    assert_eq!(source.fetch_count(), 3);
}

#[tokio::test]
async fn test_fetch_gives_up_after_retry_budget() {
    let source = Arc::new(ScriptedSource::new().failing(
        "A",
        (0..3).map(|_| FetchError::Unavailable("timeout".into())),
    ));
    let manager = InjectionManager::new(
        fast_config(),
        collaborators(Arc::clone(&source), Arc::new(ScriptedToolchain::new())),
    )
    .unwrap();

    let view = inject(&manager, "A", "1.0.0", &[]).await;
    assert_eq!(failure_kind(&view), ErrorKind::FetchError);
    assert_eq!(source.fetch_count(), 3);
}

#[tokio::test]
async fn test_missing_package_is_not_retried() {
    let source = Arc::new(ScriptedSource::new().failing("A", [FetchError::NotFound("A-1.0.0.pkg".into())]));
    let manager = InjectionManager::new(
        fast_config(),
        collaborators(Arc::clone(&source), Arc::new(ScriptedToolchain::new())),
    )
    .unwrap();

    let view = inject(&manager, "A", "1.0.0", &[]).await;
    assert_eq!(failure_kind(&view), ErrorKind::FetchError);
    assert_eq!(source.fetch_count(), 1);
}

#[tokio::test]
async fn test_unsigned_package_fails_integrity() {
    let key = SigningKey::generate(&mut OsRng);
    let collaborators = Collaborators::new(
        Arc::new(ScriptedSource::new()),
        Arc::new(Ed25519Verifier::new(key.verifying_key())),
        ToolchainRegistry::uniform(Arc::new(ScriptedToolchain::new())),
    );
    let manager = InjectionManager::new(fast_config(), collaborators).unwrap();

    let view = inject(&manager, "A", "1.0.0", &[]).await;
    assert_eq!(failure_kind(&view), ErrorKind::IntegrityError);
    assert!(manager.list().is_empty());
}

#[tokio::test]
async fn test_missing_toolchain_is_generation_error() {
    let collaborators = Collaborators::new(
        Arc::new(ScriptedSource::new()),
        Arc::new(ota_kernel::collaborators::DigestVerifier),
        ToolchainRegistry::new(),
    );
    let manager = InjectionManager::new(fast_config(), collaborators).unwrap();

    let view = inject(&manager, "A", "1.0.0", &[]).await;
    assert_eq!(failure_kind(&view), ErrorKind::GenerationError);
    let failed_from = manager
        .audit()
        .history(view.job_id)
        .into_iter()
        .find(|r| r.to_state == JobState::Failed)
        .and_then(|r| r.from_state);
    assert_eq!(failed_from, Some(JobState::Generating));
}

#[tokio::test]
async fn test_stage_timeout_names_the_stage() {
    let manager = manager_with(
        fast_config().with_timeouts(StageTimeouts::uniform(50)),
        ScriptedSource::new(),
        ScriptedToolchain::new().with_delay(Stage::Build, Duration::from_secs(5)),
    );

    let view = inject(&manager, "A", "1.0.0", &[]).await;
    let reason = view.detail.unwrap();
    assert_eq!(reason.kind, ErrorKind::Timeout);
    assert!(reason.message.starts_with("Timeout(Building)"), "{}", reason.message);
    assert!(manager.list().is_empty());
}

#[tokio::test]
async fn test_cancel_before_commit_rolls_back() {
    let gate = Gate::new();
    let manager = manager_with(
        fast_config(),
        ScriptedSource::new(),
        ScriptedToolchain::new().gated(Stage::Test, Arc::clone(&gate)),
    );

    let job_id = manager.submit(request("A", "1.0.0", &[])).unwrap();
    gate.arrivals(1).await;
    manager.cancel(job_id).unwrap();

    let view = manager.wait(job_id).await.unwrap();
    assert_eq!(view.state, JobState::RolledBack);
    assert_eq!(failure_kind(&view), ErrorKind::Cancelled);
    assert!(manager.list().is_empty());

    let err = manager.cancel(job_id).unwrap_err();
    assert!(matches!(err, ManagerError::CancelRejected { state: JobState::RolledBack, .. }));
}

#[tokio::test]
async fn test_cancel_rejected_once_active() {
    let manager = setup_manager();
    let view = inject(&manager, "A", "1.0.0", &[]).await;
    let err = manager.cancel(view.job_id).unwrap_err();
    assert!(matches!(err, ManagerError::CancelRejected { state: JobState::Active, .. }));
}

#[tokio::test]
async fn test_concurrency_limit_holds_jobs_in_pending() {
    let gate = Gate::new();
    let manager = manager_with(
        fast_config().with_max_concurrent_jobs(1),
        ScriptedSource::new(),
        ScriptedToolchain::new().gated(Stage::Build, Arc::clone(&gate)),
    );

    let a = manager.submit(request("A", "1.0.0", &[])).unwrap();
    let b = manager.submit(request("B", "1.0.0", &[])).unwrap();

    gate.arrivals(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let states: Vec<_> = [a, b].iter().map(|id| manager.status(*id).unwrap().state).collect();
    assert!(states.contains(&JobState::Building));
    assert!(states.contains(&JobState::Pending));

    gate.release(1);
    gate.arrivals(1).await;
    gate.release(1);
    assert!(wait_all(&manager, &[a, b]).await.iter().all(JobView::succeeded));
}

#[tokio::test]
async fn test_panicking_toolchain_rolls_back() {
    let manager = manager_with(
        fast_config(),
        ScriptedSource::new(),
        ScriptedToolchain::new().panicking("A", Stage::Build, "linker crashed"),
    );
    let job_id = manager.submit(request("A", "1.0.0", &[])).unwrap();
    let view = tokio::time::timeout(Duration::from_secs(5), manager.wait(job_id))
        .await
        .expect("job settles after a panic")
        .unwrap();

    assert_eq!(view.state, JobState::RolledBack);
    let reason = view.detail.unwrap();
    assert_eq!(reason.kind, ErrorKind::Interrupted);
    assert_eq!(reason.message, "panicked during Building: linker crashed");
    assert_eq!(
        path_of(&manager, job_id).split_off(6),
        vec![JobState::Building, JobState::Failed, JobState::RolledBack]
    );
    assert!(manager.audit().open_jobs().is_empty());
    assert!(manager.list().is_empty());

    // the manager keeps serving other jobs
    assert!(!manager.is_halted());
    assert!(inject(&manager, "B", "1.0.0", &[]).await.succeeded());
}

#[tokio::test]
async fn test_racing_independent_commits_keep_manager_running() {
    let gate = Gate::new();
    let manager = manager_with(
        fast_config().with_max_concurrent_jobs(8).with_commit_retries(8),
        ScriptedSource::new(),
        ScriptedToolchain::new().gated(Stage::Test, Arc::clone(&gate)),
    );

    let ids: Vec<_> = (0..8)
        .map(|i| manager.submit(request(&format!("svc{i}"), "1.0.0", &[])).unwrap())
        .collect();
    gate.arrivals(8).await;
    gate.release(8);

    let views = wait_all(&manager, &ids).await;
    assert!(views.iter().all(JobView::succeeded));
    assert!(!manager.is_halted());
    assert_eq!(manager.registry().version(), 8);

    let mut versions: Vec<_> = views
        .iter()
        .map(|v| manager.query(&v.registry_entry.as_ref().unwrap().name).unwrap().commit_version())
        .collect();
    versions.sort_unstable();
    assert_eq!(versions, (1..=8).collect::<Vec<u64>>());
    assert!(inject(&manager, "late", "1.0.0", &[]).await.succeeded());
}

#[tokio::test]
async fn test_finished_jobs_are_served_from_the_audit_trail() {
    let manager = manager_with(
        fast_config(),
        ScriptedSource::new(),
        ScriptedToolchain::new().failing("B", Stage::Build, "undefined reference to `main`"),
    );
    let active = inject(&manager, "A", "1.0.0", &[]).await;
    let failed = inject(&manager, "B", "1.0.0", &[]).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while !manager.jobs().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("finished jobs leave memory");

    assert_eq!(manager.status(active.job_id).unwrap(), active);
    assert_eq!(manager.status(failed.job_id).unwrap(), failed);
    assert_eq!(manager.wait(failed.job_id).await.unwrap(), failed);
    assert!(matches!(
        manager.cancel(active.job_id),
        Err(ManagerError::CancelRejected { state: JobState::Active, .. })
    ));
}

#[tokio::test]
async fn test_audit_failure_blocks_the_transition() {
    let audit = AuditLog::open(Box::new(FailingAuditStore::after(3))).unwrap();
    let manager = InjectionManager::from_parts(
        fast_config(),
        collaborators(Arc::new(ScriptedSource::new()), Arc::new(ScriptedToolchain::new())),
        ServiceRegistry::new(),
        audit,
    )
    .unwrap();

    let view = inject(&manager, "A", "1.0.0", &[]).await;
    assert_eq!(view.state, JobState::RolledBack);
    assert_eq!(failure_kind(&view), ErrorKind::AuditUnavailable);
    assert!(manager.list().is_empty());
    // Pending, Validating and Downloading were recorded; nothing after
    assert_eq!(manager.audit().len(), 3);
}

#[tokio::test]
async fn test_revert_restores_previous_version() {
    let manager = setup_manager();
    assert!(inject(&manager, "A", "1.0.0", &[]).await.succeeded());
    assert!(inject(&manager, "A", "1.1.0", &[]).await.succeeded());

    let job_id = manager.revert("A").unwrap();
    let view = manager.wait(job_id).await.unwrap();
    assert!(view.succeeded());
    assert_eq!(manager.query("A").unwrap().version().to_string(), "1.0.0");

    let retired: Vec<_> = manager
        .registry()
        .history("A")
        .iter()
        .map(|e| e.version().to_string())
        .collect();
    assert_eq!(retired, vec!["1.0.0", "1.1.0"]);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_at_submit() {
    let manager = setup_manager();
    let mut bad = request("A", "1.0.0", &[]);
    bad.language = "cobol".into();
    assert!(matches!(manager.submit(bad), Err(ManagerError::InvalidDescriptor(_))));

    let mut bad = request("A", "1.0", &[]);
    bad.name = "has space".into();
    assert!(matches!(manager.submit(bad), Err(ManagerError::InvalidDescriptor(_))));
    assert!(manager.jobs().is_empty());
}

#[tokio::test]
async fn test_export_projection_covers_every_transition() {
    let manager = setup_manager();
    let view = inject(&manager, "A", "1.0.0", &[]).await;

    let export = manager.audit().export();
    assert_eq!(export.len(), 10);
    assert!(export.iter().all(|e| e.job_id == view.job_id));
    assert_eq!(export[0].from_state, None);
    assert_eq!(export[9].to_state, JobState::Active);
    assert!(export.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_restart_recovers_state_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let toolchains = || ToolchainRegistry::uniform(Arc::new(ScriptedToolchain::new()));
    let collab = || {
        Collaborators::new(
            Arc::new(ScriptedSource::new()),
            Arc::new(ota_kernel::collaborators::DigestVerifier),
            toolchains(),
        )
    };

    let finished = {
        let manager = InjectionManager::open(fast_config(), collab(), dir.path()).unwrap();
        inject(&manager, "A", "1.0.0", &[]).await
    };

    // a job the previous process never finished
    let interrupted = JobId::new();
    {
        let audit = AuditLog::open(Box::new(JsonlAuditStore::in_dir(dir.path()))).unwrap();
        let service = ServiceRef::from(&descriptor_with_deps("B", "1.0.0", &[("A", "1.0.0")]));
        let mut from = None;
        for to in [JobState::Pending, JobState::Validating, JobState::Building] {
            audit
                .append(RecordDraft::transition(interrupted, service.clone(), from, to))
                .unwrap();
            from = Some(to);
        }
    }

    let manager = InjectionManager::open(fast_config(), collab(), dir.path()).unwrap();
    assert_eq!(manager.query("A").unwrap().version().to_string(), "1.0.0");
    assert!(manager.audit().open_jobs().is_empty());
    assert!(manager.audit().verify_integrity().is_ok());

    let restored = manager.status(finished.job_id).unwrap();
    assert_eq!(restored.state, JobState::Active);
    assert_eq!(restored.registry_entry, finished.registry_entry);

    let rolled_back = manager.status(interrupted).unwrap();
    assert_eq!(rolled_back.state, JobState::RolledBack);
    assert_eq!(failure_kind(&rolled_back), ErrorKind::Interrupted);
}

#[test]
fn test_memory_store_backed_manager_starts_clean() {
    let audit = AuditLog::open(Box::new(MemoryAuditStore::new())).unwrap();
    let manager = InjectionManager::from_parts(
        ManagerConfig::default(),
        collaborators(Arc::new(ScriptedSource::new()), Arc::new(ScriptedToolchain::new())),
        ServiceRegistry::new(),
        audit,
    )
    .unwrap();
    assert!(!manager.is_halted());
    assert!(manager.jobs().is_empty());
    assert!(manager.audit().is_empty());
}
