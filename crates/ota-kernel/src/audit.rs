//! Append-only, hash-chained audit trail of job transitions
//!
//! Every record links to its predecessor through `prev_hash`, so an export
//! can be checked for tampering or truncation with
//! [`AuditLog::verify_integrity`]. The backing [`AuditStore`] is written
//! before the in-memory chain advances; a failed write leaves the chain
//! exactly as it was and is reported to the caller.

use crate::error::AuditError;
use crate::types::{JobId, JobState};
use chrono::{DateTime, SecondsFormat, Utc};
use ota_registry::ServiceDescriptor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Audit file name inside a state directory
pub const AUDIT_FILE: &str = "audit.jsonl";

const GENESIS: [u8; 32] = [0u8; 32];

/// The service a job is injecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub name: String,
    pub version: String,
    /// Hex content digest of the candidate descriptor
    pub digest: String,
}

impl From<&ServiceDescriptor> for ServiceRef {
    fn from(d: &ServiceDescriptor) -> Self {
        Self {
            name: d.name().to_string(),
            version: d.version().to_string(),
            digest: d.digest().to_string(),
        }
    }
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub seq: u64,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub from_state: Option<JobState>,
    pub to_state: JobState,
    pub detail: Option<String>,
    /// This record is the job's final entry
    pub closes_job: bool,
    pub service: ServiceRef,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditRecord {
    /// Stable export projection
    #[must_use]
    pub fn export(&self) -> AuditEntry {
        AuditEntry {
            job_id: self.job_id,
            timestamp: self.timestamp,
            from_state: self.from_state,
            to_state: self.to_state,
            detail: self.detail.clone(),
        }
    }

    fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.seq.to_le_bytes());
        hasher.update(self.job_id.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
        hasher.update([0]);
        hasher.update(self.from_state.map_or("", JobState::as_str).as_bytes());
        hasher.update([0]);
        hasher.update(self.to_state.as_str().as_bytes());
        hasher.update([0]);
        if let Some(detail) = &self.detail {
            hasher.update([1]);
            hasher.update(detail.as_bytes());
        }
        hasher.update([0, u8::from(self.closes_job)]);
        hasher.update(self.service.name.as_bytes());
        hasher.update([0]);
        hasher.update(self.service.version.as_bytes());
        hasher.update([0]);
        hasher.update(self.service.digest.as_bytes());
        hasher.update([0]);
        hasher.update(self.prev_hash.as_bytes());
        hasher.finalize().into()
    }
}

/// `{ jobId, timestamp, fromState, toState, detail }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub from_state: Option<JobState>,
    pub to_state: JobState,
    pub detail: Option<String>,
}

/// A transition about to be recorded
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub job_id: JobId,
    pub service: ServiceRef,
    pub from_state: Option<JobState>,
    pub to_state: JobState,
    pub detail: Option<String>,
    pub closes_job: bool,
}

impl RecordDraft {
    /// A state change; closes the job iff `to` is terminal
    #[must_use]
    pub fn transition(job_id: JobId, service: ServiceRef, from: Option<JobState>, to: JobState) -> Self {
        Self {
            job_id,
            service,
            from_state: from,
            to_state: to,
            detail: None,
            closes_job: to.is_terminal(),
        }
    }

    /// Attach a human-readable detail
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Mark as the job's final record
    #[must_use]
    pub fn closing(mut self) -> Self {
        self.closes_job = true;
        self
    }
}

/// Durable backing for the audit trail
pub trait AuditStore: Send + Sync {
    /// Persist one record; must not return `Ok` unless it is stored
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// Every stored record, in append order
    fn load(&self) -> Result<Vec<AuditRecord>, AuditError>;
}

/// Volatile store for tests and one-shot runs
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self.records.lock().clone())
    }
}

/// One JSON record per line, opened in append mode and synced per write
///
/// A failed append is truncated back to the last complete line. If that
/// truncation fails too, the store refuses further appends.
#[derive(Debug)]
pub struct JsonlAuditStore {
    path: PathBuf,
    file: Mutex<Option<File>>,
    torn: AtomicBool,
}

impl JsonlAuditStore {
    /// Store at an explicit path
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
            torn: AtomicBool::new(false),
        }
    }

    /// Store at `<dir>/audit.jsonl`
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(AUDIT_FILE))
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

impl AuditStore for JsonlAuditStore {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record).map_err(|e| AuditError::Unavailable(e.to_string()))?;
        line.push(b'\n');

        let mut guard = self.file.lock();
        if self.torn.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable(format!(
                "{} ends in a partial record",
                self.path.display()
            )));
        }
        if guard.is_none() {
            *guard = Some(self.open().map_err(|e| unavailable(&self.path, &e))?);
        }
        let Some(file) = guard.as_mut() else {
            return Err(AuditError::Unavailable(format!("{} not open", self.path.display())));
        };

        append_line(file, &line).map_err(|failure| {
            if failure.torn {
                tracing::error!(path = %self.path.display(), "partial audit record could not be removed");
                self.torn.store(true, Ordering::SeqCst);
            }
            // reopen on the next append
            *guard = None;
            unavailable(&self.path, &failure.error)
        })
    }

    fn load(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable(&self.path, &e)),
        };

        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| unavailable(&self.path, &e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| AuditError::Corrupt {
                line: idx + 1,
                reason: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Append-only file that can be cut back to a known length
trait LogFile: io::Write {
    fn end(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn end(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

struct AppendFailure {
    error: io::Error,
    /// Partial bytes may remain after the last complete line
    torn: bool,
}

fn append_line(file: &mut impl LogFile, line: &[u8]) -> Result<(), AppendFailure> {
    let end = file.end().map_err(|error| AppendFailure { error, torn: false })?;
    let Err(error) = file.write_all(line).and_then(|()| file.sync()) else {
        return Ok(());
    };
    let torn = file.truncate(end).and_then(|()| file.sync()).is_err();
    Err(AppendFailure { error, torn })
}

fn unavailable(path: &Path, err: &io::Error) -> AuditError {
    AuditError::Unavailable(format!("{}: {err}", path.display()))
}

/// The audit trail
pub struct AuditLog {
    store: Box<dyn AuditStore>,
    records: Mutex<Vec<AuditRecord>>,
}

impl AuditLog {
    /// Open over `store`, loading and verifying what it already holds
    ///
    /// # Errors
    /// Fails if the store cannot be read or the stored chain is broken.
    pub fn open(store: Box<dyn AuditStore>) -> Result<Self, AuditError> {
        let records = store.load()?;
        verify_chain(&records)?;
        tracing::debug!(records = records.len(), "audit log loaded");
        Ok(Self {
            store,
            records: Mutex::new(records),
        })
    }

    /// Empty in-memory audit log
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryAuditStore::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Record a transition
    ///
    /// # Errors
    /// [`AuditError::Unavailable`] if the store rejected the write; the
    /// chain is unchanged in that case.
    pub fn append(&self, draft: RecordDraft) -> Result<AuditRecord, AuditError> {
        let mut records = self.records.lock();
        let (seq, prev_hash) = records
            .last()
            .map_or((0, hex::encode(GENESIS)), |last| (last.seq + 1, last.hash.clone()));

        let mut record = AuditRecord {
            seq,
            job_id: draft.job_id,
            timestamp: Utc::now(),
            from_state: draft.from_state,
            to_state: draft.to_state,
            detail: draft.detail,
            closes_job: draft.closes_job,
            service: draft.service,
            prev_hash,
            hash: String::new(),
        };
        record.hash = hex::encode(record.compute_hash());

        self.store.append(&record)?;
        records.push(record.clone());
        Ok(record)
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// No records yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Full records, in append order
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Stable export, in append order
    #[must_use]
    pub fn export(&self) -> Vec<AuditEntry> {
        self.records.lock().iter().map(AuditRecord::export).collect()
    }

    /// Records of one job, in append order
    #[must_use]
    pub fn history(&self, job_id: JobId) -> Vec<AuditRecord> {
        self.records.lock().iter().filter(|r| r.job_id == job_id).cloned().collect()
    }

    /// Re-check every hash and link
    ///
    /// # Errors
    /// [`AuditError::IntegrityViolation`] naming the first bad record.
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        verify_chain(&self.records.lock())
    }

    /// Last record of every job that has no closing record, in append order
    #[must_use]
    pub fn open_jobs(&self) -> Vec<AuditRecord> {
        let records = self.records.lock();
        let mut last: HashMap<JobId, &AuditRecord> = HashMap::new();
        for record in records.iter() {
            last.insert(record.job_id, record);
        }
        let mut open: Vec<_> = last.into_values().filter(|r| !r.closes_job).cloned().collect();
        open.sort_by_key(|r| r.seq);
        open
    }

    /// Text summary of the most recent `n` finished operations
    #[must_use]
    pub fn report(&self, n: usize) -> String {
        let records = self.records.lock();
        let closed: Vec<_> = records.iter().filter(|r| r.closes_job).collect();

        let mut out = String::new();
        let _ = writeln!(out, "OTA Operations Report");
        let _ = writeln!(out, "{}", "=".repeat(60));
        let _ = writeln!(out, "Total OTA Operations: {}", closed.len());
        let _ = writeln!(out, "Audit records: {}", records.len());
        let _ = writeln!(out);
        let _ = writeln!(out, "Recent Operations:");

        for record in closed.iter().skip(closed.len().saturating_sub(n)) {
            let outcome = match record.to_state {
                JobState::Active | JobState::RolledBack => record.to_state.as_str(),
                _ => "Active (no-op)",
            };
            let _ = writeln!(out);
            let _ = writeln!(out, "  [{}]", record.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true));
            let _ = writeln!(out, "  Job: {}", record.job_id);
            let _ = writeln!(out, "  Service: {}", record.service.name);
            let _ = writeln!(out, "  Version: {}", record.service.version);
            let _ = writeln!(out, "  Status: {outcome}");
            if let Some(detail) = &record.detail {
                let _ = writeln!(out, "  Detail: {detail}");
            }
            let _ = writeln!(out, "  {}", "-".repeat(58));
        }
        out
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("records", &self.len()).finish_non_exhaustive()
    }
}

fn verify_chain(records: &[AuditRecord]) -> Result<(), AuditError> {
    let mut prev = hex::encode(GENESIS);
    for (expected_seq, record) in (0u64..).zip(records) {
        let intact = record.seq == expected_seq
            && record.prev_hash == prev
            && record.hash == hex::encode(record.compute_hash());
        if !intact {
            return Err(AuditError::IntegrityViolation { seq: record.seq });
        }
        prev.clone_from(&record.hash);
    }
    Ok(())
}
