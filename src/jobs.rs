//! The job table: per-document processing state, failure history and audit log.
//!
//! Jobs are the only mutable state shared between concurrent pipelines. All
//! changes go through [`JobStore::transition`], which reads a snapshot, applies
//! a pure update function, and compare-and-sets the result against the
//! snapshot's version. If someone else got there first, we re-read and
//! re-apply.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use schemars::JsonSchema;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    decision::Action,
    prelude::*,
    preprocess::PreprocessPreset,
    recovery::classify::{FailureType, RecoveryStrategy},
    retry::{IsKnownTransient, retry_result_ok, try_fatal, try_potentially_transient},
};

/// Where a job is in its lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Registered, not yet attempted.
    Queued,
    /// An attempt is in flight.
    Processing,
    Completed,
    RetryScheduled,
    RetryWithDifferentEngine,
    RetryWithPreprocessing,
    /// Accepted with missing fields; needs human follow-up.
    PartialSuccess,
    ManualReviewRequired,
    /// Stopped by an operator.
    ProcessingAborted,
    /// Rejected by the decision engine or a reviewer.
    Rejected,
}

impl JobStatus {
    /// Nothing happens to a job in a final state.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::ProcessingAborted
                | JobStatus::Rejected
        )
    }

    /// Is this job waiting for a human?
    pub fn awaits_review(self) -> bool {
        matches!(
            self,
            JobStatus::ManualReviewRequired | JobStatus::PartialSuccess
        )
    }

    /// Is this a retry state?
    pub fn is_retry(self) -> bool {
        matches!(
            self,
            JobStatus::RetryScheduled
                | JobStatus::RetryWithDifferentEngine
                | JobStatus::RetryWithPreprocessing
        )
    }

    /// Is `next` a legal successor of `self`?
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_final() {
            return false;
        }
        match (self, next) {
            // Only one attempt at a time.
            (Processing, Processing) => false,
            (_, ProcessingAborted) => true,
            (Queued, Processing) => true,
            (Processing, _) => true,
            (s, Processing | ManualReviewRequired) if s.is_retry() => true,
            (s, next) if s.awaits_review() => {
                next == s || matches!(next, Completed | Rejected)
            }
            (s, next) => s == next,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::RetryScheduled => "retry_scheduled",
            JobStatus::RetryWithDifferentEngine => "retry_with_different_engine",
            JobStatus::RetryWithPreprocessing => "retry_with_preprocessing",
            JobStatus::PartialSuccess => "partial_success",
            JobStatus::ManualReviewRequired => "manual_review_required",
            JobStatus::ProcessingAborted => "processing_aborted",
            JobStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One document's processing state.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ProcessingJob {
    pub id: String,

    /// Where the document lives.
    pub content_ref: PathBuf,

    pub mime_type: String,

    pub status: JobStatus,

    /// Bumped on every committed change.
    pub version: u64,

    /// Retries taken within per-type budgets.
    pub retry_count: usize,

    /// Times we moved to another engine.
    #[serde(default)]
    pub engine_switches: usize,

    /// The engine the next attempt is restricted to. `None` means all.
    #[serde(default)]
    pub preferred_engine: Option<String>,

    /// The preset the next attempt is preprocessed with.
    #[serde(default)]
    pub preprocessing: Option<PreprocessPreset>,

    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub manual_review_reason: Option<String>,

    /// When the job entered the review queue.
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,

    /// Reviewer who claimed the job.
    #[serde(default)]
    pub assigned_to: Option<String>,

    /// Ensemble confidence of the latest attempt.
    #[serde(default)]
    pub confidence: Option<f64>,

    /// Latest decision.
    #[serde(default)]
    pub action: Option<Action>,

    /// Field values from the latest attempt.
    #[serde(default)]
    pub extracted_data: Option<Value>,

    /// Reviewer corrections.
    #[serde(default)]
    pub corrected_data: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    /// A fresh job.
    pub fn new(id: String, content_ref: PathBuf, mime_type: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            content_ref,
            mime_type,
            status: JobStatus::Queued,
            version: 0,
            retry_count: 0,
            engine_switches: 0,
            preferred_engine: None,
            preprocessing: None,
            next_retry_at: None,
            manual_review_reason: None,
            queued_at: None,
            assigned_to: None,
            confidence: None,
            action: None,
            extracted_data: None,
            corrected_data: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// File name of the document, for reviewers.
    pub fn filename(&self) -> Option<String> {
        self.content_ref
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// A copy moved to `status`.
    pub fn with_status(&self, status: JobStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// One failed attempt.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct FailureRecord {
    pub failure_type: FailureType,

    /// Type label of the original error.
    pub error_type: String,

    pub message: String,

    pub strategy: RecoveryStrategy,

    /// `retry_count` when this failure happened.
    pub retry_count: usize,

    /// Failures so far, including this one.
    pub total_failures: usize,

    pub at: DateTime<Utc>,
}

/// Something a person or the pipeline did to a job.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub job_id: String,
    pub actor: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(job_id: &str, actor: &str, action: &str, detail: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.to_owned(),
            actor: actor.to_owned(),
            action: action.to_owned(),
            detail,
            at: Utc::now(),
        }
    }
}

/// Why a transition didn't happen.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("no job with id {0:?}")]
    NotFound(String),

    /// Someone else updated the job first.
    #[error("job {job_id:?} changed concurrently (expected version {expected}, found {found})")]
    Conflict {
        job_id: String,
        expected: u64,
        found: u64,
    },

    #[error("job {job_id:?} cannot go from {from} to {to}")]
    Illegal {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// The update function refused.
    #[error("{0}")]
    Rejected(String),
}

impl IsKnownTransient for TransitionError {
    fn is_known_transient(&self) -> bool {
        matches!(self, TransitionError::Conflict { .. })
    }
}

/// Serializable contents of a [`JobStore`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct StoreState {
    jobs: BTreeMap<String, ProcessingJob>,
    #[serde(default)]
    failures: BTreeMap<String, Vec<FailureRecord>>,
    #[serde(default)]
    audit: Vec<AuditEntry>,
}

/// All jobs, with their failure and audit logs.
#[derive(Debug, Default)]
pub struct JobStore {
    state: Mutex<StoreState>,
}

impl JobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Load a snapshot written by [`JobStore::save`]. A missing file is an
    /// empty store.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Arc<Self>> {
        if !tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("cannot check for {}", path.display()))?
        {
            debug!("No job state yet; starting empty");
            return Ok(Self::new());
        }
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read job state from {}", path.display()))?;
        let state = serde_json::from_slice::<StoreState>(&data)
            .with_context(|| format!("cannot parse job state in {}", path.display()))?;
        Ok(Arc::new(Self {
            state: Mutex::new(state),
        }))
    }

    /// Write a snapshot of the whole store.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = {
            let state = self.state.lock().expect("lock poisoned");
            serde_json::to_vec_pretty(&*state).context("cannot serialize job state")?
        };
        // Write next to the target and rename, so readers never see half a file.
        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("cannot create temporary file in {}", dir.display()))?;
        tokio::fs::write(tmp.path(), &data)
            .await
            .with_context(|| format!("cannot write {}", tmp.path().display()))?;
        tmp.persist(path)
            .with_context(|| format!("cannot replace {}", path.display()))?;
        Ok(())
    }

    /// Add a job, or return the existing one with the same id.
    pub fn register(&self, job: ProcessingJob) -> ProcessingJob {
        let mut state = self.state.lock().expect("lock poisoned");
        state.jobs.entry(job.id.clone()).or_insert(job).clone()
    }

    pub fn get(&self, job_id: &str) -> Option<ProcessingJob> {
        self.state
            .lock()
            .expect("lock poisoned")
            .jobs
            .get(job_id)
            .cloned()
    }

    /// Every job, ordered by id.
    pub fn jobs(&self) -> Vec<ProcessingJob> {
        self.state
            .lock()
            .expect("lock poisoned")
            .jobs
            .values()
            .cloned()
            .collect()
    }

    /// Replace a job if it is still at `expected_version`.
    pub fn compare_and_set(
        &self,
        expected_version: u64,
        mut next: ProcessingJob,
    ) -> Result<ProcessingJob, TransitionError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let current = state
            .jobs
            .get_mut(&next.id)
            .ok_or_else(|| TransitionError::NotFound(next.id.clone()))?;
        if current.version != expected_version {
            return Err(TransitionError::Conflict {
                job_id: next.id.clone(),
                expected: expected_version,
                found: current.version,
            });
        }
        next.version = expected_version + 1;
        next.updated_at = Utc::now();
        *current = next.clone();
        Ok(next)
    }

    /// Apply `update` to the latest version of a job.
    ///
    /// `update` may run more than once if we race with another writer, so it
    /// must be a pure function of the snapshot it is given.
    #[instrument(level = "debug", skip_all, fields(job_id = %job_id))]
    pub async fn transition<F>(
        &self,
        job_id: &str,
        update: F,
    ) -> Result<ProcessingJob, TransitionError>
    where
        F: Fn(&ProcessingJob) -> Result<ProcessingJob, TransitionError>,
    {
        // If we lose a race with another writer, back off exponentially.
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=50,
            re_attempts: 5,
            jitter_ratio: 0.2,
        };
        let result = self
            .try_transition(job_id, &update)
            .await
            .retry_with_async(|_| async { self.try_transition(job_id, &update).await })
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_fatal(|_, fatal_error| debug!("transition refused: {fatal_error}"))
            .inspect_recovered(|_, _, retry_errors_list| {
                debug!(
                    "committed after {} conflicting writes: [{}]",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                warn!(
                    "giving up after {} conflicting writes: {fatal_error}",
                    retry_errors_list.len()
                )
            });
        match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                Ok(output)
            }
            ResolvedResult::Fatal { error, .. } => Err(error),
            ResolvedResult::GivenUp { fatal_error, .. }
            | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
        }
    }

    async fn try_transition<F>(
        &self,
        job_id: &str,
        update: &F,
    ) -> RetryResult<(), (), ProcessingJob, TransitionError>
    where
        F: Fn(&ProcessingJob) -> Result<ProcessingJob, TransitionError>,
    {
        let snapshot = try_fatal!(
            self.get(job_id)
                .ok_or_else(|| TransitionError::NotFound(job_id.to_owned()))
        );
        let next = try_fatal!(update(&snapshot));
        if !snapshot.status.can_transition_to(next.status) {
            return RetryResult::Fatal {
                input: (),
                error: TransitionError::Illegal {
                    job_id: job_id.to_owned(),
                    from: snapshot.status,
                    to: next.status,
                },
            };
        }
        let committed = try_potentially_transient!(self.compare_and_set(snapshot.version, next));
        if committed.status != snapshot.status {
            debug!(from = %snapshot.status, to = %committed.status, "Job status changed");
        }
        retry_result_ok(committed)
    }

    /// Append to a job's failure log.
    pub fn record_failure(&self, job_id: &str, record: FailureRecord) {
        let mut state = self.state.lock().expect("lock poisoned");
        state
            .failures
            .entry(job_id.to_owned())
            .or_default()
            .push(record);
    }

    /// A job's failure log, oldest first.
    pub fn failures(&self, job_id: &str) -> Vec<FailureRecord> {
        self.state
            .lock()
            .expect("lock poisoned")
            .failures
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Append to the audit log.
    pub fn audit(&self, entry: AuditEntry) {
        info!(
            job_id = %entry.job_id,
            actor = %entry.actor,
            action = %entry.action,
            "Audit"
        );
        self.state.lock().expect("lock poisoned").audit.push(entry);
    }

    /// Audit entries for one job, oldest first.
    pub fn audit_log(&self, job_id: &str) -> Vec<AuditEntry> {
        self.state
            .lock()
            .expect("lock poisoned")
            .audit
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect()
    }
}
