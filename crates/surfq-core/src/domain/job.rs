//! Job record and status management.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{Failure, FailureKind};
use super::ids::{ExternalRef, JobId};
use super::state::JobStatus;

/// What the ingestion service hands over: a validated input artifact and
/// free-form patient metadata. Not re-validated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub input_path: PathBuf,

    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl JobInput {
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Job record.
///
/// Design:
/// - The store holds the single source of truth.
/// - State transitions go through `apply` (called by the store after the
///   compare-and-swap check), never through direct field writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub input: JobInput,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// 0..=100, never decreases while RUNNING.
    pub progress: u8,
    pub current_step: Option<String>,

    /// Present iff status is FAILED.
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,

    /// Present iff status is RUNNING.
    pub external_reference: Option<ExternalRef>,

    /// Present only when COMPLETED.
    pub result_path: Option<PathBuf>,

    /// The FAILED job this one was resubmitted from.
    #[serde(default)]
    pub requeued_from: Option<JobId>,
}

/// A status change together with exactly the fields valid for its target.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start { reference: ExternalRef },
    Complete { result_path: PathBuf },
    Fail(Failure),
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Start { .. } => JobStatus::Running,
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Fail(_) => JobStatus::Failed,
        }
    }
}

impl Job {
    pub fn new_pending(id: JobId, input: JobInput, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            input,
            created_at: now,
            started_at: None,
            completed_at: None,
            progress: 0,
            current_step: None,
            error_message: None,
            failure_kind: None,
            external_reference: None,
            result_path: None,
            requeued_from: None,
        }
    }

    /// Apply an already-validated transition, setting the timestamps and
    /// fields appropriate to the new status.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) {
        self.status = transition.target();
        match transition {
            Transition::Start { reference } => {
                self.started_at = Some(now);
                self.external_reference = Some(reference);
                self.current_step = Some("starting".to_string());
            }
            Transition::Complete { result_path } => {
                self.completed_at = Some(now);
                self.external_reference = None;
                self.result_path = Some(result_path);
                self.progress = 100;
                self.current_step = Some("completed".to_string());
            }
            Transition::Fail(failure) => {
                self.completed_at = Some(now);
                self.external_reference = None;
                self.result_path = None;
                self.error_message = Some(failure.message);
                self.failure_kind = Some(failure.kind);
            }
        }
    }

    /// Record a progress update. Returns false when nothing changed.
    pub fn record_progress(&mut self, progress: u8, step: &str) -> bool {
        let progress = progress.min(100).max(self.progress);
        let changed = progress != self.progress || self.current_step.as_deref() != Some(step);
        self.progress = progress;
        self.current_step = Some(step.to_string());
        changed
    }

    /// FIFO admission key: oldest first, ties broken by id.
    pub fn queue_key(&self) -> (DateTime<Utc>, JobId) {
        (self.created_at, self.id)
    }

    pub fn view(&self) -> JobView {
        JobView::from(self)
    }
}

/// Result of a conditional progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    Applied,

    /// The job is no longer RUNNING or is backed by another reference.
    Stale,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    /// Empty means every status.
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            statuses: vec![status],
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&job.status)
    }
}

/// Job status for API responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: Option<String>,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub result_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress: job.progress,
            current_step: job.current_step.clone(),
            error_message: job.error_message.clone(),
            failure_kind: job.failure_kind,
            result_path: job.result_path.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}
