//! JobStore port - ジョブ状態の正本（source of truth）
//!
//! JobStore は以下を管理します：
//! - ジョブの状態（JobStatus）と付随フィールド
//! - Tracked Anomaly テーブル（reaper が使う）
//!
//! # 設計原則
//! - 状態変更は `transition` の compare-and-swap だけを通す
//! - 期待した状態でなければ `StoreError::Conflict` で拒否する（黙って無視しない）
//! - どのコンポーネントも「自分だけが書き手」とは仮定しない

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AnomalyKind, AnomalySubject, ExternalRef, Job, JobFilter, JobId, JobStatus, ProgressUpdate,
    QueueCounts, TrackedAnomaly, Transition,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("queue full: {pending} pending jobs (limit {limit})")]
    QueueFull { pending: usize, limit: usize },

    #[error("anomaly {0} not tracked")]
    AnomalyNotFound(AnomalySubject),

    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Lost a compare-and-swap race; callers are expected to no-op.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a PENDING job unless `max_pending` PENDING jobs already exist.
    async fn submit(&self, job: Job, max_pending: usize) -> Result<JobId, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Matching jobs, oldest first (`created_at`, then id).
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Atomically move `id` from `from` to `change.target()`.
    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Replace the reference of a RUNNING job.
    async fn attach_reference(&self, id: JobId, reference: ExternalRef) -> Result<Job, StoreError>;

    /// Conditional on RUNNING and, when the job has one, on `reference` matching.
    async fn update_progress(
        &self,
        id: JobId,
        reference: Option<&ExternalRef>,
        progress: u8,
        step: &str,
    ) -> Result<ProgressUpdate, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;

    /// Insert the anomaly, or refresh `last_seen_at` if already tracked.
    async fn track_anomaly(
        &self,
        subject: AnomalySubject,
        kind: AnomalyKind,
        now: DateTime<Utc>,
    ) -> Result<TrackedAnomaly, StoreError>;

    async fn anomalies(&self) -> Result<Vec<TrackedAnomaly>, StoreError>;

    async fn mark_awaiting_approval(&self, subject: &AnomalySubject) -> Result<(), StoreError>;

    async fn approve_anomaly(&self, subject: &AnomalySubject) -> Result<(), StoreError>;

    /// Returns whether the anomaly existed.
    async fn remove_anomaly(&self, subject: &AnomalySubject) -> Result<bool, StoreError>;
}
