//! ExternalWorker port - 外部処理ユニット（FreeSurfer コンテナなど）の起動と監視
//!
//! # 設計原則
//! - `start` は起動だけを行い、完了を待たない（監視は非同期タスク）
//! - 進捗と終了は `WorkerEvents` のコールバックで通知する
//! - `is_alive` は reconciler 用の非ブロッキングな生存確認

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ExternalRef, Job, JobId};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Launch(String),

    #[error("unknown external reference {0}")]
    UnknownReference(ExternalRef),

    /// A probe/kill/list command exited unsuccessfully.
    #[error("runtime command failed: {0}")]
    Command(String),

    #[error("worker i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal result reported by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Exit 0 and every expected output present.
    Succeeded { result_path: PathBuf },

    /// Non-zero exit, missing outputs, or abnormal termination.
    Failed { message: String },
}

/// Callbacks from a supervised external unit.
#[async_trait]
pub trait WorkerEvents: Send + Sync {
    async fn on_progress(&self, job_id: JobId, reference: &ExternalRef, progress: i64, step: &str);

    async fn on_exit(&self, job_id: JobId, reference: &ExternalRef, outcome: WorkerOutcome);
}

#[async_trait]
pub trait ExternalWorker: Send + Sync {
    /// Allocate the reference the job will run under. No side effects.
    fn prepare(&self, job: &Job) -> ExternalRef;

    /// Launch the external unit. Returns the reference it actually runs under.
    async fn start(
        &self,
        job: &Job,
        reference: &ExternalRef,
        events: Arc<dyn WorkerEvents>,
    ) -> Result<ExternalRef, WorkerError>;

    async fn is_alive(&self, reference: &ExternalRef) -> bool;

    /// Force the unit down.
    async fn terminate(&self, reference: &ExternalRef) -> Result<(), WorkerError>;

    /// Every unit the runtime currently knows about, owned by a job or not.
    async fn active_references(&self) -> Result<Vec<ExternalRef>, WorkerError>;
}
