//! FileJobStore - JSON スナップショットによる永続ストア
//!
//! # 設計
//! - 操作ごとに「ロック → 読み込み → 変更 → 書き込み」を行う
//! - ロックは `<state>.lock` への `flock(LOCK_EX)`（fs2）で、別プロセスの
//!   オーケストレータや CLI とも排他される
//! - 書き込みは一時ファイル + rename なので、クラッシュしても壊れたファイルは残らない
//!
//! 再起動後のインスタンスも同じファイルを読むので、起動時の reconcile が
//! 前回 RUNNING だったジョブを必ず観測できる。

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::store_state::{Snapshot, StoreState};
use crate::domain::{
    AnomalyKind, AnomalySubject, ExternalRef, Job, JobFilter, JobId, JobStatus, ProgressUpdate,
    QueueCounts, TrackedAnomaly, Transition,
};
use crate::ports::{JobStore, StoreError};

pub struct FileJobStore {
    path: PathBuf,
    lock_path: PathBuf,
    /// Serializes operations within this process before taking the file lock.
    local: Mutex<()>,
}

impl FileJobStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        let store = Self {
            lock_path: PathBuf::from(lock_name),
            path,
            local: Mutex::new(()),
        };
        // Fail fast on an unreadable or corrupt state file.
        store.with_state(|_| Ok(((), false))).await?;
        debug!(path = %store.path.display(), "opened file job store");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the current on-disk state under the exclusive lock,
    /// writing the state back when `f` reports it dirty.
    async fn with_state<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<(R, bool), StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let _local = self.local.lock().await;
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || {
            let lock_file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;
            fs2::FileExt::lock_exclusive(&lock_file)?;

            let mut state = read_state(&path)?;
            let (result, dirty) = f(&mut state)?;
            if dirty {
                write_state(&path, &state)?;
            }
            // The lock is released when `lock_file` is dropped.
            Ok(result)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

fn read_state(path: &Path) -> Result<StoreState, StoreError> {
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(StoreState::default()),
        Ok(bytes) => {
            let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
            Ok(StoreState::from_snapshot(snapshot))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreState::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_state(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(&state.snapshot())?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn submit(&self, job: Job, max_pending: usize) -> Result<JobId, StoreError> {
        self.with_state(move |state| Ok((state.submit(job, max_pending)?, true)))
            .await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.with_state(move |state| Ok((state.get(id), false))).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let filter = filter.clone();
        self.with_state(move |state| Ok((state.list(&filter), false)))
            .await
    }

    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.with_state(move |state| Ok((state.transition(id, from, change, now)?, true)))
            .await
    }

    async fn attach_reference(&self, id: JobId, reference: ExternalRef) -> Result<Job, StoreError> {
        self.with_state(move |state| Ok((state.attach_reference(id, reference)?, true)))
            .await
    }

    async fn update_progress(
        &self,
        id: JobId,
        reference: Option<&ExternalRef>,
        progress: u8,
        step: &str,
    ) -> Result<ProgressUpdate, StoreError> {
        let reference = reference.cloned();
        let step = step.to_string();
        self.with_state(move |state| {
            state.update_progress(id, reference.as_ref(), progress, &step)
        })
        .await
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.with_state(|state| Ok((state.counts(), false))).await
    }

    async fn track_anomaly(
        &self,
        subject: AnomalySubject,
        kind: AnomalyKind,
        now: DateTime<Utc>,
    ) -> Result<TrackedAnomaly, StoreError> {
        self.with_state(move |state| Ok((state.track_anomaly(subject, kind, now), true)))
            .await
    }

    async fn anomalies(&self) -> Result<Vec<TrackedAnomaly>, StoreError> {
        self.with_state(|state| Ok((state.anomalies(), false))).await
    }

    async fn mark_awaiting_approval(&self, subject: &AnomalySubject) -> Result<(), StoreError> {
        let subject = subject.clone();
        self.with_state(move |state| Ok((state.mark_awaiting_approval(&subject)?, true)))
            .await
    }

    async fn approve_anomaly(&self, subject: &AnomalySubject) -> Result<(), StoreError> {
        let subject = subject.clone();
        self.with_state(move |state| Ok((state.approve_anomaly(&subject)?, true)))
            .await
    }

    async fn remove_anomaly(&self, subject: &AnomalySubject) -> Result<bool, StoreError> {
        let subject = subject.clone();
        self.with_state(move |state| {
            let removed = state.remove_anomaly(&subject);
            Ok((removed, removed))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Failure, JobInput};
    use ulid::Ulid;

    fn pending_job() -> Job {
        Job::new_pending(
            JobId::from_ulid(Ulid::new()),
            JobInput::new("/in/T1.nii.gz").with_metadata(serde_json::json!({"patient": "P-001"})),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("jobs.json");

        let id = {
            let store = FileJobStore::open(&path).await.unwrap();
            let id = store.submit(pending_job(), 10).await.unwrap();
            store
                .transition(
                    id,
                    JobStatus::Pending,
                    Transition::Start {
                        reference: ExternalRef::new("surfq-a"),
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
            store
                .track_anomaly(
                    AnomalySubject::Job(id),
                    AnomalyKind::StuckJob,
                    Utc::now(),
                )
                .await
                .unwrap();
            id
        };

        let reopened = FileJobStore::open(&path).await.unwrap();
        let job = reopened.get(id).await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.external_reference, Some(ExternalRef::new("surfq-a")));
        assert_eq!(job.input.metadata["patient"], "P-001");
        assert_eq!(reopened.anomalies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn two_handles_see_each_others_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let a = FileJobStore::open(&path).await.unwrap();
        let b = FileJobStore::open(&path).await.unwrap();

        let id = a.submit(pending_job(), 10).await.unwrap();
        b.transition(
            id,
            JobStatus::Pending,
            Transition::Fail(Failure::operator("duplicate upload")),
            Utc::now(),
        )
        .await
        .unwrap();

        let job = a.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(a.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn rejected_mutation_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let store = FileJobStore::open(&path).await.unwrap();
        store.submit(pending_job(), 1).await.unwrap();

        let err = store.submit(pending_job(), 1).await.unwrap_err();

        assert!(matches!(err, StoreError::QueueFull { .. }));
        assert_eq!(store.list(&JobFilter::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = FileJobStore::open(&path).await.err().unwrap();
        assert!(matches!(err, StoreError::Serde(_)));
    }
}
