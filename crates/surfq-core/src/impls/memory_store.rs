//! In-memory job store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::store_state::StoreState;
use crate::domain::{
    AnomalyKind, AnomalySubject, ExternalRef, Job, JobFilter, JobId, JobStatus, ProgressUpdate,
    QueueCounts, TrackedAnomaly, Transition,
};
use crate::ports::{JobStore, StoreError};

/// In-memory job store. State is lost with the process; use `FileJobStore`
/// when jobs must survive a restart.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as-is (for tests that need corrupted records).
    #[cfg(test)]
    pub(crate) async fn insert_raw(&self, job: Job) {
        self.state.lock().await.insert_raw(job);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn submit(&self, job: Job, max_pending: usize) -> Result<JobId, StoreError> {
        self.state.lock().await.submit(job, max_pending)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().await.get(id))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(self.state.lock().await.list(filter))
    }

    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.state.lock().await.transition(id, from, change, now)
    }

    async fn attach_reference(&self, id: JobId, reference: ExternalRef) -> Result<Job, StoreError> {
        self.state.lock().await.attach_reference(id, reference)
    }

    async fn update_progress(
        &self,
        id: JobId,
        reference: Option<&ExternalRef>,
        progress: u8,
        step: &str,
    ) -> Result<ProgressUpdate, StoreError> {
        let (update, _) = self
            .state
            .lock()
            .await
            .update_progress(id, reference, progress, step)?;
        Ok(update)
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        Ok(self.state.lock().await.counts())
    }

    async fn track_anomaly(
        &self,
        subject: AnomalySubject,
        kind: AnomalyKind,
        now: DateTime<Utc>,
    ) -> Result<TrackedAnomaly, StoreError> {
        Ok(self.state.lock().await.track_anomaly(subject, kind, now))
    }

    async fn anomalies(&self) -> Result<Vec<TrackedAnomaly>, StoreError> {
        Ok(self.state.lock().await.anomalies())
    }

    async fn mark_awaiting_approval(&self, subject: &AnomalySubject) -> Result<(), StoreError> {
        self.state.lock().await.mark_awaiting_approval(subject)
    }

    async fn approve_anomaly(&self, subject: &AnomalySubject) -> Result<(), StoreError> {
        self.state.lock().await.approve_anomaly(subject)
    }

    async fn remove_anomaly(&self, subject: &AnomalySubject) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.remove_anomaly(subject))
    }
}
