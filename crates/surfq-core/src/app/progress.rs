//! ProgressReporter - 外部ユニットからの進捗を Job に反映する

use std::sync::Arc;

use tracing::debug;

use crate::domain::{ExternalRef, JobId, ProgressUpdate};
use crate::ports::{JobStore, StoreError};

pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Record `progress` (clipped to 0..=100) and `step` for a RUNNING job.
    ///
    /// Updates from a reference that no longer backs the job, or for a job
    /// that already left RUNNING, are answered with `Stale` and dropped.
    pub async fn report(
        &self,
        job_id: JobId,
        reference: &ExternalRef,
        progress: i64,
        step: &str,
    ) -> Result<ProgressUpdate, StoreError> {
        let clipped = progress.clamp(0, 100) as u8;
        let update = self
            .store
            .update_progress(job_id, Some(reference), clipped, step)
            .await?;
        match update {
            ProgressUpdate::Applied => {
                debug!(job_id = %job_id, progress = clipped, step, "progress");
            }
            ProgressUpdate::Stale => {
                debug!(job_id = %job_id, reference = %reference, "stale progress update dropped");
            }
        }
        Ok(update)
    }
}
