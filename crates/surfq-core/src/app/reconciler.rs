//! StateReconciler - 記録上 RUNNING のジョブと実際のプロセスを突き合わせる
//!
//! # 判定
//! - reference なし → 即 orphan（interrupted）
//! - `is_alive(reference)` が true → 何もしない
//! - それ以外 → RUNNING → FAILED（interrupted: external process not found）
//!
//! 完了コールバックと競合して CAS に負けた場合は skipped として数えるだけ。

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::admission::AdmissionController;
use crate::domain::{Failure, JobFilter, JobId, JobStatus, Transition};
use crate::error::OrchestratorError;
use crate::ports::{Clock, ExternalWorker, JobStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// First pass after (re)start; nothing is supervised in memory yet.
    Startup,
    Periodic,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// RUNNING jobs inspected.
    pub checked: usize,
    pub alive: usize,

    /// Jobs moved to FAILED by this pass.
    pub interrupted: Vec<JobId>,

    /// Jobs that changed state concurrently (a callback won the race).
    pub skipped: usize,

    /// Jobs admitted after the pass.
    pub admitted: Vec<JobId>,
}

pub struct StateReconciler {
    store: Arc<dyn JobStore>,
    worker: Arc<dyn ExternalWorker>,
    clock: Arc<dyn Clock>,
    admission: Arc<AdmissionController>,
}

impl StateReconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        worker: Arc<dyn ExternalWorker>,
        clock: Arc<dyn Clock>,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            store,
            worker,
            clock,
            admission,
        }
    }

    pub async fn run_pass(&self, mode: ReconcileMode) -> Result<ReconcileReport, OrchestratorError> {
        let mut report = ReconcileReport::default();
        {
            let _paused = self.admission.exclusive().await;
            let running = self
                .store
                .list(&JobFilter::status(JobStatus::Running))
                .await?;

            for job in running {
                report.checked += 1;
                let failure = match &job.external_reference {
                    None => Failure::no_reference(),
                    Some(reference) if self.worker.is_alive(reference).await => {
                        report.alive += 1;
                        continue;
                    }
                    Some(_) => Failure::process_not_found(),
                };

                let message = failure.message.clone();
                match self
                    .store
                    .transition(
                        job.id,
                        JobStatus::Running,
                        Transition::Fail(failure),
                        self.clock.now(),
                    )
                    .await
                {
                    Ok(_) => {
                        warn!(
                            job_id = %job.id,
                            reference = ?job.external_reference.as_ref().map(|r| r.to_string()),
                            ?mode,
                            %message,
                            "orphaned job marked failed"
                        );
                        report.interrupted.push(job.id);
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(job_id = %job.id, error = %e, "job changed state during reconcile");
                        report.skipped += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        // Also picks up jobs submitted by processes that do not launch.
        report.admitted = self.admission.try_admit_next().await?;

        match mode {
            ReconcileMode::Startup => info!(
                checked = report.checked,
                alive = report.alive,
                interrupted = report.interrupted.len(),
                admitted = report.admitted.len(),
                "startup reconciliation finished"
            ),
            ReconcileMode::Periodic if !report.interrupted.is_empty() => info!(
                checked = report.checked,
                interrupted = report.interrupted.len(),
                "reconciliation corrected jobs"
            ),
            ReconcileMode::Periodic => debug!(checked = report.checked, "reconciliation clean"),
        }
        Ok(report)
    }
}
