//! Orchestrator - コンポーネントのワイヤリングと外部向け操作
//!
//! # 主要な責務
//! - 受付（submit_job）と状態参照（get_job, list_jobs, counts）
//! - 外部ユニットの進捗・終了コールバック（WorkerEvents）
//! - オペレータ操作（force_fail, requeue, approve_cleanup）
//! - 監視ループ（reconciler / reaper）の起動と停止

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::admission::AdmissionController;
use super::progress::ProgressReporter;
use super::reaper::{ReapReport, StuckJobReaper};
use super::reconciler::{ReconcileMode, ReconcileReport, StateReconciler};
use crate::config::OrchestratorConfig;
use crate::domain::{
    AnomalySubject, ExternalRef, Failure, JobFilter, JobId, JobInput, JobStatus, JobView,
    QueueCounts, TrackedAnomaly, Transition,
};
use crate::error::OrchestratorError;
use crate::ports::{Clock, ExternalWorker, JobStore, StoreError, WorkerEvents, WorkerOutcome};

pub struct Orchestrator {
    pub(super) store: Arc<dyn JobStore>,
    pub(super) worker: Arc<dyn ExternalWorker>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) admission: Arc<AdmissionController>,
    pub(super) progress: ProgressReporter,
    pub(super) reconciler: StateReconciler,
    pub(super) reaper: StuckJobReaper,
    pub(super) config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn submit_job(&self, input: JobInput) -> Result<JobId, OrchestratorError> {
        self.admission.submit(input).await
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<JobView>, OrchestratorError> {
        Ok(self.store.get(id).await?.map(|job| job.view()))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobView>, OrchestratorError> {
        Ok(self
            .store
            .list(filter)
            .await?
            .iter()
            .map(|job| job.view())
            .collect())
    }

    pub async fn counts(&self) -> Result<QueueCounts, OrchestratorError> {
        Ok(self.store.counts().await?)
    }

    pub async fn anomalies(&self) -> Result<Vec<TrackedAnomaly>, OrchestratorError> {
        Ok(self.store.anomalies().await?)
    }

    pub async fn try_admit_next(&self) -> Result<Vec<JobId>, OrchestratorError> {
        self.admission.try_admit_next().await
    }

    pub async fn reconcile(&self, mode: ReconcileMode) -> Result<ReconcileReport, OrchestratorError> {
        self.reconciler.run_pass(mode).await
    }

    pub async fn reap(&self) -> Result<ReapReport, OrchestratorError> {
        self.reaper.run_pass().await
    }

    /// Operator escape: PENDING or RUNNING → FAILED. A RUNNING job's
    /// external unit is terminated after the transition.
    pub async fn force_fail(&self, id: JobId, reason: &str) -> Result<JobView, OrchestratorError> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                id,
                status: job.status,
                reason: "job already finished",
            });
        }

        let failed = match self
            .store
            .transition(
                id,
                job.status,
                Transition::Fail(Failure::operator(reason)),
                self.clock.now(),
            )
            .await
        {
            Ok(failed) => failed,
            Err(StoreError::Conflict { actual, .. }) => {
                return Err(OrchestratorError::InvalidState {
                    id,
                    status: actual,
                    reason: "job changed state concurrently",
                });
            }
            Err(e) => return Err(e.into()),
        };
        warn!(job_id = %id, from = %job.status, reason, "job force-failed by operator");

        if let Some(reference) = &job.external_reference
            && let Err(e) = self.worker.terminate(reference).await
        {
            warn!(job_id = %id, reference = %reference, error = %e, "terminate after force-fail failed");
        }
        self.store.remove_anomaly(&AnomalySubject::Job(id)).await?;
        self.admit_logged().await;

        Ok(failed.view())
    }

    /// Operator escape: resubmit a FAILED job's input as a new PENDING job.
    pub async fn requeue(&self, id: JobId) -> Result<JobId, OrchestratorError> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))?;
        if job.status != JobStatus::Failed {
            return Err(OrchestratorError::InvalidState {
                id,
                status: job.status,
                reason: "only FAILED jobs can be requeued",
            });
        }
        self.admission.resubmit(job.input, id).await
    }

    /// Let the next reaper pass clean up an anomaly held for approval.
    pub async fn approve_cleanup(&self, subject: &AnomalySubject) -> Result<(), OrchestratorError> {
        self.store.approve_anomaly(subject).await?;
        info!(subject = %subject, "cleanup approved by operator");
        Ok(())
    }

    async fn admit_logged(&self) {
        if let Err(e) = self.admission.try_admit_next().await {
            warn!(error = %e, "admission failed");
        }
    }

    /// Spawn the reconciler and reaper loops.
    ///
    /// Run `reconcile(ReconcileMode::Startup)` first; the loops only do
    /// periodic passes.
    pub fn spawn_monitors(self: &Arc<Self>) -> MonitorGroup {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reconcile = {
            let orchestrator = Arc::clone(self);
            let rx = shutdown_rx.clone();
            let period = self.config.monitor_interval();
            tokio::spawn(async move {
                monitor_loop("reconciler", period, rx, move || {
                    let orchestrator = Arc::clone(&orchestrator);
                    async move {
                        orchestrator
                            .reconcile(ReconcileMode::Periodic)
                            .await
                            .map(|_| ())
                    }
                })
                .await;
            })
        };

        let reap = {
            let orchestrator = Arc::clone(self);
            let rx = shutdown_rx;
            let period = self.config.reaper_interval();
            tokio::spawn(async move {
                monitor_loop("reaper", period, rx, move || {
                    let orchestrator = Arc::clone(&orchestrator);
                    async move { orchestrator.reap().await.map(|_| ()) }
                })
                .await;
            })
        };

        MonitorGroup {
            shutdown_tx,
            joins: vec![reconcile, reap],
        }
    }
}

/// Monitor loop handle.
/// - `request_shutdown()` で両ループが次の待機点で止まる
/// - `shutdown_and_join()` で終了を待てる
pub struct MonitorGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl MonitorGroup {
    /// In-flight passes finish; no new pass starts.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn monitor_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut pass: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), OrchestratorError>>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(loop_name = name, ?period, "monitor loop started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        // A failed pass is retried on the next tick.
        if let Err(e) = pass().await {
            error!(loop_name = name, error = %e, "monitor pass failed");
        }
    }
    debug!(loop_name = name, "monitor loop stopped");
}

#[async_trait]
impl WorkerEvents for Orchestrator {
    async fn on_progress(&self, job_id: JobId, reference: &ExternalRef, progress: i64, step: &str) {
        if let Err(e) = self.progress.report(job_id, reference, progress, step).await {
            warn!(job_id = %job_id, error = %e, "progress update failed");
        }
    }

    async fn on_exit(&self, job_id: JobId, reference: &ExternalRef, outcome: WorkerOutcome) {
        match self.store.get(job_id).await {
            Ok(Some(job))
                if job.status == JobStatus::Running
                    && job.external_reference.as_ref() == Some(reference) =>
            {
                let change = match outcome {
                    WorkerOutcome::Succeeded { result_path } => Transition::Complete { result_path },
                    WorkerOutcome::Failed { message } => Transition::Fail(Failure::processing(message)),
                };
                match self
                    .store
                    .transition(job_id, JobStatus::Running, change, self.clock.now())
                    .await
                {
                    Ok(job) if job.status == JobStatus::Completed => {
                        info!(job_id = %job_id, result_path = ?job.result_path, "job completed");
                    }
                    Ok(job) => {
                        warn!(
                            job_id = %job_id,
                            error = job.error_message.as_deref().unwrap_or_default(),
                            "job failed"
                        );
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(job_id = %job_id, error = %e, "exit arrived after job left RUNNING");
                    }
                    Err(e) => error!(job_id = %job_id, error = %e, "recording job exit failed"),
                }
            }
            Ok(Some(job)) => {
                debug!(
                    job_id = %job_id,
                    reference = %reference,
                    status = %job.status,
                    "exit of superseded unit ignored"
                );
            }
            Ok(None) => warn!(job_id = %job_id, reference = %reference, "exit for unknown job"),
            Err(e) => error!(job_id = %job_id, error = %e, "loading job on exit failed"),
        }

        self.admit_logged().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{
        INTERRUPTED_NO_REFERENCE, INTERRUPTED_PROCESS_NOT_FOUND, STUCK_AUTO_CLEANED,
    };
    use crate::domain::{FailureKind, Job};
    use crate::app::builder::OrchestratorBuilder;
    use crate::config::WorkerConfig;
    use crate::domain::{AnomalyKind, ProgressUpdate};
    use crate::impls::{FileJobStore, InMemoryJobStore, ManualWorker, ProcessWorker};
    use crate::ports::FixedClock;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use chrono::{DateTime, TimeZone, Utc};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 12, 9, 0, 0).unwrap()
    }

    fn config(concurrency_limit: usize, queue_depth_limit: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency_limit,
            queue_depth_limit,
            ..OrchestratorConfig::default()
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        store: InMemoryJobStore,
        worker: ManualWorker,
        clock: FixedClock,
    }

    impl Harness {
        fn new(config: OrchestratorConfig) -> Self {
            let store = InMemoryJobStore::new();
            let worker = ManualWorker::new();
            let clock = FixedClock::new(t0());
            let orchestrator = OrchestratorBuilder::new()
                .store(Arc::new(store.clone()))
                .worker(Arc::new(worker.clone()))
                .clock(Arc::new(clock.clone()))
                .config(config)
                .build()
                .unwrap();
            Self {
                orchestrator,
                store,
                worker,
                clock,
            }
        }

        /// Submit and move the clock on, so submission order is FIFO order.
        async fn submit(&self, name: &str) -> Result<JobId, OrchestratorError> {
            let result = self
                .orchestrator
                .submit_job(JobInput::new(format!("/data/in/{name}.nii.gz")))
                .await;
            self.clock.advance(chrono::Duration::seconds(1));
            result
        }

        async fn job(&self, id: JobId) -> JobView {
            self.orchestrator.get_job(id).await.unwrap().unwrap()
        }

        async fn reference(&self, id: JobId) -> ExternalRef {
            self.worker.reference_of(id).await.unwrap()
        }

        async fn counts(&self) -> QueueCounts {
            self.orchestrator.counts().await.unwrap()
        }
    }

    #[tokio::test]
    async fn completion_promotes_next_pending_job() {
        let h = Harness::new(config(1, 10));
        let a = h.submit("a").await.unwrap();
        let b = h.submit("b").await.unwrap();

        assert_eq!(h.job(a).await.status, JobStatus::Running);
        assert_eq!(h.job(b).await.status, JobStatus::Pending);

        let ref_a = h.reference(a).await;
        h.worker.progress(&ref_a, 45, "CA Reg").await;
        let running = h.job(a).await;
        assert_eq!(running.progress, 45);
        assert_eq!(running.current_step.as_deref(), Some("CA Reg"));

        h.worker.complete(&ref_a, "/data/subjects/a").await;

        let done = h.job(a).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result_path, Some("/data/subjects/a".into()));
        assert!(done.completed_at.is_some());
        assert_eq!(h.job(b).await.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn out_of_band_kill_is_reconciled_and_slot_reused() {
        let h = Harness::new(config(1, 10));
        let a = h.submit("a").await.unwrap();
        let b = h.submit("b").await.unwrap();
        let ref_a = h.reference(a).await;

        assert!(h.worker.kill(&ref_a).await);
        let report = h
            .orchestrator
            .reconcile(ReconcileMode::Periodic)
            .await
            .unwrap();

        assert_eq!(report.interrupted, vec![a]);
        assert_eq!(report.admitted, vec![b]);
        let failed = h.job(a).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.failure_kind, Some(FailureKind::Interrupted));
        assert_eq!(failed.error_message.as_deref(), Some(INTERRUPTED_PROCESS_NOT_FOUND));
        assert_eq!(h.job(b).await.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn submissions_beyond_queue_depth_are_rejected() {
        let h = Harness::new(config(1, 2));
        h.submit("a").await.unwrap();
        h.submit("b").await.unwrap();
        h.submit("c").await.unwrap();

        let err = h.submit("d").await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Capacity { pending: 2, limit: 2 }));
        let counts = h.counts().await;
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn repeated_admission_never_exceeds_limit() {
        let h = Harness::new(config(2, 10));
        for name in ["a", "b", "c", "d"] {
            h.submit(name).await.unwrap();
        }

        let o = &h.orchestrator;
        let (r1, r2, r3) = tokio::join!(o.try_admit_next(), o.try_admit_next(), o.try_admit_next());
        for _ in 0..5 {
            assert!(o.try_admit_next().await.unwrap().is_empty());
        }

        assert!(r1.unwrap().is_empty() && r2.unwrap().is_empty() && r3.unwrap().is_empty());
        assert_eq!(h.worker.started().await.len(), 2);
        assert_eq!(h.counts().await.running, 2);
    }

    #[tokio::test]
    async fn jobs_are_admitted_in_submission_order() {
        let h = Harness::new(config(1, 10));
        let a = h.submit("a").await.unwrap();
        let b = h.submit("b").await.unwrap();
        let c = h.submit("c").await.unwrap();

        for id in [a, b] {
            let reference = h.reference(id).await;
            h.worker.complete(&reference, "/out").await;
        }

        let order: Vec<JobId> = h.worker.started().await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[tokio::test]
    async fn bounds_hold_through_mixed_activity() {
        let h = Harness::new(config(2, 3));
        for step in 0..40 {
            match step % 5 {
                0 | 1 | 2 => {
                    let _ = h.submit(&format!("j{step}")).await;
                }
                3 => {
                    if let Some(reference) = h.worker.alive().await.into_iter().next() {
                        h.worker.complete(&reference, "/out").await;
                    }
                }
                _ => {
                    if let Some(reference) = h.worker.alive().await.into_iter().next() {
                        h.worker.kill(&reference).await;
                    }
                    h.orchestrator
                        .reconcile(ReconcileMode::Periodic)
                        .await
                        .unwrap();
                }
            }
            let counts = h.counts().await;
            assert!(counts.running <= 2, "step {step}: {counts:?}");
            assert!(counts.pending <= 3, "step {step}: {counts:?}");
        }
    }

    #[tokio::test]
    async fn launch_failure_frees_the_slot_for_the_next_job() {
        let h = Harness::new(config(1, 10));
        let a = h.submit("a").await.unwrap();
        let b = h.submit("b").await.unwrap();
        let c = h.submit("c").await.unwrap();

        h.worker.fail_next_launches(1);
        let ref_a = h.reference(a).await;
        h.worker.complete(&ref_a, "/out/a").await;

        let failed = h.job(b).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.failure_kind, Some(FailureKind::Launch));
        assert_eq!(
            failed.error_message.as_deref(),
            Some("launch error: runtime unavailable")
        );
        assert_eq!(h.job(c).await.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn processing_failure_is_recorded() {
        let h = Harness::new(config(1, 10));
        let a = h.submit("a").await.unwrap();
        let ref_a = h.reference(a).await;

        h.worker
            .fail(&ref_a, "exit status: 1; stderr: ERROR: talairach failed")
            .await;

        let job = h.job(a).await;
        assert_eq!(job.failure_kind, Some(FailureKind::Processing));
        assert!(
            job.error_message
                .as_deref()
                .unwrap()
                .starts_with("processing error: exit status: 1")
        );
        assert!(job.result_path.is_none());
    }

    #[tokio::test]
    async fn running_job_without_reference_is_orphaned() {
        let h = Harness::new(config(1, 10));
        let mut job = Job::new_pending(
            JobId::from_ulid(Ulid::new()),
            JobInput::new("/data/in/x.nii.gz"),
            t0(),
        );
        job.status = JobStatus::Running;
        job.started_at = Some(t0());
        let id = job.id;
        h.store.insert_raw(job).await;

        let report = h
            .orchestrator
            .reconcile(ReconcileMode::Periodic)
            .await
            .unwrap();

        assert_eq!(report.interrupted, vec![id]);
        assert_eq!(h.job(id).await.error_message.as_deref(), Some(INTERRUPTED_NO_REFERENCE));
    }

    #[tokio::test]
    async fn stuck_job_is_flagged_then_cleaned_after_grace() {
        let h = Harness::new(config(1, 10));
        let a = h.submit("a").await.unwrap();
        let ref_a = h.reference(a).await;

        h.clock.advance(chrono::Duration::hours(2) + chrono::Duration::minutes(1));
        let report = h.orchestrator.reap().await.unwrap();
        assert_eq!(report.flagged, vec![AnomalySubject::Job(a)]);
        assert!(report.cleaned.is_empty());
        assert_eq!(h.job(a).await.status, JobStatus::Running);

        h.clock.advance(chrono::Duration::hours(2));
        let report = h.orchestrator.reap().await.unwrap();
        assert!(report.cleaned.is_empty());
        assert_eq!(h.job(a).await.status, JobStatus::Running);
        assert_eq!(h.orchestrator.anomalies().await.unwrap().len(), 1);

        h.clock.advance(chrono::Duration::hours(1));
        let report = h.orchestrator.reap().await.unwrap();
        assert_eq!(report.cleaned, vec![AnomalySubject::Job(a)]);

        let job = h.job(a).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_kind, Some(FailureKind::Stuck));
        assert_eq!(job.error_message.as_deref(), Some(STUCK_AUTO_CLEANED));
        assert_eq!(h.worker.terminated().await, vec![ref_a.clone()]);
        assert!(h.orchestrator.anomalies().await.unwrap().is_empty());

        // The exit caused by the kill arrives late and changes nothing.
        h.orchestrator
            .on_exit(
                a,
                &ref_a,
                WorkerOutcome::Succeeded {
                    result_path: "/out/a".into(),
                },
            )
            .await;
        assert_eq!(h.job(a).await.error_message.as_deref(), Some(STUCK_AUTO_CLEANED));
    }

    #[tokio::test]
    async fn flagged_job_that_finishes_recovers() {
        let h = Harness::new(config(1, 10));
        let a = h.submit("a").await.unwrap();

        h.clock.advance(chrono::Duration::hours(3));
        h.orchestrator.reap().await.unwrap();
        let ref_a = h.reference(a).await;
        h.worker.complete(&ref_a, "/out/a").await;

        let report = h.orchestrator.reap().await.unwrap();

        assert_eq!(report.recovered, vec![AnomalySubject::Job(a)]);
        assert!(h.orchestrator.anomalies().await.unwrap().is_empty());
        assert_eq!(h.job(a).await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn long_pending_job_is_failed_after_grace() {
        let h = Harness::new(OrchestratorConfig {
            pending_threshold_secs: 3600,
            running_threshold_secs: 10 * 24 * 3600,
            ..config(1, 10)
        });
        let a = h.submit("a").await.unwrap();
        let b = h.submit("b").await.unwrap();

        h.clock.advance(chrono::Duration::seconds(3601));
        let report = h.orchestrator.reap().await.unwrap();
        assert_eq!(report.flagged, vec![AnomalySubject::Job(b)]);

        h.clock.advance(chrono::Duration::hours(3));
        let report = h.orchestrator.reap().await.unwrap();

        assert_eq!(report.cleaned, vec![AnomalySubject::Job(b)]);
        assert_eq!(h.job(b).await.failure_kind, Some(FailureKind::Stuck));
        assert_eq!(h.job(a).await.status, JobStatus::Running);
        assert!(h.worker.terminated().await.is_empty());
    }

    #[tokio::test]
    async fn orphaned_process_is_terminated_after_grace() {
        let h = Harness::new(config(1, 10));
        let stray = ExternalRef::new("surfq-stray");
        h.worker.adopt(stray.clone()).await;

        let report = h.orchestrator.reap().await.unwrap();
        assert_eq!(report.flagged, vec![AnomalySubject::Process(stray.clone())]);
        assert!(h.worker.terminated().await.is_empty());

        h.clock.advance(chrono::Duration::hours(3));
        let report = h.orchestrator.reap().await.unwrap();

        assert_eq!(report.cleaned, vec![AnomalySubject::Process(stray.clone())]);
        assert_eq!(h.worker.terminated().await, vec![stray]);
    }

    #[tokio::test]
    async fn operator_approval_gates_escalation() {
        let h = Harness::new(OrchestratorConfig {
            require_operator_approval: true,
            ..config(1, 10)
        });
        let stray = ExternalRef::new("surfq-stray");
        let subject = AnomalySubject::Process(stray.clone());
        h.worker.adopt(stray.clone()).await;
        h.orchestrator.reap().await.unwrap();

        h.clock.advance(chrono::Duration::hours(4));
        let report = h.orchestrator.reap().await.unwrap();
        assert_eq!(report.awaiting_approval, vec![subject.clone()]);
        assert!(h.worker.terminated().await.is_empty());
        assert!(h.orchestrator.anomalies().await.unwrap()[0].awaiting_approval);

        h.orchestrator.approve_cleanup(&subject).await.unwrap();
        let report = h.orchestrator.reap().await.unwrap();

        assert_eq!(report.cleaned, vec![subject]);
        assert_eq!(h.worker.terminated().await, vec![stray]);
    }

    #[tokio::test]
    async fn force_fail_and_requeue() {
        let h = Harness::new(config(1, 10));
        let a = h.submit("a").await.unwrap();
        let b = h.submit("b").await.unwrap();
        let ref_a = h.reference(a).await;

        let view = h.orchestrator.force_fail(a, "wrong scan").await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error_message.as_deref(), Some("operator: wrong scan"));
        assert_eq!(h.worker.terminated().await, vec![ref_a]);
        assert_eq!(h.job(b).await.status, JobStatus::Running);

        let again = h.orchestrator.force_fail(a, "twice").await.unwrap_err();
        assert!(matches!(again, OrchestratorError::InvalidState { .. }));

        let c = h.orchestrator.requeue(a).await.unwrap();
        let requeued = h.store.get(c).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.requeued_from, Some(a));
        assert_eq!(requeued.input.input_path, std::path::PathBuf::from("/data/in/a.nii.gz"));

        let running = h.orchestrator.requeue(b).await.unwrap_err();
        assert!(matches!(running, OrchestratorError::InvalidState { status: JobStatus::Running, .. }));

        let unknown = JobId::from_ulid(Ulid::new());
        assert!(matches!(
            h.orchestrator.force_fail(unknown, "x").await,
            Err(OrchestratorError::NotFound(id)) if id == unknown
        ));
    }

    #[tokio::test]
    async fn passive_orchestrator_leaves_launching_to_the_active_one() {
        let store = InMemoryJobStore::new();
        let worker = ManualWorker::new();
        let passive = OrchestratorBuilder::new()
            .store(Arc::new(store.clone()))
            .worker(Arc::new(worker.clone()))
            .passive()
            .build()
            .unwrap();
        let active = OrchestratorBuilder::new()
            .store(Arc::new(store.clone()))
            .worker(Arc::new(worker.clone()))
            .build()
            .unwrap();

        let id = passive
            .submit_job(JobInput::new("/data/in/a.nii.gz"))
            .await
            .unwrap();
        assert_eq!(passive.get_job(id).await.unwrap().unwrap().status, JobStatus::Pending);

        active.reconcile(ReconcileMode::Periodic).await.unwrap();

        assert_eq!(active.get_job(id).await.unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn startup_pass_after_restart_uses_independent_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let before_restart = ManualWorker::new();

        let (a, b) = {
            let orchestrator = OrchestratorBuilder::new()
                .store(Arc::new(FileJobStore::open(&path).await.unwrap()))
                .worker(Arc::new(before_restart.clone()))
                .config(config(2, 10))
                .build()
                .unwrap();
            let a = orchestrator.submit_job(JobInput::new("/in/a.nii.gz")).await.unwrap();
            let b = orchestrator.submit_job(JobInput::new("/in/b.nii.gz")).await.unwrap();
            (a, b)
        };
        let ref_a = before_restart.reference_of(a).await.unwrap();

        // Only `a` survived the restart.
        let after_restart = ManualWorker::new();
        after_restart.adopt(ref_a).await;
        let orchestrator = OrchestratorBuilder::new()
            .store(Arc::new(FileJobStore::open(&path).await.unwrap()))
            .worker(Arc::new(after_restart))
            .config(config(2, 10))
            .build()
            .unwrap();

        let report = orchestrator.reconcile(ReconcileMode::Startup).await.unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.alive, 1);
        assert_eq!(report.interrupted, vec![b]);
        let a_view = orchestrator.get_job(a).await.unwrap().unwrap();
        let b_view = orchestrator.get_job(b).await.unwrap().unwrap();
        assert_eq!(a_view.status, JobStatus::Running);
        assert_eq!(b_view.error_message.as_deref(), Some(INTERRUPTED_PROCESS_NOT_FOUND));
    }

    /// Store that lets a test interleave work with a pass:
    /// - `get` can be held, which is where `on_exit` waits when the state
    ///   file is slow to lock and read;
    /// - a job can be completed just as the reaper tracks it.
    #[derive(Default)]
    struct InterleavingStore {
        inner: InMemoryJobStore,
        hold: AtomicBool,
        entered: Notify,
        release: Notify,
        finish_on_track: tokio::sync::Mutex<Option<JobId>>,
    }

    #[async_trait]
    impl JobStore for InterleavingStore {
        async fn submit(&self, job: Job, max_pending: usize) -> Result<JobId, StoreError> {
            self.inner.submit(job, max_pending).await
        }

        async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
            if self.hold.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.get(id).await
        }

        async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
            self.inner.list(filter).await
        }

        async fn transition(
            &self,
            id: JobId,
            from: JobStatus,
            change: Transition,
            now: DateTime<Utc>,
        ) -> Result<Job, StoreError> {
            self.inner.transition(id, from, change, now).await
        }

        async fn attach_reference(
            &self,
            id: JobId,
            reference: ExternalRef,
        ) -> Result<Job, StoreError> {
            self.inner.attach_reference(id, reference).await
        }

        async fn update_progress(
            &self,
            id: JobId,
            reference: Option<&ExternalRef>,
            progress: u8,
            step: &str,
        ) -> Result<ProgressUpdate, StoreError> {
            self.inner.update_progress(id, reference, progress, step).await
        }

        async fn counts(&self) -> Result<QueueCounts, StoreError> {
            self.inner.counts().await
        }

        async fn track_anomaly(
            &self,
            subject: AnomalySubject,
            kind: AnomalyKind,
            now: DateTime<Utc>,
        ) -> Result<TrackedAnomaly, StoreError> {
            let finish = *self.finish_on_track.lock().await;
            if let AnomalySubject::Job(id) = &subject {
                if finish == Some(*id) {
                    *self.finish_on_track.lock().await = None;
                    let change = Transition::Complete {
                        result_path: "/out/raced".into(),
                    };
                    self.inner.transition(*id, JobStatus::Running, change, now).await?;
                }
            }
            self.inner.track_anomaly(subject, kind, now).await
        }

        async fn anomalies(&self) -> Result<Vec<TrackedAnomaly>, StoreError> {
            self.inner.anomalies().await
        }

        async fn mark_awaiting_approval(&self, subject: &AnomalySubject) -> Result<(), StoreError> {
            self.inner.mark_awaiting_approval(subject).await
        }

        async fn approve_anomaly(&self, subject: &AnomalySubject) -> Result<(), StoreError> {
            self.inner.approve_anomaly(subject).await
        }

        async fn remove_anomaly(&self, subject: &AnomalySubject) -> Result<bool, StoreError> {
            self.inner.remove_anomaly(subject).await
        }
    }

    #[tokio::test]
    async fn reconcile_while_exit_is_recorded_keeps_the_success() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(InterleavingStore::default());
        let worker = ProcessWorker::new(WorkerConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 0".to_string()],
            output_root: root.path().to_path_buf(),
            expected_outputs: Vec::new(),
            probe: None,
            kill: None,
            list: None,
            ..WorkerConfig::default()
        });
        let orchestrator = OrchestratorBuilder::new()
            .store(store.clone())
            .worker(Arc::new(worker))
            .config(config(1, 10))
            .build()
            .unwrap();

        store.hold.store(true, Ordering::SeqCst);
        let id = orchestrator.submit_job(JobInput::new("/in/a.nii.gz")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), store.entered.notified())
            .await
            .unwrap();

        let report = orchestrator.reconcile(ReconcileMode::Periodic).await.unwrap();
        assert_eq!(report.alive, 1);
        assert!(report.interrupted.is_empty());

        store.hold.store(false, Ordering::SeqCst);
        store.release.notify_one();
        let mut status = JobStatus::Running;
        for _ in 0..100 {
            status = orchestrator.get_job(id).await.unwrap().unwrap().status;
            if status != JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn job_finishing_during_escalation_is_reported_recovered() {
        let store = Arc::new(InterleavingStore::default());
        let worker = ManualWorker::new();
        let clock = FixedClock::new(t0());
        let orchestrator = OrchestratorBuilder::new()
            .store(store.clone())
            .worker(Arc::new(worker.clone()))
            .clock(Arc::new(clock.clone()))
            .config(config(1, 10))
            .build()
            .unwrap();
        let a = orchestrator.submit_job(JobInput::new("/in/a.nii.gz")).await.unwrap();

        clock.advance(chrono::Duration::hours(3));
        orchestrator.reap().await.unwrap();
        clock.advance(chrono::Duration::hours(4));
        *store.finish_on_track.lock().await = Some(a);

        let report = orchestrator.reap().await.unwrap();

        assert!(report.cleaned.is_empty());
        assert_eq!(report.recovered, vec![AnomalySubject::Job(a)]);
        assert!(worker.terminated().await.is_empty());
        assert!(orchestrator.anomalies().await.unwrap().is_empty());
        let job = orchestrator.get_job(a).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn monitor_loops_reconcile_until_shutdown() {
        let h = Harness::new(OrchestratorConfig {
            monitor_interval_secs: 1,
            ..config(1, 10)
        });
        let a = h.submit("a").await.unwrap();
        let ref_a = h.reference(a).await;
        let monitors = h.orchestrator.spawn_monitors();

        h.worker.kill(&ref_a).await;
        let mut status = JobStatus::Running;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            status = h.job(a).await.status;
            if status == JobStatus::Failed {
                break;
            }
        }

        monitors.shutdown_and_join().await;
        assert_eq!(status, JobStatus::Failed);
    }
}
