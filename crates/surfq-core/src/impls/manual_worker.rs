//! ManualWorker - 明示的に操作する in-process ExternalWorker
//!
//! 外部ランタイムを持たないので、ユニットの進捗・終了・消失は呼び出し側が
//! `progress` / `complete` / `fail` / `kill` で起こす。テストと dry run 用。

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{ExternalRef, Job, JobId};
use crate::ports::{ExternalWorker, WorkerError, WorkerEvents, WorkerOutcome};

struct Unit {
    job_id: Option<JobId>,
    events: Option<Arc<dyn WorkerEvents>>,
}

#[derive(Default)]
struct Inner {
    alive: BTreeMap<ExternalRef, Unit>,
    started: Vec<(JobId, ExternalRef)>,
    terminated: Vec<ExternalRef>,
}

#[derive(Clone, Default)]
pub struct ManualWorker {
    inner: Arc<Mutex<Inner>>,
    failing_launches: Arc<AtomicUsize>,
}

impl ManualWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `start` fail with a launch error.
    pub fn fail_next_launches(&self, n: usize) {
        self.failing_launches.store(n, Ordering::SeqCst);
    }

    /// Pretend a unit this instance did not start is running, as after a
    /// restart or for a stray container.
    pub async fn adopt(&self, reference: ExternalRef) {
        self.inner.lock().await.alive.insert(
            reference,
            Unit {
                job_id: None,
                events: None,
            },
        );
    }

    /// The unit dies out-of-band; no exit event is delivered.
    pub async fn kill(&self, reference: &ExternalRef) -> bool {
        self.inner.lock().await.alive.remove(reference).is_some()
    }

    pub async fn progress(&self, reference: &ExternalRef, progress: i64, step: &str) {
        let target = {
            let inner = self.inner.lock().await;
            inner
                .alive
                .get(reference)
                .and_then(|unit| Some((unit.job_id?, Arc::clone(unit.events.as_ref()?))))
        };
        if let Some((job_id, events)) = target {
            events.on_progress(job_id, reference, progress, step).await;
        }
    }

    pub async fn complete(&self, reference: &ExternalRef, result_path: impl Into<PathBuf>) {
        self.exit(
            reference,
            WorkerOutcome::Succeeded {
                result_path: result_path.into(),
            },
        )
        .await;
    }

    pub async fn fail(&self, reference: &ExternalRef, message: &str) {
        self.exit(
            reference,
            WorkerOutcome::Failed {
                message: message.to_string(),
            },
        )
        .await;
    }

    async fn exit(&self, reference: &ExternalRef, outcome: WorkerOutcome) {
        let unit = self.inner.lock().await.alive.remove(reference);
        if let Some(Unit {
            job_id: Some(job_id),
            events: Some(events),
        }) = unit
        {
            events.on_exit(job_id, reference, outcome).await;
        }
    }

    pub async fn alive(&self) -> BTreeSet<ExternalRef> {
        self.inner.lock().await.alive.keys().cloned().collect()
    }

    pub async fn started(&self) -> Vec<(JobId, ExternalRef)> {
        self.inner.lock().await.started.clone()
    }

    pub async fn terminated(&self) -> Vec<ExternalRef> {
        self.inner.lock().await.terminated.clone()
    }

    /// Reference currently backing `job_id`, if its unit is alive.
    pub async fn reference_of(&self, job_id: JobId) -> Option<ExternalRef> {
        self.inner
            .lock()
            .await
            .alive
            .iter()
            .find(|(_, unit)| unit.job_id == Some(job_id))
            .map(|(reference, _)| reference.clone())
    }
}

#[async_trait]
impl ExternalWorker for ManualWorker {
    fn prepare(&self, job: &Job) -> ExternalRef {
        ExternalRef::new(format!("manual-{}", job.id.as_ulid().to_string().to_lowercase()))
    }

    async fn start(
        &self,
        job: &Job,
        reference: &ExternalRef,
        events: Arc<dyn WorkerEvents>,
    ) -> Result<ExternalRef, WorkerError> {
        let inject = self
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if inject.is_ok() {
            return Err(WorkerError::Launch("runtime unavailable".to_string()));
        }
        let mut inner = self.inner.lock().await;
        inner.alive.insert(
            reference.clone(),
            Unit {
                job_id: Some(job.id),
                events: Some(events),
            },
        );
        inner.started.push((job.id, reference.clone()));
        Ok(reference.clone())
    }

    async fn is_alive(&self, reference: &ExternalRef) -> bool {
        self.inner.lock().await.alive.contains_key(reference)
    }

    async fn terminate(&self, reference: &ExternalRef) -> Result<(), WorkerError> {
        let mut inner = self.inner.lock().await;
        if inner.alive.remove(reference).is_none() {
            return Err(WorkerError::UnknownReference(reference.clone()));
        }
        inner.terminated.push(reference.clone());
        Ok(())
    }

    async fn active_references(&self) -> Result<Vec<ExternalRef>, WorkerError> {
        Ok(self.inner.lock().await.alive.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobInput;
    use chrono::Utc;
    use ulid::Ulid;

    #[derive(Default)]
    struct Exits(std::sync::Mutex<Vec<WorkerOutcome>>);

    #[async_trait]
    impl WorkerEvents for Exits {
        async fn on_progress(&self, _: JobId, _: &ExternalRef, _: i64, _: &str) {}

        async fn on_exit(&self, _: JobId, _: &ExternalRef, outcome: WorkerOutcome) {
            self.0.lock().unwrap().push(outcome);
        }
    }

    fn job() -> Job {
        Job::new_pending(
            JobId::from_ulid(Ulid::new()),
            JobInput::new("/in/T1.nii.gz"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn kill_is_silent_and_complete_reports() {
        let worker = ManualWorker::new();
        let exits = Arc::new(Exits::default());
        let (a, b) = (job(), job());
        let ref_a = worker.prepare(&a);
        let ref_b = worker.prepare(&b);
        worker.start(&a, &ref_a, exits.clone()).await.unwrap();
        worker.start(&b, &ref_b, exits.clone()).await.unwrap();

        assert!(worker.kill(&ref_a).await);
        worker.complete(&ref_b, "/out/b").await;

        assert!(!worker.is_alive(&ref_a).await);
        assert_eq!(exits.0.lock().unwrap().len(), 1);
        assert!(worker.active_references().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_launch_failures_are_consumed() {
        let worker = ManualWorker::new();
        worker.fail_next_launches(1);
        let (a, b) = (job(), job());

        let err = worker
            .start(&a, &worker.prepare(&a), Arc::new(Exits::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Launch(_)));
        assert!(worker.started().await.is_empty());

        worker
            .start(&b, &worker.prepare(&b), Arc::new(Exits::default()))
            .await
            .unwrap();
        assert_eq!(worker.started().await.len(), 1);
    }

    #[tokio::test]
    async fn adopted_unit_is_alive_but_not_owned() {
        let worker = ManualWorker::new();
        let stray = ExternalRef::new("surfq-stray");
        worker.adopt(stray.clone()).await;

        assert!(worker.is_alive(&stray).await);
        worker.terminate(&stray).await.unwrap();
        assert_eq!(worker.terminated().await, vec![stray.clone()]);
        assert!(worker.terminate(&stray).await.is_err());
    }
}
