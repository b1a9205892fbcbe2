//! AdmissionController - PENDING → RUNNING の唯一の入口
//!
//! # フロー（try_admit_next）
//! 1. admission lock を取る（同一インスタンス内での並行呼び出しを直列化）
//! 2. RUNNING 数が上限未満なら、最古の PENDING を選ぶ（created_at → id）
//! 3. `ExternalWorker::prepare` で reference を確保
//! 4. `transition(PENDING → RUNNING, Start { reference })`（CAS）
//! 5. `ExternalWorker::start`。失敗したら RUNNING → FAILED(launch) にして次へ
//!
//! reference を先に確保してから RUNNING にするので、「RUNNING ⇔ reference あり」が
//! 常に成り立つ。

use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::domain::{Failure, Job, JobFilter, JobId, JobInput, JobStatus, Transition};
use crate::error::OrchestratorError;
use crate::ports::{Clock, ExternalWorker, IdGenerator, JobStore, WorkerEvents};

pub struct AdmissionController {
    store: Arc<dyn JobStore>,
    worker: Arc<dyn ExternalWorker>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Weak<dyn WorkerEvents>,
    concurrency_limit: usize,
    queue_depth_limit: usize,
    launch_enabled: bool,
    lock: Mutex<()>,
}

/// Held while admission is paused.
pub struct AdmissionGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl AdmissionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        worker: Arc<dyn ExternalWorker>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Weak<dyn WorkerEvents>,
        concurrency_limit: usize,
        queue_depth_limit: usize,
        launch_enabled: bool,
    ) -> Self {
        Self {
            store,
            worker,
            clock,
            ids,
            events,
            concurrency_limit,
            queue_depth_limit,
            launch_enabled,
            lock: Mutex::new(()),
        }
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn queue_depth_limit(&self) -> usize {
        self.queue_depth_limit
    }

    /// Store a new PENDING job and try to admit.
    pub async fn submit(&self, input: JobInput) -> Result<JobId, OrchestratorError> {
        self.enqueue(input, None).await
    }

    /// Store a new PENDING job carrying the input of a FAILED one.
    pub async fn resubmit(&self, input: JobInput, from: JobId) -> Result<JobId, OrchestratorError> {
        self.enqueue(input, Some(from)).await
    }

    async fn enqueue(
        &self,
        input: JobInput,
        requeued_from: Option<JobId>,
    ) -> Result<JobId, OrchestratorError> {
        let mut job = Job::new_pending(self.ids.generate_job_id(), input, self.clock.now());
        job.requeued_from = requeued_from;

        let id = match self.store.submit(job, self.queue_depth_limit).await {
            Ok(id) => id,
            Err(e) => {
                let err = OrchestratorError::from(e);
                if let OrchestratorError::Capacity { pending, limit } = &err {
                    warn!(pending, limit, "submission rejected: queue full");
                }
                return Err(err);
            }
        };
        info!(job_id = %id, requeued_from = ?requeued_from.map(|f| f.to_string()), "job submitted");

        if let Err(e) = self.try_admit_next().await {
            // The job is stored; admission is retried on the next event or tick.
            warn!(job_id = %id, error = %e, "admission after submit failed");
        }
        Ok(id)
    }

    /// Pause admission. The reconciler holds this while it inspects RUNNING
    /// jobs so it never sees one between its transition and its launch.
    pub async fn exclusive(&self) -> AdmissionGuard<'_> {
        AdmissionGuard {
            _guard: self.lock.lock().await,
        }
    }

    /// Admit PENDING jobs while capacity allows. Returns the admitted ids.
    pub async fn try_admit_next(&self) -> Result<Vec<JobId>, OrchestratorError> {
        if !self.launch_enabled {
            return Ok(Vec::new());
        }
        let Some(events) = self.events.upgrade() else {
            return Ok(Vec::new());
        };

        let _guard = self.lock.lock().await;
        let mut admitted = Vec::new();

        loop {
            let counts = self.store.counts().await?;
            if counts.running >= self.concurrency_limit {
                break;
            }
            let pending = self
                .store
                .list(&JobFilter::status(JobStatus::Pending).with_limit(1))
                .await?;
            let Some(job) = pending.into_iter().next() else {
                break;
            };

            let reference = self.worker.prepare(&job);
            let started = self
                .store
                .transition(
                    job.id,
                    JobStatus::Pending,
                    Transition::Start {
                        reference: reference.clone(),
                    },
                    self.clock.now(),
                )
                .await;
            let job = match started {
                Ok(job) => job,
                Err(e) if e.is_conflict() => {
                    debug!(job_id = %job.id, error = %e, "job left PENDING before admission");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self
                .worker
                .start(&job, &reference, Arc::clone(&events))
                .await
            {
                Ok(actual) => {
                    if actual != reference {
                        match self.store.attach_reference(job.id, actual.clone()).await {
                            Ok(_) => {}
                            Err(e) if e.is_conflict() => {
                                debug!(job_id = %job.id, error = %e, "job finished before reference update");
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    info!(job_id = %job.id, reference = %actual, "job admitted");
                    admitted.push(job.id);
                }
                Err(launch) => {
                    warn!(job_id = %job.id, error = %launch, "launch failed");
                    match self
                        .store
                        .transition(
                            job.id,
                            JobStatus::Running,
                            Transition::Fail(Failure::launch(&launch)),
                            self.clock.now(),
                        )
                        .await
                    {
                        Ok(_) => {}
                        Err(e) if e.is_conflict() => {
                            debug!(job_id = %job.id, error = %e, "launch failure already resolved");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Ok(admitted)
    }
}
