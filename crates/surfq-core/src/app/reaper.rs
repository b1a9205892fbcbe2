//! StuckJobReaper - 長時間化したジョブと孤児プロセスの二段階回収
//!
//! # フロー（run_pass）
//! 1. 閾値を超えた RUNNING / PENDING ジョブと、どの RUNNING ジョブにも
//!    属さない外部ユニットを anomaly として追跡（first_detected_at を保持）
//! 2. 条件を満たさなくなった anomaly は削除（回復）
//! 3. grace period を過ぎた anomaly をエスカレーション:
//!    ジョブは FAILED(stuck) にしてからプロセスを停止、孤児プロセスは停止
//!
//! FAILED への遷移を先に行うので、停止による終了コールバックは CAS に負けて
//! no-op になり、stuck のメッセージが残る。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::admission::AdmissionController;
use crate::config::OrchestratorConfig;
use crate::domain::{
    AnomalyKind, AnomalySubject, ExternalRef, Failure, Job, JobFilter, JobId, JobStatus,
    Transition,
};
use crate::error::OrchestratorError;
use crate::ports::{Clock, ExternalWorker, JobStore};

/// Thresholds the reaper applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperPolicy {
    pub running_threshold: Duration,
    pub pending_threshold: Duration,
    pub grace_period: Duration,
    pub require_operator_approval: bool,
}

impl From<&OrchestratorConfig> for ReaperPolicy {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            running_threshold: config.running_threshold(),
            pending_threshold: config.pending_threshold(),
            grace_period: config.grace_period(),
            require_operator_approval: config.require_operator_approval,
        }
    }
}

impl Default for ReaperPolicy {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Subjects currently over a threshold (new or already tracked).
    pub flagged: Vec<AnomalySubject>,

    /// Tracked subjects that no longer qualify and were dropped.
    pub recovered: Vec<AnomalySubject>,

    /// Subjects force-cleaned by this pass.
    pub cleaned: Vec<AnomalySubject>,

    /// Escalations held for an operator.
    pub awaiting_approval: Vec<AnomalySubject>,

    pub admitted: Vec<JobId>,
}

pub struct StuckJobReaper {
    store: Arc<dyn JobStore>,
    worker: Arc<dyn ExternalWorker>,
    clock: Arc<dyn Clock>,
    admission: Arc<AdmissionController>,
    policy: ReaperPolicy,
}

/// What one scan found.
struct Scan {
    jobs: BTreeMap<JobId, Job>,
    suspects: BTreeMap<AnomalySubject, AnomalyKind>,
    /// False when the runtime could not be listed; orphan anomalies are then
    /// neither refreshed nor dropped.
    processes_listed: bool,
}

impl StuckJobReaper {
    pub fn new(
        store: Arc<dyn JobStore>,
        worker: Arc<dyn ExternalWorker>,
        clock: Arc<dyn Clock>,
        admission: Arc<AdmissionController>,
        policy: ReaperPolicy,
    ) -> Self {
        Self {
            store,
            worker,
            clock,
            admission,
            policy,
        }
    }

    pub fn policy(&self) -> &ReaperPolicy {
        &self.policy
    }

    pub async fn run_pass(&self) -> Result<ReapReport, OrchestratorError> {
        let now = self.clock.now();
        let scan = self.scan(now).await?;
        let mut report = ReapReport::default();

        for anomaly in self.store.anomalies().await? {
            if scan.suspects.contains_key(&anomaly.subject) {
                continue;
            }
            if matches!(anomaly.subject, AnomalySubject::Process(_)) && !scan.processes_listed {
                continue;
            }
            if self.store.remove_anomaly(&anomaly.subject).await? {
                info!(subject = %anomaly.subject, kind = %anomaly.kind, "anomaly recovered");
                report.recovered.push(anomaly.subject);
            }
        }

        for (subject, kind) in &scan.suspects {
            let anomaly = self.store.track_anomaly(subject.clone(), *kind, now).await?;
            report.flagged.push(subject.clone());

            if !anomaly.grace_elapsed(now, self.policy.grace_period) {
                if anomaly.first_detected_at == now {
                    warn!(subject = %subject, %kind, "anomaly detected; cleanup after grace period");
                } else {
                    debug!(subject = %subject, %kind, since = %anomaly.first_detected_at, "anomaly persists");
                }
                continue;
            }

            if self.policy.require_operator_approval && !anomaly.approved {
                if !anomaly.awaiting_approval {
                    self.store.mark_awaiting_approval(subject).await?;
                    warn!(subject = %subject, %kind, "cleanup awaiting operator approval");
                }
                report.awaiting_approval.push(subject.clone());
                continue;
            }

            let acted = self.clean_up(subject, &scan.jobs, now).await?;
            self.store.remove_anomaly(subject).await?;
            if acted {
                report.cleaned.push(subject.clone());
            } else {
                report.recovered.push(subject.clone());
            }
        }

        if !report.cleaned.is_empty() {
            report.admitted = self.admission.try_admit_next().await?;
        }
        Ok(report)
    }

    /// Snapshot jobs and processes with admission paused, so a job between
    /// its RUNNING transition and its launch is not taken for an orphan.
    async fn scan(&self, now: DateTime<Utc>) -> Result<Scan, OrchestratorError> {
        let _paused = self.admission.exclusive().await;

        let filter = JobFilter {
            statuses: vec![JobStatus::Pending, JobStatus::Running],
            limit: None,
        };
        let jobs: BTreeMap<JobId, Job> = self
            .store
            .list(&filter)
            .await?
            .into_iter()
            .map(|job| (job.id, job))
            .collect();

        let mut suspects = BTreeMap::new();
        let mut owned = BTreeSet::new();
        for job in jobs.values() {
            let overdue = match job.status {
                JobStatus::Running => {
                    if let Some(reference) = &job.external_reference {
                        owned.insert(reference.clone());
                    }
                    let since = job.started_at.unwrap_or(job.created_at);
                    now - since > self.policy.running_threshold
                }
                JobStatus::Pending => now - job.created_at > self.policy.pending_threshold,
                _ => false,
            };
            if overdue {
                suspects.insert(AnomalySubject::Job(job.id), AnomalyKind::StuckJob);
            }
        }

        let processes_listed = match self.worker.active_references().await {
            Ok(references) => {
                for reference in references {
                    if !owned.contains(&reference) {
                        suspects.insert(AnomalySubject::Process(reference), AnomalyKind::OrphanedProcess);
                    }
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "cannot list external units; orphan detection skipped");
                false
            }
        };

        Ok(Scan {
            jobs,
            suspects,
            processes_listed,
        })
    }

    /// Returns false when the job left its status before it could be failed.
    async fn clean_up(
        &self,
        subject: &AnomalySubject,
        jobs: &BTreeMap<JobId, Job>,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        match subject {
            AnomalySubject::Job(id) => {
                let Some(job) = jobs.get(id) else {
                    return Ok(false);
                };
                match self
                    .store
                    .transition(*id, job.status, Transition::Fail(Failure::stuck()), now)
                    .await
                {
                    Ok(_) => {
                        warn!(job_id = %id, from = %job.status, "stuck job auto-cleaned");
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(job_id = %id, error = %e, "stuck job finished before cleanup");
                        return Ok(false);
                    }
                    Err(e) => return Err(e.into()),
                }
                if let Some(reference) = &job.external_reference {
                    self.terminate(reference).await;
                }
            }
            AnomalySubject::Process(reference) => {
                warn!(reference = %reference, "terminating orphaned process");
                self.terminate(reference).await;
            }
        }
        Ok(true)
    }

    async fn terminate(&self, reference: &ExternalRef) {
        if let Err(e) = self.worker.terminate(reference).await {
            // Still running processes resurface as orphans on the next pass.
            warn!(reference = %reference, error = %e, "terminate failed");
        }
    }
}
