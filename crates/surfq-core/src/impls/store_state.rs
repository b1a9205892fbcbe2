//! Store state shared by the in-memory and file-backed stores.
//!
//! Every method runs under the owner's lock, which is what makes the
//! compare-and-swap in `transition` and the capacity check in `submit` atomic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AnomalyKind, AnomalySubject, ExternalRef, Job, JobFilter, JobId, JobStatus, ProgressUpdate,
    QueueCounts, TrackedAnomaly, Transition,
};
use crate::ports::StoreError;

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    jobs: BTreeMap<JobId, Job>,
    anomalies: BTreeMap<AnomalySubject, TrackedAnomaly>,
}

/// On-disk form of `StoreState`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub anomalies: Vec<TrackedAnomaly>,
}

pub(crate) const SNAPSHOT_VERSION: u32 = 1;

impl StoreState {
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            jobs: snapshot.jobs.into_iter().map(|job| (job.id, job)).collect(),
            anomalies: snapshot
                .anomalies
                .into_iter()
                .map(|anomaly| (anomaly.subject.clone(), anomaly))
                .collect(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            jobs: self.jobs.values().cloned().collect(),
            anomalies: self.anomalies.values().cloned().collect(),
        }
    }

    fn count(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|job| job.status == status).count()
    }

    pub fn submit(&mut self, job: Job, max_pending: usize) -> Result<JobId, StoreError> {
        let pending = self.count(JobStatus::Pending);
        if pending >= max_pending {
            return Err(StoreError::QueueFull {
                pending,
                limit: max_pending,
            });
        }
        let id = job.id;
        self.jobs.insert(id, job);
        Ok(id)
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.get(&id).cloned()
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(Job::queue_key);
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        jobs
    }

    pub fn transition(
        &mut self,
        id: JobId,
        from: JobStatus,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != from {
            return Err(StoreError::Conflict {
                id,
                expected: from,
                actual: job.status,
            });
        }
        let to = change.target();
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        job.apply(change, now);
        Ok(job.clone())
    }

    pub fn attach_reference(&mut self, id: JobId, reference: ExternalRef) -> Result<Job, StoreError> {
        let job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != JobStatus::Running {
            return Err(StoreError::Conflict {
                id,
                expected: JobStatus::Running,
                actual: job.status,
            });
        }
        job.external_reference = Some(reference);
        Ok(job.clone())
    }

    pub fn update_progress(
        &mut self,
        id: JobId,
        reference: Option<&ExternalRef>,
        progress: u8,
        step: &str,
    ) -> Result<(ProgressUpdate, bool), StoreError> {
        let job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != JobStatus::Running {
            return Ok((ProgressUpdate::Stale, false));
        }
        if let (Some(current), Some(reported)) = (job.external_reference.as_ref(), reference)
            && current != reported
        {
            return Ok((ProgressUpdate::Stale, false));
        }
        let changed = job.record_progress(progress, step);
        Ok((ProgressUpdate::Applied, changed))
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn track_anomaly(
        &mut self,
        subject: AnomalySubject,
        kind: AnomalyKind,
        now: DateTime<Utc>,
    ) -> TrackedAnomaly {
        let anomaly = self
            .anomalies
            .entry(subject.clone())
            .and_modify(|existing| {
                existing.last_seen_at = now;
                existing.kind = kind;
            })
            .or_insert_with(|| TrackedAnomaly::new(subject, kind, now));
        anomaly.clone()
    }

    pub fn anomalies(&self) -> Vec<TrackedAnomaly> {
        self.anomalies.values().cloned().collect()
    }

    pub fn mark_awaiting_approval(&mut self, subject: &AnomalySubject) -> Result<(), StoreError> {
        let anomaly = self
            .anomalies
            .get_mut(subject)
            .ok_or_else(|| StoreError::AnomalyNotFound(subject.clone()))?;
        anomaly.awaiting_approval = true;
        Ok(())
    }

    pub fn approve_anomaly(&mut self, subject: &AnomalySubject) -> Result<(), StoreError> {
        let anomaly = self
            .anomalies
            .get_mut(subject)
            .ok_or_else(|| StoreError::AnomalyNotFound(subject.clone()))?;
        anomaly.approved = true;
        Ok(())
    }

    pub fn remove_anomaly(&mut self, subject: &AnomalySubject) -> bool {
        self.anomalies.remove(subject).is_some()
    }

    /// Insert a record as-is, bypassing every check.
    #[cfg(test)]
    pub fn insert_raw(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }
}
