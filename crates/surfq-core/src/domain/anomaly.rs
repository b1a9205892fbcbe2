//! Tracked anomalies: jobs or processes suspected unhealthy, kept by the reaper
//! between first detection and escalation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ExternalRef, JobId};

/// What an anomaly is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AnomalySubject {
    Job(JobId),
    Process(ExternalRef),
}

impl fmt::Display for AnomalySubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalySubject::Job(id) => id.fmt(f),
            AnomalySubject::Process(reference) => write!(f, "process:{reference}"),
        }
    }
}

/// `job-<ulid>` parses as a job subject, anything else as a process reference
/// (an optional `process:` prefix is stripped).
impl FromStr for AnomalySubject {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(reference) = s.strip_prefix("process:") {
            return Ok(AnomalySubject::Process(ExternalRef::new(reference)));
        }
        match s.parse::<JobId>() {
            Ok(id) if s.starts_with("job-") => Ok(AnomalySubject::Job(id)),
            _ => Ok(AnomalySubject::Process(ExternalRef::new(s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// An external unit that no RUNNING job owns.
    OrphanedProcess,

    /// A job over its duration threshold, not confirmed dead.
    StuckJob,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::OrphanedProcess => f.write_str("orphaned_process"),
            AnomalyKind::StuckJob => f.write_str("stuck_job"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAnomaly {
    pub subject: AnomalySubject,
    pub kind: AnomalyKind,
    pub first_detected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,

    /// Escalation is due but waits for an operator (only when approval is required).
    #[serde(default)]
    pub awaiting_approval: bool,

    /// An operator approved cleanup; the next reaper pass acts on it.
    #[serde(default)]
    pub approved: bool,
}

impl TrackedAnomaly {
    pub fn new(subject: AnomalySubject, kind: AnomalyKind, now: DateTime<Utc>) -> Self {
        Self {
            subject,
            kind,
            first_detected_at: now,
            last_seen_at: now,
            awaiting_approval: false,
            approved: false,
        }
    }

    /// Has the anomaly been known for longer than `grace`?
    pub fn grace_elapsed(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now - self.first_detected_at >= grace
    }
}
