//! Domain model (ids, job record, status machine, failure taxonomy, anomalies).

pub mod anomaly;
pub mod errors;
pub mod ids;
pub mod job;
pub mod state;
pub mod status;

pub use anomaly::{AnomalyKind, AnomalySubject, TrackedAnomaly};
pub use errors::{Failure, FailureKind};
pub use ids::{ExternalRef, IdParseError, JobId};
pub use job::{Job, JobFilter, JobInput, JobView, ProgressUpdate, Transition};
pub use state::JobStatus;
pub use status::QueueCounts;
