use thiserror::Error;

use crate::domain::{JobId, JobStatus};
use crate::ports::{StoreError, WorkerError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The PENDING queue is at its depth limit; no job was created.
    #[error("capacity exceeded: {pending} jobs pending (limit {limit})")]
    Capacity { pending: usize, limit: usize },

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} is {status}: {reason}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        reason: &'static str,
    },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::QueueFull { pending, limit } => OrchestratorError::Capacity { pending, limit },
            StoreError::NotFound(id) => OrchestratorError::NotFound(id),
            other => OrchestratorError::Store(other),
        }
    }
}
