//! Errors - ジョブ失敗の分類
//!
//! Job に記録される失敗（error_message + failure_kind）の分類です。
//! ここにあるのは「ジョブの結果」としての失敗で、API 呼び出しのエラー
//! （StoreError, WorkerError, OrchestratorError）とは別物です。

use std::fmt;

use serde::{Deserialize, Serialize};

/// FailureKind は FAILED ジョブの原因分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The external runtime could not be started. Not retried automatically.
    Launch,

    /// Non-zero exit, missing expected outputs, or abnormal termination.
    Processing,

    /// The external process vanished without a terminal signal.
    Interrupted,

    /// Exceeded its duration threshold and the grace period.
    Stuck,

    /// Failed by an operator.
    Operator,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Launch => "launch",
            FailureKind::Processing => "processing",
            FailureKind::Interrupted => "interrupted",
            FailureKind::Stuck => "stuck",
            FailureKind::Operator => "operator",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const INTERRUPTED_PROCESS_NOT_FOUND: &str = "interrupted: external process not found";
pub const INTERRUPTED_NO_REFERENCE: &str = "interrupted: no external reference recorded";
pub const STUCK_AUTO_CLEANED: &str = "stuck job auto-cleaned after grace period";

/// A classified failure as it is stored on the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn launch(cause: impl fmt::Display) -> Self {
        Self {
            kind: FailureKind::Launch,
            message: format!("launch error: {cause}"),
        }
    }

    pub fn processing(detail: impl fmt::Display) -> Self {
        Self {
            kind: FailureKind::Processing,
            message: format!("processing error: {detail}"),
        }
    }

    pub fn process_not_found() -> Self {
        Self {
            kind: FailureKind::Interrupted,
            message: INTERRUPTED_PROCESS_NOT_FOUND.to_string(),
        }
    }

    pub fn no_reference() -> Self {
        Self {
            kind: FailureKind::Interrupted,
            message: INTERRUPTED_NO_REFERENCE.to_string(),
        }
    }

    pub fn stuck() -> Self {
        Self {
            kind: FailureKind::Stuck,
            message: STUCK_AUTO_CLEANED.to_string(),
        }
    }

    pub fn operator(reason: impl fmt::Display) -> Self {
        Self {
            kind: FailureKind::Operator,
            message: format!("operator: {reason}"),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
