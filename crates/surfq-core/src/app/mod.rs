//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **OrchestratorBuilder**: 構築とワイヤリング
//! - **Orchestrator**: 外部向け操作と WorkerEvents の受け口
//! - **AdmissionController**: PENDING → RUNNING（並行数の上限を守る）
//! - **ProgressReporter**: 進捗の反映
//! - **StateReconciler**: 記録と実プロセスの突き合わせ
//! - **StuckJobReaper**: 長時間化ジョブ・孤児プロセスの二段階回収

pub mod admission;
pub mod builder;
pub mod orchestrator;
pub mod progress;
pub mod reaper;
pub mod reconciler;

// 主要な型を再エクスポート
pub use self::admission::AdmissionController;
pub use self::builder::{BuildError, OrchestratorBuilder};
pub use self::orchestrator::{MonitorGroup, Orchestrator};
pub use self::progress::ProgressReporter;
pub use self::reaper::{ReapReport, ReaperPolicy, StuckJobReaper};
pub use self::reconciler::{ReconcileMode, ReconcileReport, StateReconciler};
pub use crate::domain::QueueCounts;
