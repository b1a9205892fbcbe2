//! surfq-core
//!
//! FreeSurfer ジョブのオーケストレーション・コア。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, state, errors, anomaly）
//! - **ports**: 抽象化レイヤー（JobStore, ExternalWorker, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（admission, progress, reconciler, reaper, orchestrator）
//! - **impls**: 実装（InMemoryJobStore, FileJobStore, ProcessWorker, ManualWorker）
//! - **config**: TOML 設定
//! - **error**: 外部向け操作のエラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use app::{Orchestrator, OrchestratorBuilder};
pub use config::Settings;
pub use error::OrchestratorError;
