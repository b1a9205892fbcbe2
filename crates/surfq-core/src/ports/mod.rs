//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（状態ファイル、コンテナランタイムなど）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - JobStore が source of truth（正本）
//! - ExternalWorker は生存確認と終了通知だけを公開する

pub mod clock;
pub mod id_generator;
pub mod job_store;
pub mod worker;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_store::{JobStore, StoreError};
pub use self::worker::{ExternalWorker, WorkerError, WorkerEvents, WorkerOutcome};
