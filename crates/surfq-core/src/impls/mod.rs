//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryJobStore**: テスト・dry run 用の正本
//! - **FileJobStore**: JSON スナップショットによる永続ストア（本番用）
//! - **ProcessWorker**: コマンドテンプレートで外部ユニットを起動（本番用）
//! - **ManualWorker**: 明示的に操作する in-process アダプタ（テスト用）

pub mod file_store;
pub mod manual_worker;
pub mod memory_store;
pub mod process_worker;
pub mod recon_progress;
mod store_state;

// 主要な型を再エクスポート
pub use self::file_store::FileJobStore;
pub use self::manual_worker::ManualWorker;
pub use self::memory_store::InMemoryJobStore;
pub use self::process_worker::ProcessWorker;
