//! OrchestratorBuilder - Orchestrator の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - Admission → Orchestrator の循環参照は `Arc::new_cyclic` + `Weak` で解く

use std::sync::{Arc, Weak};

use super::admission::AdmissionController;
use super::orchestrator::Orchestrator;
use super::progress::ProgressReporter;
use super::reaper::{ReaperPolicy, StuckJobReaper};
use super::reconciler::StateReconciler;
use crate::config::{ConfigError, OrchestratorConfig};
use crate::ports::{
    Clock, ExternalWorker, IdGenerator, JobStore, SystemClock, UlidGenerator, WorkerEvents,
};

/// OrchestratorBuilder は Orchestrator を構築
///
/// # 使用例
/// ```ignore
/// let orchestrator = OrchestratorBuilder::new()
///     .store(Arc::new(FileJobStore::open("/var/lib/surfq/jobs.json").await?))
///     .worker(Arc::new(ProcessWorker::new(settings.worker.clone())))
///     .config(settings.orchestrator.clone())
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - store / worker が未設定なら BuildError
/// - config の検証に失敗したら BuildError
pub struct OrchestratorBuilder {
    store: Option<Arc<dyn JobStore>>,
    worker: Option<Arc<dyn ExternalWorker>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    config: OrchestratorConfig,
    launch_enabled: bool,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no job store configured")]
    MissingStore,

    #[error("no external worker configured")]
    MissingWorker,

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            worker: None,
            clock: Arc::new(SystemClock),
            ids: None,
            config: OrchestratorConfig::default(),
            launch_enabled: true,
        }
    }

    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn worker(mut self, worker: Arc<dyn ExternalWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to a `UlidGenerator` on the configured clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// A passive orchestrator records submissions and operator actions but
    /// never launches; the CLI uses this so only `serve` starts units.
    pub fn passive(mut self) -> Self {
        self.launch_enabled = false;
        self
    }

    pub fn build(self) -> Result<Arc<Orchestrator>, BuildError> {
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let worker = self.worker.ok_or(BuildError::MissingWorker)?;
        let clock = self.clock;
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let config = self.config;
        let launch_enabled = self.launch_enabled;

        Ok(Arc::new_cyclic(|me: &Weak<Orchestrator>| {
            let events: Weak<dyn WorkerEvents> = me.clone();
            let admission = Arc::new(AdmissionController::new(
                Arc::clone(&store),
                Arc::clone(&worker),
                Arc::clone(&clock),
                ids,
                events,
                config.concurrency_limit,
                config.queue_depth_limit,
                launch_enabled,
            ));
            let reconciler = StateReconciler::new(
                Arc::clone(&store),
                Arc::clone(&worker),
                Arc::clone(&clock),
                Arc::clone(&admission),
            );
            let reaper = StuckJobReaper::new(
                Arc::clone(&store),
                Arc::clone(&worker),
                Arc::clone(&clock),
                Arc::clone(&admission),
                ReaperPolicy::from(&config),
            );
            Orchestrator {
                progress: ProgressReporter::new(Arc::clone(&store)),
                store,
                worker,
                clock,
                admission,
                reconciler,
                reaper,
                config,
            }
        }))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
