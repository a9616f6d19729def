//! SchedulerBuilder - スケジューラの構築とワイヤリング
//!
//! # 方針
//! - 起動時検証（Fail-fast）: 設定の誤りや executor 未指定は build() で弾く
//! - store / clock は省略可能（インメモリ store とシステム時計を使う）

use std::sync::Arc;

use super::config::{ConfigError, SchedulerConfig};
use super::scheduler::Scheduler;
use crate::ports::{Clock, SystemClock, TaskStore, UploadExecutor};
use crate::store::InMemoryTaskStore;

/// BuildError はスケジューラ構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no upload executor was configured")]
    MissingExecutor,

    #[error("invalid scheduler config: {0}")]
    Config(#[from] ConfigError),
}

/// # 使用例
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .config(config)
///     .executor(LocalFileExecutor::new(root))
///     .build()?;
/// ```
#[derive(Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn TaskStore>>,
    executor: Option<Arc<dyn UploadExecutor>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn executor(mut self, executor: impl UploadExecutor + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub fn shared_executor(mut self, executor: Arc<dyn UploadExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates everything, then starts the workers.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn build(self) -> Result<Scheduler, BuildError> {
        let executor = self.executor.ok_or(BuildError::MissingExecutor)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::with_clock(Arc::clone(&clock))));

        Ok(Scheduler::start(self.config, store, executor, clock)?)
    }
}
