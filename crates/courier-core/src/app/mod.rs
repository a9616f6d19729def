//! App - アプリケーション層
//!
//! ports を組み合わせてスケジューラを実装します。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: 構築とワイヤリング（起動時検証）
//! - **Scheduler**: submit / cancel / status / shutdown の表面
//! - **DispatchQueues**: デバイス別 FIFO とラウンドロビン
//! - **WorkerLoop**: claim → execute → decide → complete
//! - **GCLoop**: 保持期間を過ぎた終端タスクの回収

pub mod builder;
pub mod config;
pub mod dispatch;
mod gc_loop;
pub mod retry;
pub mod scheduler;
pub mod status;
mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, SchedulerBuilder};
pub use self::config::{ConfigError, SchedulerConfig};
pub use self::dispatch::{DispatchQueues, Pick};
pub use self::retry::{Decision, RetryPolicy};
pub use self::scheduler::{Scheduler, ShutdownReport};
pub use self::status::StateCounts;
