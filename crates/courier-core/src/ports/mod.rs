//! Ports - 抽象化レイヤー
//!
//! スケジューラが外部（時刻・ID 採番・状態の保存先・実際の転送処理）に
//! 依存する箇所を trait として切り出します。
//!
//! # 設計原則
//! - TaskStore が状態の正本（source of truth）
//! - dispatch キューは TaskId のみを持つ
//! - UploadExecutor は結果を返すだけで状態を変えない

pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod task_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::UploadExecutor;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{Readiness, TaskFilter, TaskStore};
