//! courier-core
//!
//! Core building blocks for the Courier upload scheduler.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, outcome, attempt, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, UploadExecutor, Clock, IdGenerator）
//! - **store**: TaskRecord と InMemoryTaskStore
//! - **app**: スケジューラ本体（builder, scheduler, dispatch, worker_loop, gc_loop, retry）
//! - **impls**: ports の実装（LocalFileExecutor）
//! - **service**: アップロード要求の検証とタスク投入

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod service;
pub mod store;

pub use app::{Scheduler, SchedulerBuilder, SchedulerConfig, ShutdownReport, StateCounts};
pub use domain::{Task, TaskId, TaskState};
