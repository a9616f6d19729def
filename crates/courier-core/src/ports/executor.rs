//! UploadExecutor port - 1 回の試行で実際の転送を行う
//!
//! # 設計原則
//! - Executor は結果（Receipt / ExecuteError）を返すだけで、状態は変更しない
//! - 状態遷移はすべて Scheduler が TaskStore の CAS で行う
//! - キャンセルは協調的: `cancel` を適度な間隔で確認し、立っていたら
//!   `ExecuteError::Cancelled` ですぐに返す

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{ExecuteError, Receipt, Task};

#[async_trait]
pub trait UploadExecutor: Send + Sync {
    async fn execute(&self, task: &Task, cancel: CancellationToken)
    -> Result<Receipt, ExecuteError>;
}
