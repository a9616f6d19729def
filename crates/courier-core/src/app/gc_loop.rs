//! GCLoop - 保持期間を過ぎた終端タスクの回収
//!
//! # フロー
//! 1. `gc_interval` ごとに起床
//! 2. `updated_at <= now - retention` の終端レコードを store から削除
//! 3. 削除した id は store 側で tombstone として残る（再投入を拒否するため）

use std::sync::Arc;

use tokio::time::MissedTickBehavior;

use super::scheduler::Inner;

pub(crate) async fn run(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.gc_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // 最初の tick は即時に完了するので読み捨てる
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let evicted = inner.evict_expired();
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted expired tasks");
        }
    }
}
