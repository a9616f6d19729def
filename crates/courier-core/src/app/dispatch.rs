//! Dispatch - デバイス別キューとラウンドロビン
//!
//! # 設計
//! - デバイスごとに FIFO キュー（TaskId のみ保持、状態は TaskStore が正本）
//! - 待ち行列を持つデバイスの明示的なローテーション（HashMap の走査順には頼らない）
//! - 1 デバイスあたり同時実行数の上限 `K`
//! - バックオフ中のタスクは飛ばす（FIFO の唯一の例外）
//! - キャンセル済みなどの古いエントリは走査中に取り除く

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;

use crate::domain::{DeviceId, SchedulerError, TaskId, TaskState};
use crate::ports::TaskStore;
use crate::store::TaskSnapshot;

/// Result of one scan over the ready queues.
#[derive(Debug)]
pub enum Pick {
    /// A task moved Queued -> Running; the caller now owns it.
    Claimed(TaskSnapshot),

    /// Nothing claimable. `next_wake` is the earliest backoff deadline seen.
    Idle { next_wake: Option<Instant> },
}

pub struct DispatchQueues {
    queues: HashMap<DeviceId, VecDeque<TaskId>>,

    /// Devices with a non-empty queue, in service order.
    rotation: VecDeque<DeviceId>,

    running: HashMap<DeviceId, usize>,
    per_device_limit: usize,
}

impl DispatchQueues {
    pub fn new(per_device_limit: usize) -> Self {
        Self {
            queues: HashMap::new(),
            rotation: VecDeque::new(),
            running: HashMap::new(),
            per_device_limit,
        }
    }

    /// Appends `id` to the back of its device's queue.
    pub fn push(&mut self, device: DeviceId, id: TaskId) {
        let queue = self.queues.entry(device.clone()).or_default();
        if queue.is_empty() {
            self.rotation.push_back(device);
        }
        queue.push_back(id);
    }

    /// Frees one running slot of `device`.
    pub fn release(&mut self, device: &DeviceId) {
        if let Some(n) = self.running.get_mut(device) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.running.remove(device);
            }
        }
    }

    pub fn running(&self, device: &DeviceId) -> usize {
        self.running.get(device).copied().unwrap_or(0)
    }

    /// Queue entries, including stale ones not yet pruned.
    pub fn queued_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Devices in the order they will be visited.
    pub fn rotation(&self) -> impl Iterator<Item = &DeviceId> {
        self.rotation.iter()
    }

    /// Drops every queue entry. Running slots are untouched.
    pub fn clear_queues(&mut self) -> Vec<TaskId> {
        self.rotation.clear();
        self.queues.drain().flat_map(|(_, q)| q).collect()
    }

    /// Claims the next eligible task.
    ///
    /// Devices are visited front to back; a device at its cap is skipped, and
    /// within a device the first ready entry wins. `claim` performs the
    /// Queued -> Running CAS; if it fails the entry is stale and is dropped.
    /// The served device moves to the back of the rotation.
    pub fn next_ready(
        &mut self,
        now: Instant,
        store: &dyn TaskStore,
        claim: &mut dyn FnMut(TaskId) -> Result<TaskSnapshot, SchedulerError>,
    ) -> Pick {
        let mut next_wake: Option<Instant> = None;
        let mut i = 0;

        while i < self.rotation.len() {
            let device = self.rotation[i].clone();
            if self.running(&device) >= self.per_device_limit {
                i += 1;
                continue;
            }

            let mut claimed = None;
            if let Some(queue) = self.queues.get_mut(&device) {
                let mut j = 0;
                while j < queue.len() {
                    let id = queue[j];
                    let readiness = match store.readiness(id) {
                        Ok(r) if r.state == TaskState::Queued => r,
                        // Cancelled while queued, or gone.
                        _ => {
                            queue.remove(j);
                            continue;
                        }
                    };
                    if !readiness.is_ready(now) {
                        if let Some(at) = readiness.next_eligible_at {
                            next_wake = Some(next_wake.map_or(at, |w| w.min(at)));
                        }
                        j += 1;
                        continue;
                    }
                    queue.remove(j);
                    match claim(id) {
                        Ok(snapshot) => {
                            claimed = Some(snapshot);
                            break;
                        }
                        Err(e) => {
                            tracing::debug!(task_id = %id, error = %e, "dropping stale queue entry");
                        }
                    }
                }
            }

            let exhausted = self.queues.get(&device).is_none_or(VecDeque::is_empty);
            if exhausted {
                self.queues.remove(&device);
                self.rotation.remove(i);
            }

            if let Some(snapshot) = claimed {
                *self.running.entry(device.clone()).or_default() += 1;
                if !exhausted {
                    self.rotation.remove(i);
                    self.rotation.push_back(device);
                }
                return Pick::Claimed(snapshot);
            }

            if !exhausted {
                i += 1;
            }
        }

        Pick::Idle { next_wake }
    }
}
