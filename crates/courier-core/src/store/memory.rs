//! In-memory task store.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{TaskRecord, TaskSnapshot};
use crate::app::status::StateCounts;
use crate::domain::{SchedulerError, TaskId, TaskState};
use crate::ports::task_store::{Readiness, TaskFilter, TaskStore};
use crate::ports::{Clock, SystemClock};

/// In-memory store state.
struct StoreState {
    /// All task records, keyed (and therefore listed) by id.
    records: BTreeMap<TaskId, TaskRecord>,

    /// Ids evicted after retention. Kept so an id is never accepted twice.
    /// Grows by one 16-byte id per evicted task for the store's lifetime;
    /// retention bounds the records, not this set.
    tombstones: HashSet<TaskId>,
}

/// Arena of task records behind a single mutex.
///
/// Every read and write goes through the one lock; no method awaits while
/// holding it.
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                records: BTreeMap::new(),
                tombstones: HashSet::new(),
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // A panic elsewhere never leaves a record half-written: mutators run
        // before the state field is committed.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, record: TaskRecord) -> Result<(), SchedulerError> {
        let mut state = self.lock();
        let id = record.id();
        if state.records.contains_key(&id) || state.tombstones.contains(&id) {
            return Err(SchedulerError::DuplicateTask(id));
        }
        state.records.insert(id, record);
        Ok(())
    }

    fn get(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        self.lock()
            .records
            .get(&id)
            .map(TaskRecord::snapshot)
            .ok_or(SchedulerError::NotFound(id))
    }

    fn readiness(&self, id: TaskId) -> Result<Readiness, SchedulerError> {
        self.lock()
            .records
            .get(&id)
            .map(|r| Readiness {
                state: r.state,
                next_eligible_at: r.next_eligible_at,
            })
            .ok_or(SchedulerError::NotFound(id))
    }

    fn compare_and_swap(
        &self,
        id: TaskId,
        expected: TaskState,
        new: TaskState,
        mutator: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<TaskSnapshot, SchedulerError> {
        let now = self.clock.now();
        let mut state = self.lock();
        let record = state
            .records
            .get_mut(&id)
            .ok_or(SchedulerError::NotFound(id))?;

        if record.state != expected {
            return Err(SchedulerError::StateConflict {
                id,
                expected,
                actual: record.state,
            });
        }
        if !expected.can_transition_to(new) {
            return Err(SchedulerError::IllegalTransition {
                id,
                from: expected,
                to: new,
            });
        }

        mutator(record);
        record.state = new;
        record.updated_at = now;
        record.normalize();
        Ok(record.snapshot())
    }

    fn list(&self, filter: TaskFilter) -> Box<dyn Iterator<Item = TaskSnapshot> + Send + '_> {
        let ids: Vec<TaskId> = self.lock().records.keys().copied().collect();
        Box::new(TaskIter {
            store: self,
            ids: ids.into_iter(),
            filter,
        })
    }

    fn evict_terminal(&self, cutoff: DateTime<Utc>) -> Vec<TaskId> {
        let mut state = self.lock();
        let expired: Vec<TaskId> = state
            .records
            .values()
            .filter(|r| r.state.is_terminal() && r.updated_at <= cutoff)
            .map(TaskRecord::id)
            .collect();
        for id in &expired {
            state.records.remove(id);
            state.tombstones.insert(*id);
        }
        expired
    }

    fn counts(&self) -> StateCounts {
        let state = self.lock();
        let mut counts = StateCounts::default();
        for record in state.records.values() {
            counts.add(record.state);
        }
        counts
    }
}

/// Lazy iterator returned by [`InMemoryTaskStore::list`].
struct TaskIter<'a> {
    store: &'a InMemoryTaskStore,
    ids: std::vec::IntoIter<TaskId>,
    filter: TaskFilter,
}

impl Iterator for TaskIter<'_> {
    type Item = TaskSnapshot;

    fn next(&mut self) -> Option<TaskSnapshot> {
        for id in self.ids.by_ref() {
            let state = self.store.lock();
            // Evicted since the scan started: skip.
            let Some(record) = state.records.get(&id) else {
                continue;
            };
            if self.filter.matches(&record.task, record.state) {
                return Some(record.snapshot());
            }
        }
        None
    }
}
