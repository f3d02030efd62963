//! In-memory queue implementation.
//!
//! Single-process backend: one `Mutex` guards every record, so claim is
//! trivially exclusive. Used by tests and by embedders that run producer and
//! worker in the same process. Nothing survives a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::app::status::QueueCounts;
use crate::domain::{NewTask, Role, TaskId, TaskRecord, TaskResult, TaskStatus};
use crate::error::QueueError;
use crate::ports::{Clock, IdGenerator, QueueStore, StrandedTask, SystemClock, UlidGenerator};

/// In-memory queue state.
#[derive(Default)]
struct MemoryQueueState {
    /// All task records (single source of truth).
    records: HashMap<TaskId, TaskRecord>,

    /// Pending ids in enqueue order (TaskIds only).
    pending: VecDeque<TaskId>,
}

pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            ids: Box::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, task: NewTask) -> Result<TaskRecord, QueueError> {
        let (id, role, payload) = task.validate()?;
        let id = id.unwrap_or_else(|| self.ids.generate_task_id());

        let mut state = self.state.lock().await;
        if state.records.contains_key(&id) {
            return Err(QueueError::Validation(format!("task {id} already exists")));
        }
        let record = TaskRecord::new(id.clone(), role, payload, self.clock.now());
        state.records.insert(id.clone(), record.clone());
        state.pending.push_back(id);
        Ok(record)
    }

    async fn claim(&self, role: &Role) -> Result<Option<TaskRecord>, QueueError> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        // Role filter: other roles stay in place, untouched.
        let Some(pos) = state.pending.iter().position(|id| {
            state
                .records
                .get(id)
                .is_some_and(|record| record.role() == role)
        }) else {
            return Ok(None);
        };

        let Some(id) = state.pending.remove(pos) else {
            return Ok(None);
        };
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(None);
        };
        record
            .start_processing(self.clock.now())
            .map_err(|_| QueueError::ClaimConflict(id.clone()))?;
        Ok(Some(record.clone()))
    }

    async fn complete(&self, id: &TaskId, result: TaskResult) -> Result<TaskRecord, QueueError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        record
            .complete(result, self.clock.now())
            .map_err(|_| QueueError::NotFound(id.clone()))?;
        Ok(record.clone())
    }

    async fn fail(&self, id: &TaskId, error: &str) -> Result<TaskRecord, QueueError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        record
            .fail(error, self.clock.now())
            .map_err(|_| QueueError::NotFound(id.clone()))?;
        Ok(record.clone())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.records.get(id).cloned())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for record in state.records.values() {
            counts.add(record.status(), 1);
        }
        Ok(counts)
    }

    async fn stranded(&self) -> Result<Vec<StrandedTask>, QueueError> {
        let state = self.state.lock().await;
        let mut stranded: Vec<StrandedTask> = state
            .records
            .values()
            .filter(|record| record.status() == TaskStatus::Processing)
            .map(|record| StrandedTask {
                id: record.id().clone(),
                role: record.role().clone(),
                embedded_status: record.status(),
            })
            .collect();
        stranded.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stranded)
    }
}
