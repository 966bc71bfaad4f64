use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::models::{
    CoreError, CoreErrorKind, MinionId, TaskCompletion, TaskDraft, TaskId, TaskRecord, TaskStatus,
};

pub type LedgerResult<T> = Result<T, CoreError>;

pub const DEFAULT_COMPLETED_CAPACITY: usize = 100;

/// Counters derived from the ledger views.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LedgerMetrics {
    pub active_count: usize,
    pub pending_count: usize,
    pub total_completed: usize,
    /// Percentage of failed (error or cancelled) tasks in the completed view.
    pub error_rate: f64,
}

/// Authoritative in-memory record of every task submitted in this process.
pub struct TaskLedger {
    state: Mutex<LedgerState>,
}

struct LedgerState {
    completed_capacity: usize,
    tasks: HashMap<TaskId, TaskRecord>,
    pending: Vec<TaskId>,
    completed: VecDeque<TaskId>,
    live: BTreeMap<TaskId, TaskStatus>,
    failed_in_view: usize,
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETED_CAPACITY)
    }
}

impl TaskLedger {
    pub fn new(completed_capacity: usize) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                completed_capacity: completed_capacity.max(1),
                tasks: HashMap::new(),
                pending: Vec::new(),
                completed: VecDeque::new(),
                live: BTreeMap::new(),
                failed_in_view: 0,
            }),
        }
    }

    pub fn insert(&self, record: TaskRecord) -> LedgerResult<()> {
        let mut state = self.lock_state()?;
        if state.tasks.contains_key(&record.task_id) {
            return Err(CoreError::new(
                CoreErrorKind::Conflict,
                format!("task id '{}' is already recorded", record.task_id),
            )
            .task(record.task_id));
        }
        state.admit(record);
        Ok(())
    }

    /// Assigns a unique id of the form `{gadget}_{mode}_{unix_secs}` (with a
    /// numeric suffix on collision) and inserts the record as pending.
    pub fn insert_new(&self, draft: TaskDraft) -> LedgerResult<TaskRecord> {
        let mut state = self.lock_state()?;
        let base = task_id_base(&draft.gadget_id, &draft.mode, draft.submitted_at);

        let mut task_id = TaskId(base.clone());
        let mut attempt = 1u32;
        while state.tasks.contains_key(&task_id) {
            attempt = attempt.saturating_add(1);
            task_id = TaskId(format!("{base}_{attempt}"));
        }

        let record = draft.into_record(task_id);
        state.admit(record.clone());
        Ok(record)
    }

    /// Applies a status change. Terminal records never change again; a
    /// transition against one fails with `Conflict` and mutates nothing.
    pub fn transition(
        &self,
        task_id: &TaskId,
        next: TaskStatus,
        completion: TaskCompletion,
    ) -> LedgerResult<TaskRecord> {
        let mut state = self.lock_state()?;
        let current = state
            .tasks
            .get(task_id)
            .map(|record| record.status)
            .ok_or_else(|| not_found(task_id))?;

        if !current.can_transition_to(next) {
            return Err(CoreError::new(
                CoreErrorKind::Conflict,
                format!("task '{task_id}' cannot transition from '{current:?}' to '{next:?}'"),
            )
            .task(task_id.clone()));
        }

        let record = {
            let Some(record) = state.tasks.get_mut(task_id) else {
                return Err(not_found(task_id));
            };
            record.status = next;
            if completion.outcome.is_some() {
                record.outcome = completion.outcome;
            }
            if completion.error.is_some() {
                record.error = completion.error;
            }
            if next.is_terminal() {
                let now = SystemTime::now();
                record.completed_at = Some(now);
                record.execution_duration = now.duration_since(record.submitted_at).ok();
            }
            record.clone()
        };

        if next.is_terminal() {
            state.retire(task_id, next);
        } else {
            state.live.insert(task_id.clone(), next);
        }

        Ok(record)
    }

    /// Moves a pending task to busy. Already-busy tasks are left as they are;
    /// terminal tasks fail with `Conflict`.
    pub fn mark_busy(&self, task_id: &TaskId) -> LedgerResult<TaskStatus> {
        let current = {
            let state = self.lock_state()?;
            state
                .tasks
                .get(task_id)
                .map(|record| record.status)
                .ok_or_else(|| not_found(task_id))?
        };
        match current {
            TaskStatus::Busy => Ok(TaskStatus::Busy),
            TaskStatus::Pending => match self.transition(task_id, TaskStatus::Busy, TaskCompletion::none()) {
                Ok(record) => Ok(record.status),
                Err(error) if error.kind == CoreErrorKind::Conflict => {
                    match self.status(task_id)? {
                        Some(TaskStatus::Busy) => Ok(TaskStatus::Busy),
                        _ => Err(error),
                    }
                }
                Err(error) => Err(error),
            },
            terminal => Err(CoreError::new(
                CoreErrorKind::Conflict,
                format!("task '{task_id}' already finished as '{terminal:?}'"),
            )
            .task(task_id.clone())),
        }
    }

    pub fn assign_minion(&self, task_id: &TaskId, minion: MinionId) -> LedgerResult<()> {
        let mut state = self.lock_state()?;
        let record = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| not_found(task_id))?;
        if !record.status.is_terminal() {
            record.minion = Some(minion);
        }
        Ok(())
    }

    pub fn get(&self, task_id: &TaskId) -> LedgerResult<TaskRecord> {
        let state = self.lock_state()?;
        state
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| not_found(task_id))
    }

    pub fn status(&self, task_id: &TaskId) -> LedgerResult<Option<TaskStatus>> {
        let state = self.lock_state()?;
        Ok(state.tasks.get(task_id).map(|record| record.status))
    }

    /// Most recently completed first, at most `limit` entries.
    pub fn completed(&self, limit: usize) -> LedgerResult<Vec<TaskRecord>> {
        let state = self.lock_state()?;
        Ok(state
            .completed
            .iter()
            .take(limit)
            .filter_map(|task_id| state.tasks.get(task_id).cloned())
            .collect())
    }

    /// Non-terminal tasks in submission order.
    pub fn pending(&self) -> LedgerResult<Vec<TaskRecord>> {
        let state = self.lock_state()?;
        Ok(state
            .pending
            .iter()
            .filter_map(|task_id| state.tasks.get(task_id).cloned())
            .collect())
    }

    pub fn live_status(&self) -> LedgerResult<BTreeMap<TaskId, TaskStatus>> {
        Ok(self.lock_state()?.live.clone())
    }

    pub fn metrics(&self) -> LedgerResult<LedgerMetrics> {
        let state = self.lock_state()?;
        let total_completed = state.completed.len();
        Ok(LedgerMetrics {
            active_count: state
                .live
                .values()
                .filter(|status| **status == TaskStatus::Busy)
                .count(),
            pending_count: state.pending.len(),
            total_completed,
            error_rate: state.failed_in_view as f64 / total_completed.max(1) as f64 * 100.0,
        })
    }

    fn lock_state(&self) -> LedgerResult<MutexGuard<'_, LedgerState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(CoreErrorKind::Internal, "task ledger mutex poisoned")
        })
    }
}

impl LedgerState {
    fn admit(&mut self, record: TaskRecord) {
        let task_id = record.task_id.clone();
        let status = record.status;
        self.tasks.insert(task_id.clone(), record);
        if status.is_terminal() {
            self.retire(&task_id, status);
        } else {
            self.pending.push(task_id.clone());
            self.live.insert(task_id, status);
        }
    }

    fn retire(&mut self, task_id: &TaskId, status: TaskStatus) {
        self.pending.retain(|pending| pending != task_id);
        self.live.remove(task_id);

        self.completed.push_front(task_id.clone());
        if status.is_failure() {
            self.failed_in_view += 1;
        }

        while self.completed.len() > self.completed_capacity {
            let Some(evicted) = self.completed.pop_back() else {
                break;
            };
            let evicted_failed = self
                .tasks
                .get(&evicted)
                .is_some_and(|record| record.status.is_failure());
            if evicted_failed {
                self.failed_in_view = self.failed_in_view.saturating_sub(1);
            }
        }
    }
}

fn task_id_base(gadget_id: &str, mode: &str, submitted_at: SystemTime) -> String {
    let secs = submitted_at
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    format!("{gadget_id}_{mode}_{secs}")
}

fn not_found(task_id: &TaskId) -> CoreError {
    CoreError::new(
        CoreErrorKind::NotFound,
        format!("unknown task id '{task_id}'"),
    )
    .task(task_id.clone())
}
