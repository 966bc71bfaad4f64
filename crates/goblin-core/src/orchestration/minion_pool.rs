use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinError};

use crate::models::{CoreError, CoreErrorKind, ExecutionOutcome, MinionId, TaskId};
use crate::orchestration::{
    CancellationMode, ExecutionSignals, OrchestrationResult, TaskCancellationToken,
};

pub type TaskOperation = Box<
    dyn FnOnce(
            ExecutionSignals,
        ) -> Pin<Box<dyn Future<Output = OrchestrationResult<ExecutionOutcome>> + Send>>
        + Send,
>;

/// How a task left the pool. Delivered exactly once, unless the task was aborted.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionReport {
    Finished(ExecutionOutcome),
    Faulted(CoreError),
    TimedOut(Duration),
    Cancelled,
}

pub struct CompletionHooks {
    on_admit: Box<dyn FnOnce(MinionId) + Send>,
    on_complete: Box<dyn FnOnce(ExecutionReport) + Send>,
}

impl CompletionHooks {
    pub fn new(on_complete: impl FnOnce(ExecutionReport) + Send + 'static) -> Self {
        Self {
            on_admit: Box::new(|_| {}),
            on_complete: Box::new(on_complete),
        }
    }

    pub fn on_admit(mut self, on_admit: impl FnOnce(MinionId) + Send + 'static) -> Self {
        self.on_admit = Box::new(on_admit);
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolLimits {
    pub concurrency: usize,
    pub hard_timeout: Duration,
    pub soft_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            concurrency: 5,
            hard_timeout: Duration::from_secs(3600),
            soft_timeout: Duration::from_secs(3540),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PoolSnapshot {
    pub concurrency: usize,
    pub busy: Vec<(MinionId, TaskId)>,
    pub paused: Vec<MinionId>,
    pub queued: usize,
    pub accepting: bool,
}

#[derive(Clone)]
pub struct MinionPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    limits: PoolLimits,
    state: Mutex<PoolState>,
    slot_released: Notify,
    drained: Notify,
}

struct PoolState {
    accepting: bool,
    slots: Vec<Option<TaskId>>,
    paused: BTreeSet<MinionId>,
    entries: HashMap<TaskId, PoolEntry>,
}

struct PoolEntry {
    cancellation: TaskCancellationToken,
    abort: Option<AbortHandle>,
    minion: Option<MinionId>,
    cancel_requested: bool,
}

impl PoolState {
    fn claim_slot(&mut self, task_id: &TaskId) -> Option<MinionId> {
        let index = self
            .slots
            .iter()
            .enumerate()
            .find(|(index, slot)| slot.is_none() && !self.paused.contains(&minion_at(*index)))
            .map(|(index, _)| index)?;

        self.slots[index] = Some(task_id.clone());
        let minion = minion_at(index);
        if let Some(entry) = self.entries.get_mut(task_id) {
            entry.minion = Some(minion);
        }
        Some(minion)
    }
}

fn minion_at(index: usize) -> MinionId {
    MinionId(index + 1)
}

impl MinionPool {
    pub fn new(limits: PoolLimits) -> Self {
        let concurrency = limits.concurrency.max(1);
        Self {
            shared: Arc::new(PoolShared {
                limits: PoolLimits {
                    concurrency,
                    ..limits
                },
                state: Mutex::new(PoolState {
                    accepting: true,
                    slots: vec![None; concurrency],
                    paused: BTreeSet::new(),
                    entries: HashMap::new(),
                }),
                slot_released: Notify::new(),
                drained: Notify::new(),
            }),
        }
    }

    pub fn limits(&self) -> PoolLimits {
        self.shared.limits
    }

    /// Queues `operation`. Returns once the task is admitted to the queue; the
    /// hooks fire later from the worker.
    pub fn enqueue(
        &self,
        task_id: TaskId,
        operation: TaskOperation,
        hooks: CompletionHooks,
    ) -> OrchestrationResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("no async runtime available to run minions: {error}"),
            )
            .task(task_id.clone())
        })?;

        let signals = ExecutionSignals::new();
        {
            let mut state = self.shared.lock();
            if !state.accepting {
                return Err(CoreError::new(
                    CoreErrorKind::Internal,
                    "minion pool is shut down and rejects new work",
                )
                .task(task_id));
            }
            if state.entries.contains_key(&task_id) {
                return Err(CoreError::new(
                    CoreErrorKind::Conflict,
                    format!("task '{task_id}' is already queued"),
                )
                .task(task_id));
            }
            state.entries.insert(
                task_id.clone(),
                PoolEntry {
                    cancellation: signals.cancellation.clone(),
                    abort: None,
                    minion: None,
                    cancel_requested: false,
                },
            );
        }

        // The guard is owned by the spawned future from the start, so an abort
        // before the first poll still releases the entry.
        let guard = TaskGuard {
            shared: self.shared.clone(),
            task_id: task_id.clone(),
            minion: None,
            inner: None,
        };
        let join_handle = runtime.spawn(run_task(guard, operation, hooks, signals));

        let mut state = self.shared.lock();
        if let Some(entry) = state.entries.get_mut(&task_id) {
            entry.abort = Some(join_handle.abort_handle());
        }

        Ok(())
    }

    /// Requests cancellation. Returns `Ok(false)` if a request was already made.
    pub fn cancel(&self, task_id: &TaskId, mode: CancellationMode) -> OrchestrationResult<bool> {
        let (token, abort) = {
            let mut state = self.shared.lock();
            let entry = state.entries.get_mut(task_id).ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::NotFound,
                    format!("task '{task_id}' is not held by the minion pool"),
                )
                .task(task_id.clone())
            })?;
            if entry.cancel_requested {
                return Ok(false);
            }
            entry.cancel_requested = true;
            (entry.cancellation.clone(), entry.abort.clone())
        };

        token.cancel();

        match mode {
            CancellationMode::Immediate => {
                if let Some(handle) = abort {
                    handle.abort();
                }
            }
            CancellationMode::Graceful { grace_period } => {
                if let Some(handle) = abort {
                    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                        handle.abort();
                        return Ok(true);
                    };
                    let shared = self.shared.clone();
                    let task_id = task_id.clone();
                    runtime.spawn(async move {
                        tokio::time::sleep(grace_period).await;
                        if shared.lock().entries.contains_key(&task_id) {
                            tracing::warn!(
                                task_id = %task_id,
                                grace_ms = grace_period.as_millis() as u64,
                                "task ignored cancellation; aborting"
                            );
                            handle.abort();
                        }
                    });
                }
            }
        }

        Ok(true)
    }

    pub fn pause(&self, minion: MinionId) -> OrchestrationResult<()> {
        let mut state = self.shared.lock();
        self.check_minion(minion)?;
        if !state.paused.insert(minion) {
            return Err(CoreError::new(
                CoreErrorKind::Conflict,
                format!("{minion} is already paused"),
            ));
        }
        Ok(())
    }

    pub fn resume(&self, minion: MinionId) -> OrchestrationResult<()> {
        {
            let mut state = self.shared.lock();
            self.check_minion(minion)?;
            if !state.paused.remove(&minion) {
                return Err(CoreError::new(
                    CoreErrorKind::Conflict,
                    format!("{minion} is not paused"),
                ));
            }
        }
        self.shared.slot_released.notify_waiters();
        Ok(())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.shared.lock();
        let busy = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.clone().map(|task_id| (minion_at(index), task_id)))
            .collect();
        PoolSnapshot {
            concurrency: self.shared.limits.concurrency,
            busy,
            paused: state.paused.iter().copied().collect(),
            queued: state
                .entries
                .values()
                .filter(|entry| entry.minion.is_none())
                .count(),
            accepting: state.accepting,
        }
    }

    pub fn held_tasks(&self) -> Vec<TaskId> {
        self.shared.lock().entries.keys().cloned().collect()
    }

    /// Stops admitting new work. Queued and running tasks are left alone.
    pub fn close(&self) {
        self.shared.lock().accepting = false;
    }

    /// Waits until no task is held, or the timeout passes. Returns whether the
    /// pool drained.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let drained = self.shared.drained.notified();
                tokio::pin!(drained);
                drained.as_mut().enable();
                if self.shared.lock().entries.is_empty() {
                    return;
                }
                drained.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn check_minion(&self, minion: MinionId) -> OrchestrationResult<()> {
        if minion.0 == 0 || minion.0 > self.shared.limits.concurrency {
            return Err(CoreError::new(
                CoreErrorKind::NotFound,
                format!(
                    "unknown minion '{minion}'; pool has {} minions",
                    self.shared.limits.concurrency
                ),
            ));
        }
        Ok(())
    }
}

impl PoolShared {
    // Pool bookkeeping stays consistent across a panicking holder, so a
    // poisoned lock is recovered rather than surfaced.
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the slot and the pool entry however the worker future ends,
/// including abort.
struct TaskGuard {
    shared: Arc<PoolShared>,
    task_id: TaskId,
    minion: Option<MinionId>,
    inner: Option<AbortHandle>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.abort();
        }

        let drained = {
            let mut state = self.shared.lock();
            if let Some(minion) = self.minion
                && let Some(slot) = state.slots.get_mut(minion.0 - 1)
                && slot.as_ref() == Some(&self.task_id)
            {
                *slot = None;
            }
            state.entries.remove(&self.task_id);
            state.entries.is_empty()
        };

        self.shared.slot_released.notify_waiters();
        if drained {
            self.shared.drained.notify_waiters();
        }
    }
}

async fn run_task(
    mut guard: TaskGuard,
    operation: TaskOperation,
    hooks: CompletionHooks,
    signals: ExecutionSignals,
) {
    let shared = guard.shared.clone();
    let task_id = guard.task_id.clone();

    let Some(minion) = acquire_slot(&shared, &task_id, &signals.cancellation).await else {
        tracing::info!(task_id = %task_id, "task cancelled before a minion picked it up");
        (hooks.on_complete)(ExecutionReport::Cancelled);
        return;
    };
    guard.minion = Some(minion);

    tracing::info!(task_id = %task_id, minion = %minion, "minion picked up task");
    (hooks.on_admit)(minion);

    let mut execution = tokio::spawn(operation(signals.clone()));
    guard.inner = Some(execution.abort_handle());

    let limits = shared.limits;
    let hard_deadline = tokio::time::sleep(limits.hard_timeout);
    let soft_deadline = tokio::time::sleep(limits.soft_timeout);
    tokio::pin!(hard_deadline, soft_deadline);
    let mut soft_fired = false;

    let report = loop {
        tokio::select! {
            joined = &mut execution => break report_from_join(joined, &signals),
            _ = &mut soft_deadline, if !soft_fired => {
                soft_fired = true;
                tracing::warn!(
                    task_id = %task_id,
                    soft_timeout_secs = limits.soft_timeout.as_secs(),
                    "task passed its soft timeout"
                );
                signals.soft_timeout.fire();
            }
            _ = &mut hard_deadline => {
                tracing::warn!(
                    task_id = %task_id,
                    hard_timeout_secs = limits.hard_timeout.as_secs(),
                    "task exceeded its hard timeout; terminating"
                );
                break ExecutionReport::TimedOut(limits.hard_timeout);
            }
        }
    };

    (hooks.on_complete)(report);
    drop(guard);
}

async fn acquire_slot(
    shared: &PoolShared,
    task_id: &TaskId,
    cancellation: &TaskCancellationToken,
) -> Option<MinionId> {
    loop {
        let released = shared.slot_released.notified();
        tokio::pin!(released);
        released.as_mut().enable();

        if cancellation.is_cancelled() {
            return None;
        }
        let claimed = shared.lock().claim_slot(task_id);
        if claimed.is_some() {
            return claimed;
        }

        tokio::select! {
            _ = &mut released => {}
            _ = cancellation.cancelled() => return None,
        }
    }
}

fn report_from_join(
    joined: Result<OrchestrationResult<ExecutionOutcome>, JoinError>,
    signals: &ExecutionSignals,
) -> ExecutionReport {
    match joined {
        Ok(_) if signals.cancellation.is_cancelled() => ExecutionReport::Cancelled,
        Ok(Ok(outcome)) => ExecutionReport::Finished(outcome),
        Ok(Err(error)) if error.kind == CoreErrorKind::Cancelled => ExecutionReport::Cancelled,
        Ok(Err(error)) => ExecutionReport::Faulted(error),
        Err(join_error) if join_error.is_panic() => {
            let payload = join_error.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|text| text.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            ExecutionReport::Faulted(CoreError::new(
                CoreErrorKind::HandlerFault,
                format!("gadget panicked: {message}"),
            ))
        }
        Err(_) => ExecutionReport::Cancelled,
    }
}
