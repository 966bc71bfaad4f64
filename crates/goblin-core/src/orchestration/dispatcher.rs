use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::DispatcherConfig;
use crate::gadgets::{Gadget, GadgetFuture, GadgetInvocation};
use crate::ledger::TaskLedger;
use crate::models::{
    CoreError, CoreErrorKind, ExecutionOutcome, GadgetInfo, MinionId, MinionState, StatusReport,
    TaskCompletion, TaskDraft, TaskId, TaskParams, TaskRecord, TaskStatus,
};
use crate::orchestration::{
    CancellationMode, CompletionHooks, ExecutionReport, ExecutionSignals, MinionPool,
    OrchestrationResult, TaskOperation,
};
use crate::registry::GadgetRegistry;
use crate::results::{PurgeReport, ResultDetails, ResultStore, ResultSummary};

const PREVIEW_FALLBACK_CHARS: usize = 1000;
const CANCELLED_BY_USER: &str = "cancelled by user";
const CANCELLED_BY_SHUTDOWN: &str = "cancelled by dispatcher shutdown";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubmissionReceipt {
    pub task_ids: Vec<TaskId>,
    pub result_dirs: Vec<PathBuf>,
    /// `Busy` when every task reached the pool, `Error` otherwise.
    pub status: TaskStatus,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Error,
}

/// Outcome of a control operation. These never surface as `Err`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperationReport {
    pub status: OperationStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_task_id: Option<TaskId>,
}

impl OperationReport {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Success,
            message: message.into(),
            new_task_id: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Error,
            message: message.into(),
            new_task_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct HostUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

pub trait HostUsageProbe: Send + Sync {
    fn sample(&self) -> HostUsage;
}

/// Samples CPU and memory through `sysinfo`, reusing one `System`.
pub struct SysinfoHostProbe {
    system: Mutex<sysinfo::System>,
}

impl Default for SysinfoHostProbe {
    fn default() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl HostUsageProbe for SysinfoHostProbe {
    fn sample(&self) -> HostUsage {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu();
        system.refresh_memory();

        let cpu_count = system.cpus().len().max(1);
        let cpu_percent =
            system.cpus().iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpu_count as f32;
        let total_memory = system.total_memory().max(1);
        HostUsage {
            cpu_percent,
            memory_percent: system.used_memory() as f32 / total_memory as f32 * 100.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DispatcherMetrics {
    pub active_count: usize,
    pub total_completed: usize,
    pub error_rate: f64,
    pub pending_count: usize,
    pub concurrency: usize,
    pub paused_minions: Vec<MinionId>,
    pub minions: BTreeMap<MinionId, MinionState>,
    pub host: HostUsage,
}

/// Accepts gadget submissions and drives each task from pending to a
/// terminal state on the minion pool.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    registry: Arc<GadgetRegistry>,
    store: Arc<ResultStore>,
    ledger: Arc<TaskLedger>,
    pool: MinionPool,
    host: Arc<dyn HostUsageProbe>,
    finished: Arc<Notify>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, registry: GadgetRegistry, store: ResultStore) -> Self {
        let ledger = Arc::new(TaskLedger::new(config.completed_capacity));
        let pool = MinionPool::new(config.pool_limits());
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            store: Arc::new(store),
            ledger,
            pool,
            host: Arc::new(SysinfoHostProbe::default()),
            finished: Arc::new(Notify::new()),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_host_probe(mut self, probe: Arc<dyn HostUsageProbe>) -> Self {
        self.host = probe;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs one retention sweep, then schedules the periodic sweep.
    pub fn start(&self) -> OrchestrationResult<PurgeReport> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("dispatcher requires an async runtime: {error}"),
            )
        })?;

        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return Err(CoreError::new(
                CoreErrorKind::Conflict,
                "dispatcher is already started",
            ));
        }

        tracing::info!(
            results_dir = %self.store.base_dir().display(),
            retention_days = self.store.retention_days(),
            gadgets = ?self.registry.gadget_ids(),
            "starting dispatcher"
        );
        let initial = self.cleanup_results();
        tracing::info!(
            removed = initial.removed,
            failed = initial.failed,
            "startup result sweep finished"
        );

        let store = self.store.clone();
        let retention_days = self.store.retention_days();
        let period = self.config.cleanup_interval();
        *sweeper = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.purge_expired(retention_days))
                    .await
                {
                    Ok(report) => tracing::info!(
                        removed = report.removed,
                        failed = report.failed,
                        "periodic result sweep finished"
                    ),
                    Err(error) => tracing::warn!(error = %error, "periodic result sweep failed"),
                }
            }
        }));

        Ok(initial)
    }

    /// Stops admitting work, cancels every live task and waits up to `grace`
    /// for the pool to drain. Returns whether it drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.pool.close();
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        let live = self.ledger.pending().unwrap_or_default();
        for record in live {
            if self
                .ledger
                .transition(
                    &record.task_id,
                    TaskStatus::Cancelled,
                    TaskCompletion::error(CANCELLED_BY_SHUTDOWN),
                )
                .is_ok()
            {
                let _ = self.pool.cancel(
                    &record.task_id,
                    CancellationMode::Graceful {
                        grace_period: grace,
                    },
                );
            }
        }
        self.finished.notify_waiters();

        let drained = self.pool.wait_drained(grace + Duration::from_secs(1)).await;
        if !drained {
            tracing::warn!(held = ?self.pool.held_tasks(), "tasks still held after shutdown grace");
        }
        tracing::info!(drained, "dispatcher shut down");
        drained
    }

    pub fn list_gadgets(&self) -> Vec<GadgetInfo> {
        self.registry.describe_all()
    }

    /// Creates one task per mode. Nothing is recorded when the gadget is
    /// unknown, a mode is unsupported or a result directory cannot be made.
    pub fn submit(
        &self,
        gadget_id: &str,
        modes: &[String],
        parameters: &HashMap<String, TaskParams>,
    ) -> OrchestrationResult<SubmissionReceipt> {
        let probe = self.registry.resolve(gadget_id)?;
        if modes.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "at least one mode must be selected",
            )
            .gadget(gadget_id));
        }
        if let Some(unsupported) = modes.iter().find(|mode| !probe.supports_mode(mode)) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("gadget '{gadget_id}' has no mode '{unsupported}'"),
            )
            .gadget(gadget_id));
        }
        let gadget_name = probe.descriptor().name.to_string();

        let mut allocated = Vec::with_capacity(modes.len());
        for mode in modes {
            let directory = self
                .store
                .allocate(&gadget_name, mode)
                .map_err(|error| error.attribute(gadget_id, None))?;
            allocated.push((mode.clone(), directory.path));
        }

        let mut receipt = SubmissionReceipt {
            task_ids: Vec::with_capacity(modes.len()),
            result_dirs: Vec::with_capacity(modes.len()),
            status: TaskStatus::Busy,
        };
        for (mode, result_dir) in allocated {
            let params = parameters.get(&mode).cloned().unwrap_or_default();
            let (task_id, status) =
                self.launch(gadget_id, &gadget_name, mode, params, result_dir.clone(), None)?;
            if status != TaskStatus::Busy {
                receipt.status = TaskStatus::Error;
            }
            receipt.task_ids.push(task_id);
            receipt.result_dirs.push(result_dir);
        }

        Ok(receipt)
    }

    /// Single-mode convenience over [`Dispatcher::submit`].
    pub fn submit_mode(
        &self,
        gadget_id: &str,
        mode: &str,
        params: TaskParams,
    ) -> OrchestrationResult<TaskId> {
        let parameters = HashMap::from([(mode.to_string(), params)]);
        let receipt = self.submit(gadget_id, &[mode.to_string()], &parameters)?;
        receipt.task_ids.into_iter().next().ok_or_else(|| {
            CoreError::new(CoreErrorKind::Internal, "submission produced no task")
                .gadget(gadget_id)
        })
    }

    fn launch(
        &self,
        gadget_id: &str,
        gadget_name: &str,
        mode: String,
        params: TaskParams,
        result_dir: PathBuf,
        retry_of: Option<TaskId>,
    ) -> OrchestrationResult<(TaskId, TaskStatus)> {
        let handler = self.registry.resolve(gadget_id)?;
        let record = self.ledger.insert_new(TaskDraft {
            gadget_id: gadget_id.to_string(),
            gadget_name: gadget_name.to_string(),
            mode,
            params,
            result_dir,
            submitted_at: SystemTime::now(),
            retry_of,
        })?;
        let task_id = record.task_id.clone();

        tracing::info!(
            task_id = %task_id,
            gadget = gadget_id,
            mode = %record.mode,
            retry_of = ?record.retry_of,
            "task submitted"
        );

        let status = self.enqueue(record, handler);
        Ok((task_id, status))
    }

    fn enqueue(&self, record: TaskRecord, handler: Box<dyn Gadget>) -> TaskStatus {
        let task_id = record.task_id.clone();
        let gadget_id = record.gadget_id.clone();
        let invocation_task = task_id.clone();
        let operation: TaskOperation = Box::new(move |signals: ExecutionSignals| {
            let invocation = GadgetInvocation {
                task_id: invocation_task.clone(),
                mode: record.mode,
                params: record.params,
                result_dir: record.result_dir,
                signals,
            };
            let execution: GadgetFuture = Box::pin(async move {
                match handler.execute(invocation).await {
                    Ok(outcome) => Ok(with_preview(outcome).await),
                    Err(error) => Err(error.attribute(&gadget_id, Some(&invocation_task))),
                }
            });
            execution
        });

        let hooks = {
            let ledger = self.ledger.clone();
            let finished = self.finished.clone();
            let completed_task = task_id.clone();
            let admitted_task = task_id.clone();
            let admit_ledger = self.ledger.clone();
            CompletionHooks::new(move |report| {
                record_report(&ledger, &completed_task, report);
                finished.notify_waiters();
            })
            .on_admit(move |minion| {
                let _ = admit_ledger.mark_busy(&admitted_task);
                let _ = admit_ledger.assign_minion(&admitted_task, minion);
            })
        };

        if let Err(error) = self.pool.enqueue(task_id.clone(), operation, hooks) {
            tracing::error!(task_id = %task_id, error = %error.message, "failed to enqueue task");
            let _ = self.ledger.transition(
                &task_id,
                TaskStatus::Error,
                TaskCompletion::error(error.message),
            );
            self.finished.notify_waiters();
            return TaskStatus::Error;
        }

        // A cancel that landed before the pool held the task never reached it.
        if self.ledger.mark_busy(&task_id).is_err()
            && let Ok(Some(TaskStatus::Cancelled)) = self.ledger.status(&task_id)
        {
            let _ = self.pool.cancel(&task_id, CancellationMode::Immediate);
        }
        TaskStatus::Busy
    }

    /// Unknown ids report `Sleeping`; this never fails.
    pub fn task_status(&self, task_id: &TaskId) -> StatusReport {
        StatusReport::from(self.ledger.status(task_id).ok().flatten())
    }

    pub fn task_details(&self, task_id: &TaskId) -> OrchestrationResult<TaskRecord> {
        self.ledger.get(task_id)
    }

    pub fn completed_tasks(&self, limit: usize) -> OrchestrationResult<Vec<TaskRecord>> {
        self.ledger.completed(limit)
    }

    pub fn pending_tasks(&self) -> OrchestrationResult<Vec<TaskRecord>> {
        self.ledger.pending()
    }

    pub fn minion_status(&self) -> OrchestrationResult<BTreeMap<TaskId, TaskStatus>> {
        self.ledger.live_status()
    }

    /// Waits until the task reaches a terminal state or `timeout` passes.
    pub async fn wait_for_completion(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> OrchestrationResult<TaskRecord> {
        let wait = async {
            loop {
                let finished = self.finished.notified();
                tokio::pin!(finished);
                finished.as_mut().enable();

                let record = self.ledger.get(task_id)?;
                if record.status.is_terminal() {
                    return Ok(record);
                }
                finished.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            CoreError::new(
                CoreErrorKind::Timeout,
                format!(
                    "task '{task_id}' did not finish within {}ms",
                    timeout.as_millis()
                ),
            )
            .task(task_id.clone())
        })?
    }

    pub fn cancel_task(&self, task_id: &TaskId) -> OperationReport {
        match self.ledger.status(task_id) {
            Ok(Some(status)) if status.is_terminal() => {
                return OperationReport::error(format!(
                    "task {task_id} already finished ({status:?})"
                ));
            }
            Ok(Some(_)) => {}
            Ok(None) => return OperationReport::error(format!("task {task_id} not found")),
            Err(error) => return OperationReport::error(error.message),
        }

        if let Err(error) = self.ledger.transition(
            task_id,
            TaskStatus::Cancelled,
            TaskCompletion::error(CANCELLED_BY_USER),
        ) {
            return OperationReport::error(error.message);
        }
        self.finished.notify_waiters();

        let grace_period = self.config.cancel_grace();
        match self
            .pool
            .cancel(task_id, CancellationMode::Graceful { grace_period })
        {
            Ok(_) => {}
            Err(error) if error.kind == CoreErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(task_id = %task_id, error = %error.message, "pool cancellation failed");
            }
        }

        tracing::info!(task_id = %task_id, "task cancelled");
        OperationReport::success(format!("Task {task_id} cancelled"))
    }

    /// Resubmits a failed or cancelled task under a new id. The original
    /// record is left untouched.
    pub fn retry_task(&self, task_id: &TaskId) -> OperationReport {
        let original = match self.ledger.get(task_id) {
            Ok(record) => record,
            Err(_) => return OperationReport::error(format!("task {task_id} not found")),
        };
        if !original.status.is_failure() {
            return OperationReport::error(format!(
                "task {task_id} is not in an error or cancelled state"
            ));
        }

        let result_dir = match self.store.allocate(&original.gadget_name, &original.mode) {
            Ok(directory) => directory.path,
            Err(error) => return OperationReport::error(error.message),
        };

        match self.launch(
            &original.gadget_id,
            &original.gadget_name,
            original.mode.clone(),
            original.params.clone(),
            result_dir,
            Some(task_id.clone()),
        ) {
            Ok((new_task_id, _)) => OperationReport {
                new_task_id: Some(new_task_id.clone()),
                ..OperationReport::success(format!("Task {task_id} requeued as {new_task_id}"))
            },
            Err(error) => OperationReport::error(error.message),
        }
    }

    pub fn pause_minion(&self, minion: MinionId) -> OperationReport {
        match self.pool.pause(minion) {
            Ok(()) => {
                tracing::info!(minion = %minion, "minion paused");
                OperationReport::success(format!("Minion {} paused", minion.0))
            }
            Err(error) if error.kind == CoreErrorKind::Conflict => {
                OperationReport::error("Minion already paused")
            }
            Err(error) => OperationReport::error(error.message),
        }
    }

    pub fn resume_minion(&self, minion: MinionId) -> OperationReport {
        match self.pool.resume(minion) {
            Ok(()) => {
                tracing::info!(minion = %minion, "minion resumed");
                OperationReport::success(format!("Minion {} resumed", minion.0))
            }
            Err(error) if error.kind == CoreErrorKind::Conflict => {
                OperationReport::error("Minion not paused")
            }
            Err(error) => OperationReport::error(error.message),
        }
    }

    pub fn minion_metrics(&self) -> OrchestrationResult<DispatcherMetrics> {
        let ledger = self.ledger.metrics()?;
        let pool = self.pool.snapshot();
        let mut minions = (1..=pool.concurrency)
            .map(|slot| (MinionId(slot), MinionState::Idle))
            .collect::<BTreeMap<_, _>>();
        for (minion, _) in &pool.busy {
            minions.insert(*minion, MinionState::Busy);
        }
        for minion in &pool.paused {
            minions.insert(*minion, MinionState::Paused);
        }
        Ok(DispatcherMetrics {
            active_count: ledger.active_count,
            total_completed: ledger.total_completed,
            error_rate: ledger.error_rate,
            pending_count: ledger.pending_count,
            concurrency: pool.concurrency,
            paused_minions: pool.paused,
            minions,
            host: self.host.sample(),
        })
    }

    pub fn cleanup_results(&self) -> PurgeReport {
        self.store.purge_expired(self.store.retention_days())
    }

    pub fn result_details(&self, task_id: &TaskId) -> OrchestrationResult<ResultDetails> {
        let record = self.ledger.get(task_id)?;
        self.store
            .describe(&record.result_dir)
            .map_err(|error| error.attribute(&record.gadget_id, Some(task_id)))
    }

    pub fn recent_results(&self, limit: usize) -> OrchestrationResult<Vec<ResultSummary>> {
        self.store.list_recent(limit)
    }
}

fn record_report(ledger: &TaskLedger, task_id: &TaskId, report: ExecutionReport) {
    // A very fast task can finish before submission marked it busy.
    let _ = ledger.mark_busy(task_id);

    let (status, completion) = match report {
        ExecutionReport::Finished(outcome) if outcome.is_completed() => {
            (TaskStatus::Completed, TaskCompletion::outcome(outcome))
        }
        ExecutionReport::Finished(outcome) => {
            let mut completion = TaskCompletion::outcome(outcome);
            if completion.error.is_none() {
                completion.error = Some("gadget reported an error".to_string());
            }
            (TaskStatus::Error, completion)
        }
        ExecutionReport::Faulted(error) => (TaskStatus::Error, TaskCompletion::error(error.message)),
        ExecutionReport::TimedOut(limit) => (
            TaskStatus::Error,
            TaskCompletion::error(format!(
                "task exceeded hard timeout of {}s",
                limit.as_secs()
            )),
        ),
        ExecutionReport::Cancelled => (TaskStatus::Cancelled, TaskCompletion::error("task cancelled")),
    };

    match ledger.transition(task_id, status, completion) {
        Ok(record) => tracing::info!(
            task_id = %task_id,
            status = ?record.status,
            duration_ms = record.execution_duration.map(|d| d.as_millis() as u64),
            "task finished"
        ),
        Err(error) if error.kind == CoreErrorKind::Conflict => tracing::debug!(
            task_id = %task_id,
            status = ?status,
            "ignoring completion for an already finished task"
        ),
        Err(error) => tracing::error!(
            task_id = %task_id,
            error = %error.message,
            "failed to record task completion"
        ),
    }
}

/// Fills a missing preview from the head of the result file. Runs on the
/// worker so the completion hook never touches the filesystem.
async fn with_preview(outcome: ExecutionOutcome) -> ExecutionOutcome {
    if outcome.result_preview.is_some() {
        return outcome;
    }
    let Some(path) = outcome.result_file.as_deref() else {
        return outcome;
    };
    match read_preview(path).await {
        Some(preview) => outcome.preview(preview),
        None => outcome,
    }
}

async fn read_preview(path: &Path) -> Option<String> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut bytes = Vec::new();
    file.take((PREVIEW_FALLBACK_CHARS * 4) as u64)
        .read_to_end(&mut bytes)
        .await
        .ok()?;
    Some(
        String::from_utf8_lossy(&bytes)
            .chars()
            .take(PREVIEW_FALLBACK_CHARS)
            .collect(),
    )
}
