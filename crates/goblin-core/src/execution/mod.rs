pub mod tokio_process;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use crate::models::{CoreError, CoreErrorKind, TaskId};
use crate::orchestration::ExecutionSignals;

pub use tokio_process::TokioProcessExecutor;

pub type ExecutionResult<T> = Result<T, CoreError>;

pub type ProcessWaitFuture = Pin<Box<dyn Future<Output = ExecutionResult<ProcessOutput>> + Send>>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    /// Shell-like rendering used for logs and result summaries.
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn validate(&self, gadget: &str) -> ExecutionResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(invalid_input(gadget, "command program path must not be empty"));
        }

        if self
            .args
            .iter()
            .any(|arg| arg.is_empty() || arg.contains('\0'))
        {
            return Err(invalid_input(
                gadget,
                "command args must be non-empty and must not contain NUL bytes",
            ));
        }

        if self
            .env
            .iter()
            .any(|(key, value)| key.is_empty() || key.contains('\0') || value.contains('\0'))
        {
            return Err(invalid_input(
                gadget,
                "environment keys and values must be non-empty and must not contain NUL bytes",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessSpawnRequest {
    pub gadget: String,
    pub task_id: Option<TaskId>,
    pub command: CommandSpec,
    pub timeout: Option<Duration>,
    pub requested_at: SystemTime,
}

impl ProcessSpawnRequest {
    pub fn new(gadget: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            gadget: gadget.into(),
            task_id: None,
            command,
            timeout: None,
            requested_at: SystemTime::now(),
        }
    }

    pub fn task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        self.command.validate(&self.gadget)?;

        if let Some(timeout) = self.timeout
            && timeout.is_zero()
        {
            return Err(invalid_input(
                &self.gadget,
                "timeout must be greater than zero when provided",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessTerminationMode {
    Graceful { grace_period: Duration },
    Immediate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessExitStatus {
    ExitCode(i32),
    Terminated,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessOutput {
    pub status: ProcessExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

pub trait RunningProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn terminate(&self, mode: ProcessTerminationMode) -> ExecutionResult<()>;

    /// Takes ownership of the child; the handle stays usable for `terminate`.
    fn wait(&self) -> ProcessWaitFuture;
}

pub trait ProcessExecutor: Send + Sync {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>>;
}

pub fn spawn_validated(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
) -> ExecutionResult<Box<dyn RunningProcess>> {
    request.validate()?;
    executor.spawn(request)
}

/// Runs a process to exit while watching the task's signals. Cancellation and
/// the soft timeout both ask the process group to stop, then kill it once the
/// grace period lapses.
pub async fn run_observing_signals(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
    signals: &ExecutionSignals,
    grace_period: Duration,
) -> ExecutionResult<ProcessOutput> {
    let gadget = request.gadget.clone();
    let process = spawn_validated(executor, request)?;
    let mut wait = process.wait();

    let reason = tokio::select! {
        output = &mut wait => return output,
        _ = signals.cancellation.cancelled() => "cancellation requested",
        _ = signals.soft_timeout.expired() => "soft timeout reached",
    };

    tracing::info!(gadget = %gadget, pid = ?process.pid(), reason, "stopping gadget process");
    process.terminate(ProcessTerminationMode::Graceful { grace_period })?;

    match tokio::time::timeout(grace_period, &mut wait).await {
        Ok(output) => output,
        Err(_) => {
            process.terminate(ProcessTerminationMode::Immediate)?;
            wait.await
        }
    }
}

fn invalid_input(gadget: &str, message: &str) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message).gadget(gadget)
}
