use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::execution::{
    ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    ProcessTerminationMode, ProcessWaitFuture, RunningProcess,
};
use crate::models::{CoreError, CoreErrorKind, TaskId};

pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &request.command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // A hard timeout drops the task future; the child must not outlive it.
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|error| {
            process_failure(
                &request.gadget,
                request.task_id.as_ref(),
                format!("failed to spawn process: {error}"),
            )
        })?;

        let pid = child.id();
        tracing::debug!(
            gadget = %request.gadget,
            task_id = ?request.task_id,
            pid = ?pid,
            command = %request.command.display(),
            "spawned gadget process"
        );

        Ok(Box::new(TokioRunningProcess {
            child: Mutex::new(Some(child)),
            pid,
            started_at: SystemTime::now(),
            timeout: request.timeout,
            gadget: request.gadget,
            task_id: request.task_id,
        }))
    }
}

struct TokioRunningProcess {
    child: Mutex<Option<tokio::process::Child>>,
    pid: Option<u32>,
    started_at: SystemTime,
    timeout: Option<Duration>,
    gadget: String,
    task_id: Option<TaskId>,
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self, mode: ProcessTerminationMode) -> ExecutionResult<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };

        signal_process_group(pid, mode).map_err(|message| {
            process_failure(&self.gadget, self.task_id.as_ref(), message)
        })
    }

    fn wait(&self) -> ProcessWaitFuture {
        let child = self.child.lock().ok().and_then(|mut slot| slot.take());
        let timeout = self.timeout;
        let started_at = self.started_at;
        let gadget = self.gadget.clone();
        let task_id = self.task_id.clone();
        let pid = self.pid;

        Box::pin(async move {
            let mut child = child.ok_or_else(|| {
                process_failure(
                    &gadget,
                    task_id.as_ref(),
                    "child process already consumed".to_string(),
                )
            })?;

            let stdout_reader = tokio::spawn(drain_pipe(child.stdout.take()));
            let stderr_reader = tokio::spawn(drain_pipe(child.stderr.take()));

            let wait_err = |error: std::io::Error| {
                process_failure(
                    &gadget,
                    task_id.as_ref(),
                    format!("failed to wait for process: {error}"),
                )
            };

            // Collect output only after exit, with a bounded read window, so
            // descendants holding the pipes open cannot hang the wait.
            let status = if let Some(timeout_duration) = timeout {
                match tokio::time::timeout(timeout_duration, child.wait()).await {
                    Ok(result) => result.map_err(wait_err)?,
                    Err(_) => {
                        if let Some(pid) = pid {
                            let _ = signal_process_group(pid, ProcessTerminationMode::Immediate);
                        }
                        let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
                        stdout_reader.abort();
                        stderr_reader.abort();
                        let mut error = CoreError::new(
                            CoreErrorKind::Timeout,
                            format!("process timed out after {}ms", timeout_duration.as_millis()),
                        )
                        .gadget(gadget.clone());
                        error.task = task_id.clone();
                        return Err(error);
                    }
                }
            } else {
                child.wait().await.map_err(wait_err)?
            };

            let read_deadline = Duration::from_millis(250);
            let stdout = match tokio::time::timeout(read_deadline, stdout_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };
            let stderr = match tokio::time::timeout(read_deadline, stderr_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };

            let status = match status.code() {
                Some(code) => ProcessExitStatus::ExitCode(code),
                None => ProcessExitStatus::Terminated,
            };

            Ok(ProcessOutput {
                status,
                stdout,
                stderr,
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

async fn drain_pipe<R>(pipe: Option<R>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buffer).await;
    }
    buffer
}

#[cfg(unix)]
fn signal_process_group(pid: u32, mode: ProcessTerminationMode) -> Result<(), String> {
    let signal = match mode {
        ProcessTerminationMode::Immediate => libc::SIGKILL,
        ProcessTerminationMode::Graceful { .. } => libc::SIGTERM,
    };

    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, signal) };

    if result != 0 {
        let os_error = std::io::Error::last_os_error();
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            return Err(format!(
                "failed to send signal {signal} to process group {pid}: {os_error}"
            ));
        }
    }

    Ok(())
}

#[cfg(not(unix))]
fn signal_process_group(_pid: u32, _mode: ProcessTerminationMode) -> Result<(), String> {
    Err("process group signalling is only supported on unix".to_string())
}

fn process_failure(gadget: &str, task_id: Option<&TaskId>, message: String) -> CoreError {
    let error = CoreError::new(CoreErrorKind::ProcessFailure, message).gadget(gadget);
    match task_id {
        Some(task_id) => error.task(task_id.clone()),
        None => error,
    }
}
