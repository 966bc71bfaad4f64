use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::models::{ExecutionOutcome, TaskParams};

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A worker slot in the minion pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinionId(pub usize);

impl Display for MinionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "minion-{}", self.0)
    }
}

/// What a single minion slot is doing right now.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MinionState {
    Idle,
    Busy,
    Paused,
}

impl MinionState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle Goblin",
            Self::Busy => "Busy Goblin",
            Self::Paused => "Paused Goblin",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Busy,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Cancelled tasks are reported to callers as errors.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Busy | Self::Error | Self::Cancelled),
            Self::Busy => next.is_terminal(),
            Self::Completed | Self::Error | Self::Cancelled => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending | Self::Busy => "Busy Goblin",
            Self::Completed => "Idle Goblin",
            Self::Error | Self::Cancelled => "Troubled Goblin",
        }
    }
}

/// Answer to a status poll. Unknown ids report `Sleeping` instead of failing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusReport {
    Pending,
    Busy,
    Completed,
    Error,
    Cancelled,
    Sleeping,
}

impl StatusReport {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => TaskStatus::Pending.label(),
            Self::Busy => TaskStatus::Busy.label(),
            Self::Completed => TaskStatus::Completed.label(),
            Self::Error => TaskStatus::Error.label(),
            Self::Cancelled => TaskStatus::Cancelled.label(),
            Self::Sleeping => "Sleepy Goblin",
        }
    }
}

impl From<Option<TaskStatus>> for StatusReport {
    fn from(status: Option<TaskStatus>) -> Self {
        match status {
            Some(TaskStatus::Pending) => Self::Pending,
            Some(TaskStatus::Busy) => Self::Busy,
            Some(TaskStatus::Completed) => Self::Completed,
            Some(TaskStatus::Error) => Self::Error,
            Some(TaskStatus::Cancelled) => Self::Cancelled,
            None => Self::Sleeping,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub gadget_id: String,
    pub gadget_name: String,
    pub mode: String,
    pub params: TaskParams,
    pub result_dir: PathBuf,
    pub status: TaskStatus,
    pub submitted_at: SystemTime,
    pub completed_at: Option<SystemTime>,
    pub execution_duration: Option<Duration>,
    pub minion: Option<MinionId>,
    pub outcome: Option<ExecutionOutcome>,
    pub error: Option<String>,
    pub retry_of: Option<TaskId>,
}

/// Everything needed to create a record except its id, which the ledger assigns.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskDraft {
    pub gadget_id: String,
    pub gadget_name: String,
    pub mode: String,
    pub params: TaskParams,
    pub result_dir: PathBuf,
    pub submitted_at: SystemTime,
    pub retry_of: Option<TaskId>,
}

impl TaskDraft {
    pub fn into_record(self, task_id: TaskId) -> TaskRecord {
        TaskRecord {
            task_id,
            gadget_id: self.gadget_id,
            gadget_name: self.gadget_name,
            mode: self.mode,
            params: self.params,
            result_dir: self.result_dir,
            status: TaskStatus::Pending,
            submitted_at: self.submitted_at,
            completed_at: None,
            execution_duration: None,
            minion: None,
            outcome: None,
            error: None,
            retry_of: self.retry_of,
        }
    }
}

/// Payload attached to a status transition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskCompletion {
    pub outcome: Option<ExecutionOutcome>,
    pub error: Option<String>,
}

impl TaskCompletion {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn outcome(outcome: ExecutionOutcome) -> Self {
        let error = outcome.error.clone();
        Self {
            outcome: Some(outcome),
            error,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            outcome: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MinionState, StatusReport, TaskStatus};

    #[test]
    fn terminal_states_accept_no_transitions() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Error,
            TaskStatus::Cancelled,
        ] {
            for next in [
                TaskStatus::Pending,
                TaskStatus::Busy,
                TaskStatus::Completed,
                TaskStatus::Error,
                TaskStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn pending_cannot_complete_without_running() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Busy));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Error));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn unknown_task_reports_sleeping() {
        assert_eq!(StatusReport::from(None), StatusReport::Sleeping);
        assert_eq!(StatusReport::Sleeping.label(), "Sleepy Goblin");
    }

    #[test]
    fn paused_minions_have_their_own_label() {
        assert_eq!(MinionState::Paused.label(), "Paused Goblin");
        assert_eq!(MinionState::Busy.label(), TaskStatus::Busy.label());
    }
}
