use serde::Serialize;
use thiserror::Error;

use crate::models::TaskId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorKind {
    GadgetNotFound,
    StorageFailure,
    HandlerFault,
    Timeout,
    Cancelled,
    NotFound,
    Conflict,
    InvalidInput,
    ProcessFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub gadget: Option<String>,
    pub task: Option<TaskId>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            gadget: None,
            task: None,
            kind,
            message: message.into(),
        }
    }

    pub fn gadget(mut self, gadget: impl Into<String>) -> Self {
        self.gadget = Some(gadget.into());
        self
    }

    pub fn task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    /// Fills in attribution the error does not carry yet.
    pub fn attribute(self, gadget: &str, task: Option<&TaskId>) -> Self {
        Self {
            gadget: self.gadget.or_else(|| Some(gadget.to_string())),
            task: self.task.or_else(|| task.cloned()),
            kind: self.kind,
            message: self.message,
        }
    }
}
