use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque per-mode parameters; the dispatcher passes them through unexamined.
pub type TaskParams = serde_json::Map<String, serde_json::Value>;

/// Declarative form description for a mode. Never validated by the core.
pub type FormSchema = serde_json::Value;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GadgetDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ModeDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModeInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub form_schema: FormSchema,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GadgetInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub modes: Vec<ModeInfo>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: OutcomeStatus,
    pub result_file: Option<PathBuf>,
    pub result_preview: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn completed() -> Self {
        Self {
            status: OutcomeStatus::Completed,
            result_file: None,
            result_preview: None,
            result: None,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            error: Some(message.into()),
            ..Self::completed()
        }
    }

    pub fn result_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.result_file = Some(path.into());
        self
    }

    pub fn preview(mut self, preview: impl Into<String>) -> Self {
        self.result_preview = Some(preview.into());
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }
}
