pub mod encoder;
pub mod file_processor;
pub mod scanner;

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use crate::models::{
    CoreError, CoreErrorKind, ExecutionOutcome, FormSchema, GadgetDescriptor, ModeDescriptor,
    TaskId, TaskParams,
};
use crate::orchestration::ExecutionSignals;

pub use encoder::EncoderGadget;
pub use file_processor::FileProcessorGadget;
pub use scanner::ScannerGadget;

pub type GadgetResult<T> = Result<T, CoreError>;

pub type GadgetFuture = Pin<Box<dyn Future<Output = GadgetResult<ExecutionOutcome>> + Send>>;

/// Everything a gadget receives for one run.
#[derive(Clone, Debug)]
pub struct GadgetInvocation {
    pub task_id: TaskId,
    pub mode: String,
    pub params: TaskParams,
    pub result_dir: PathBuf,
    pub signals: ExecutionSignals,
}

/// The execution contract every gadget implements.
///
/// A fresh instance is built for each invocation, so implementations never
/// share mutable state between concurrent runs.
pub trait Gadget: Send + Sync {
    fn descriptor(&self) -> &GadgetDescriptor;

    fn modes(&self) -> Vec<ModeDescriptor>;

    fn form_schema(&self, mode: &str) -> FormSchema;

    /// Checked once when the gadget is registered.
    fn validate(&self) -> GadgetResult<()> {
        Ok(())
    }

    fn supports_mode(&self, mode: &str) -> bool {
        self.modes().iter().any(|candidate| candidate.id == mode)
    }

    fn execute(self: Box<Self>, invocation: GadgetInvocation) -> GadgetFuture;
}

pub(crate) fn param_str<'a>(params: &'a TaskParams, key: &str) -> Option<&'a str> {
    params.get(key).and_then(serde_json::Value::as_str)
}

/// First `limit` characters, with a trailing `...` when anything was cut.
pub fn truncate_preview(text: &str, limit: usize) -> String {
    let mut chars = text.char_indices();
    match chars.nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

pub(crate) fn storage_failure(
    gadget: &str,
    task_id: &TaskId,
    path: &Path,
    error: std::io::Error,
) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("failed to write '{}': {error}", path.display()),
    )
    .gadget(gadget)
    .task(task_id.clone())
}

pub(crate) async fn write_json(
    gadget: &str,
    task_id: &TaskId,
    path: &Path,
    value: &serde_json::Value,
) -> GadgetResult<()> {
    let rendered = serde_json::to_vec_pretty(value).map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("failed to serialize '{}': {error}", path.display()),
        )
        .gadget(gadget)
        .task(task_id.clone())
    })?;
    tokio::fs::write(path, rendered)
        .await
        .map_err(|error| storage_failure(gadget, task_id, path, error))
}

/// Finds `binary_name` on `PATH`, then in common install roots.
pub fn locate_binary(binary_name: &str) -> Option<PathBuf> {
    if binary_name.trim().is_empty() {
        return None;
    }

    if binary_name.contains('/') {
        let explicit = PathBuf::from(binary_name);
        return is_executable_file(&explicit).then_some(explicit);
    }

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            push_candidate(dir.join(binary_name), &mut candidates, &mut seen);
        }
    }

    for dir in ["/usr/local/bin", "/usr/bin", "/bin", "/usr/sbin", "/sbin", "/opt/homebrew/bin"] {
        push_candidate(Path::new(dir).join(binary_name), &mut candidates, &mut seen);
    }

    candidates
        .into_iter()
        .find(|candidate| is_executable_file(candidate))
}

fn push_candidate(candidate: PathBuf, candidates: &mut Vec<PathBuf>, seen: &mut HashSet<PathBuf>) {
    if seen.insert(candidate.clone()) {
        candidates.push(candidate);
    }
}

#[cfg(unix)]
pub(crate) fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub(crate) fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::{locate_binary, truncate_preview};

    #[test]
    fn preview_is_cut_on_char_boundaries() {
        assert_eq!(truncate_preview("abc", 100), "abc");
        assert_eq!(truncate_preview("abcdef", 3), "abc...");
        assert_eq!(truncate_preview("ééé", 2), "éé...");
        assert_eq!(truncate_preview("abc", 3), "abc");
    }

    #[test]
    fn blank_binary_name_is_never_found() {
        assert!(locate_binary("  ").is_none());
        assert!(locate_binary("/definitely/not/here/nmap").is_none());
    }
}
