use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

use crate::models::{CoreError, CoreErrorKind};

pub type StoreResult<T> = Result<T, CoreError>;

pub const RESULT_DIR_PREFIX: &str = "goblinforge_";
pub const METADATA_FILE: &str = "metadata.json";

const SECONDS_PER_DAY: u64 = 86_400;
const MAX_NAME_ATTEMPTS: u32 = 1_000;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ResultDirectory {
    pub path: PathBuf,
    pub timestamp: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PurgeReport {
    pub removed: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultFile {
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultDetails {
    pub directory: PathBuf,
    pub metadata: serde_json::Value,
    pub files: Vec<ResultFile>,
    pub modified_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultSummary {
    pub path: PathBuf,
    pub gadget: String,
    pub mode: String,
    pub modified_at: Option<String>,
    pub age_days: u64,
}

/// Owns the on-disk layout of per-task result directories.
#[derive(Clone, Debug)]
pub struct ResultStore {
    base_dir: PathBuf,
    retention_days: u32,
}

impl ResultStore {
    /// Creates the base directory if it does not exist yet.
    pub fn new(base_dir: impl Into<PathBuf>, retention_days: u32) -> StoreResult<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(|error| {
            storage_failure(format!(
                "failed to create results directory '{}': {error}",
                base_dir.display()
            ))
        })?;
        Ok(Self {
            base_dir,
            retention_days,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn allocate(&self, gadget_name: &str, mode: &str) -> StoreResult<ResultDirectory> {
        self.allocate_at(gadget_name, mode, SystemTime::now())
    }

    pub fn allocate_at(
        &self,
        gadget_name: &str,
        mode: &str,
        at: SystemTime,
    ) -> StoreResult<ResultDirectory> {
        let created = OffsetDateTime::from(at);
        let timestamp = created
            .format(format_description!(
                "[year][month][day]_[hour][minute][second]"
            ))
            .map_err(|error| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    format!("failed to format result timestamp: {error}"),
                )
            })?;
        let base_name = format!(
            "{RESULT_DIR_PREFIX}{timestamp}_{}_{}",
            normalize_name(gadget_name),
            normalize_name(mode)
        );

        let path = self.create_unique_dir(&base_name)?;
        let metadata = json!({
            "gadget": gadget_name,
            "mode": mode,
            "timestamp": timestamp,
            "created_at": created.format(&Rfc3339).ok(),
            "retention_days": self.retention_days,
        });

        let metadata_path = path.join(METADATA_FILE);
        let rendered = serde_json::to_vec_pretty(&metadata).map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("failed to serialize result metadata: {error}"),
            )
        })?;
        std::fs::write(&metadata_path, rendered).map_err(|error| {
            storage_failure(format!(
                "failed to write '{}': {error}",
                metadata_path.display()
            ))
        })?;

        tracing::debug!(path = %path.display(), gadget = gadget_name, mode, "allocated result directory");
        Ok(ResultDirectory { path, timestamp })
    }

    fn create_unique_dir(&self, base_name: &str) -> StoreResult<PathBuf> {
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let name = if attempt == 1 {
                base_name.to_string()
            } else {
                format!("{base_name}_{attempt}")
            };
            let candidate = self.base_dir.join(name);
            match std::fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(error) if error.kind() == ErrorKind::AlreadyExists => continue,
                Err(error) => {
                    return Err(storage_failure(format!(
                        "failed to create result directory '{}': {error}",
                        candidate.display()
                    )));
                }
            }
        }

        Err(storage_failure(format!(
            "no free result directory name for '{base_name}'"
        )))
    }

    pub fn purge_expired(&self, retention_days: u32) -> PurgeReport {
        self.purge_expired_at(retention_days, SystemTime::now())
    }

    /// Removes managed directories whose age exceeds the window. An age equal
    /// to the window is kept.
    pub fn purge_expired_at(&self, retention_days: u32, now: SystemTime) -> PurgeReport {
        let window = Duration::from_secs(u64::from(retention_days) * SECONDS_PER_DAY);
        let mut report = PurgeReport::default();

        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(
                    path = %self.base_dir.display(),
                    error = %error,
                    "failed to scan results directory"
                );
                report.failed += 1;
                return report;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to read results directory entry");
                    report.failed += 1;
                    continue;
                }
            };
            if !is_managed(&entry.path()) {
                continue;
            }

            let path = entry.path();
            let modified = match entry.metadata().and_then(|metadata| metadata.modified()) {
                Ok(modified) => modified,
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "failed to stat result directory");
                    report.failed += 1;
                    continue;
                }
            };

            let age = now.duration_since(modified).unwrap_or_default();
            if age <= window {
                continue;
            }

            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), age_secs = age.as_secs(), "removed expired result directory");
                    report.removed += 1;
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "failed to remove expired result directory");
                    report.failed += 1;
                }
            }
        }

        report
    }

    pub fn describe(&self, path: &Path) -> StoreResult<ResultDetails> {
        let metadata = std::fs::metadata(path)
            .ok()
            .filter(|metadata| metadata.is_dir())
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::NotFound,
                    format!("result directory '{}' not found", path.display()),
                )
            })?;

        let entries = std::fs::read_dir(path).map_err(|error| {
            storage_failure(format!(
                "failed to read result directory '{}': {error}",
                path.display()
            ))
        })?;

        let mut files = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name() != METADATA_FILE)
            .filter_map(|entry| {
                let file_metadata = entry.metadata().ok()?;
                file_metadata.is_file().then(|| ResultFile {
                    name: entry.file_name().to_string_lossy().to_string(),
                    size: file_metadata.len(),
                    path: entry.path(),
                })
            })
            .collect::<Vec<_>>();
        files.sort_by(|left, right| left.name.cmp(&right.name));

        Ok(ResultDetails {
            directory: path.to_path_buf(),
            metadata: read_metadata(path),
            files,
            modified_at: metadata.modified().ok().and_then(rfc3339),
        })
    }

    /// Most recently modified first.
    pub fn list_recent(&self, limit: usize) -> StoreResult<Vec<ResultSummary>> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(storage_failure(format!(
                    "failed to scan results directory '{}': {error}",
                    self.base_dir.display()
                )));
            }
        };

        let mut dirs = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| is_managed(path))
            .filter_map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((path, modified))
            })
            .collect::<Vec<_>>();
        dirs.sort_by(|left, right| right.1.cmp(&left.1));

        let now = SystemTime::now();
        Ok(dirs
            .into_iter()
            .take(limit)
            .map(|(path, modified)| {
                let metadata = read_metadata(&path);
                let field = |key: &str| {
                    metadata
                        .get(key)
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("unknown")
                        .to_string()
                };
                ResultSummary {
                    gadget: field("gadget"),
                    mode: field("mode"),
                    modified_at: rfc3339(modified),
                    age_days: now.duration_since(modified).unwrap_or_default().as_secs()
                        / SECONDS_PER_DAY,
                    path,
                }
            })
            .collect())
    }
}

/// Lowercases, maps whitespace and anything outside `[a-z0-9_-]` to `_`.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn is_managed(path: &Path) -> bool {
    path.is_dir()
        && path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with(RESULT_DIR_PREFIX))
}

fn read_metadata(dir: &Path) -> serde_json::Value {
    std::fs::read(dir.join(METADATA_FILE))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_else(|| json!({}))
}

fn rfc3339(at: SystemTime) -> Option<String> {
    OffsetDateTime::from(at).format(&Rfc3339).ok()
}

fn storage_failure(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::StorageFailure, message)
}
