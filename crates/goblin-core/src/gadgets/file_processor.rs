use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::gadgets::{
    Gadget, GadgetFuture, GadgetInvocation, param_str, storage_failure, write_json,
};
use crate::models::{ExecutionOutcome, FormSchema, GadgetDescriptor, ModeDescriptor};
use crate::results::METADATA_FILE;

const DESCRIPTOR: GadgetDescriptor = GadgetDescriptor {
    id: "file_processor",
    name: "File Processor",
    description: "Process files with various operations",
};

const MODES: &[ModeDescriptor] = &[
    ModeDescriptor {
        id: "file_analyzer",
        name: "File Analyzer",
        description: "Analyze files and provide basic information",
    },
    ModeDescriptor {
        id: "file_converter",
        name: "File Converter",
        description: "Convert files between different formats",
    },
];

#[derive(Clone, Copy, Debug, Default)]
pub struct FileProcessorGadget;

impl FileProcessorGadget {
    pub fn new() -> Self {
        Self
    }
}

impl Gadget for FileProcessorGadget {
    fn descriptor(&self) -> &GadgetDescriptor {
        &DESCRIPTOR
    }

    fn modes(&self) -> Vec<ModeDescriptor> {
        MODES.to_vec()
    }

    fn form_schema(&self, mode: &str) -> FormSchema {
        match mode {
            "file_analyzer" => json!({
                "input_file": {
                    "type": "file",
                    "label": "Input File",
                    "description": "Select a file to analyze",
                    "required": true,
                },
                "analysis_type": {
                    "type": "select",
                    "label": "Analysis Type",
                    "description": "Choose what information to extract",
                    "required": true,
                    "options": [
                        {"value": "basic", "label": "Basic Information"},
                        {"value": "detailed", "label": "Detailed Analysis"},
                    ],
                },
            }),
            "file_converter" => json!({
                "input_file": {
                    "type": "file",
                    "label": "Input File",
                    "description": "Select a file to convert",
                    "required": true,
                },
                "output_format": {
                    "type": "select",
                    "label": "Output Format",
                    "description": "Choose the target format",
                    "required": true,
                    "options": [
                        {"value": "txt", "label": "Text File"},
                        {"value": "pdf", "label": "PDF"},
                        {"value": "csv", "label": "CSV"},
                    ],
                },
            }),
            _ => json!({}),
        }
    }

    fn execute(self: Box<Self>, invocation: GadgetInvocation) -> GadgetFuture {
        Box::pin(async move {
            let Some(input) = param_str(&invocation.params, "input_file").map(PathBuf::from)
            else {
                return Ok(ExecutionOutcome::failed("input_file parameter is required"));
            };
            if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
                return Ok(ExecutionOutcome::failed(format!(
                    "input file not found: {}",
                    input.display()
                )));
            }

            match invocation.mode.as_str() {
                "file_analyzer" => analyze(&invocation, &input).await,
                "file_converter" => convert(&invocation, &input).await,
                other => Ok(ExecutionOutcome::failed(format!("unknown mode: {other}"))),
            }
        })
    }
}

async fn analyze(
    invocation: &GadgetInvocation,
    input: &Path,
) -> crate::gadgets::GadgetResult<ExecutionOutcome> {
    let metadata = match tokio::fs::metadata(input).await {
        Ok(metadata) => metadata,
        Err(error) => {
            return Ok(ExecutionOutcome::failed(format!(
                "failed to read metadata for '{}': {error}",
                input.display()
            )));
        }
    };

    let mut analysis = json!({
        "filename": input.file_name().map(|name| name.to_string_lossy().to_string()),
        "size": metadata.len(),
        "size_human": human_readable_size(metadata.len()),
        "extension": input.extension().map(|ext| format!(".{}", ext.to_string_lossy())).unwrap_or_default(),
        "created": metadata.created().ok().and_then(rfc3339),
        "modified": metadata.modified().ok().and_then(rfc3339),
    });

    if param_str(&invocation.params, "analysis_type") == Some("detailed")
        && let Value::Object(fields) = &mut analysis
    {
        fields.insert("detailed_info".to_string(), access_report(input));
    }

    let output = invocation.result_dir.join("analysis_results.json");
    write_json(DESCRIPTOR.id, &invocation.task_id, &output, &analysis).await?;

    Ok(ExecutionOutcome::completed()
        .result_file(output)
        .result(analysis))
}

async fn convert(
    invocation: &GadgetInvocation,
    input: &Path,
) -> crate::gadgets::GadgetResult<ExecutionOutcome> {
    let Some(format) = param_str(&invocation.params, "output_format") else {
        return Ok(ExecutionOutcome::failed("output_format parameter is required"));
    };
    if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Ok(ExecutionOutcome::failed(format!(
            "unsupported output format '{format}'"
        )));
    }

    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let mut file_name = format!("{stem}.{format}");
    if file_name == METADATA_FILE {
        file_name = format!("{stem}_converted.{format}");
    }
    let output = invocation.result_dir.join(file_name);

    tokio::fs::copy(input, &output)
        .await
        .map_err(|error| storage_failure(DESCRIPTOR.id, &invocation.task_id, &output, error))?;

    Ok(ExecutionOutcome::completed()
        .result(json!({
            "message": format!("file converted to {format}"),
            "output_file": output.display().to_string(),
        }))
        .result_file(output))
}

fn rfc3339(at: SystemTime) -> Option<String> {
    OffsetDateTime::from(at).format(&Rfc3339).ok()
}

fn human_readable_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} PB")
}

#[cfg(unix)]
fn access_report(path: &Path) -> Value {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return json!({"is_readable": false, "is_writable": false, "is_executable": false});
    };
    let check = |mode| unsafe { libc::access(c_path.as_ptr(), mode) == 0 };

    json!({
        "is_readable": check(libc::R_OK),
        "is_writable": check(libc::W_OK),
        "is_executable": check(libc::X_OK),
    })
}

#[cfg(not(unix))]
fn access_report(path: &Path) -> Value {
    let writable = path
        .metadata()
        .map(|metadata| !metadata.permissions().readonly())
        .unwrap_or(false);
    json!({"is_readable": path.is_file(), "is_writable": writable, "is_executable": false})
}

#[cfg(test)]
mod tests {
    use super::human_readable_size;

    #[test]
    fn sizes_scale_through_units() {
        assert_eq!(human_readable_size(512), "512.00 B");
        assert_eq!(human_readable_size(2048), "2.00 KB");
        assert_eq!(human_readable_size(5 * 1024 * 1024), "5.00 MB");
    }
}
