use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::execution::{
    CommandSpec, ProcessExecutor, ProcessExitStatus, ProcessSpawnRequest, run_observing_signals,
};
use crate::gadgets::{
    Gadget, GadgetFuture, GadgetInvocation, GadgetResult, is_executable_file, locate_binary,
    param_str, storage_failure, write_json,
};
use crate::models::{
    CoreError, CoreErrorKind, ExecutionOutcome, FormSchema, GadgetDescriptor, ModeDescriptor,
    TaskParams,
};

pub const NMAP_BINARY: &str = "nmap";

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const DESCRIPTOR: GadgetDescriptor = GadgetDescriptor {
    id: "scanner",
    name: "Network Scanner",
    description: "Scans networks and hosts for open ports and services",
};

const MODES: &[ModeDescriptor] = &[
    ModeDescriptor {
        id: "quick_scan",
        name: "Quick Scan",
        description: "Fast scan of common ports on a target",
    },
    ModeDescriptor {
        id: "full_scan",
        name: "Full Scan",
        description: "Complete port scan with service detection",
    },
    ModeDescriptor {
        id: "vuln_scan",
        name: "Vulnerability Scan",
        description: "Scan for common vulnerabilities",
    },
    ModeDescriptor {
        id: "stealth_scan",
        name: "Stealth Scan",
        description: "Perform a quiet, stealthy scan",
    },
    ModeDescriptor {
        id: "os_detection",
        name: "OS Detection",
        description: "Detect operating system of target",
    },
    ModeDescriptor {
        id: "custom_scan",
        name: "Custom Scan",
        description: "Scan with custom parameters",
    },
];

/// Drives the external `nmap` binary in its own process group.
#[derive(Clone)]
pub struct ScannerGadget {
    executor: Arc<dyn ProcessExecutor>,
    binary: Option<PathBuf>,
    grace_period: Duration,
}

impl ScannerGadget {
    pub fn new(executor: Arc<dyn ProcessExecutor>, binary: Option<PathBuf>) -> Self {
        Self {
            executor,
            binary,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Looks `nmap` up on `PATH`. Registration fails later if nothing was found.
    pub fn discover(executor: Arc<dyn ProcessExecutor>) -> Self {
        Self::new(executor, locate_binary(NMAP_BINARY))
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn binary(&self) -> Option<&PathBuf> {
        self.binary.as_ref()
    }
}

impl Gadget for ScannerGadget {
    fn descriptor(&self) -> &GadgetDescriptor {
        &DESCRIPTOR
    }

    fn modes(&self) -> Vec<ModeDescriptor> {
        MODES.to_vec()
    }

    fn form_schema(&self, mode: &str) -> FormSchema {
        let mut schema = json!({
            "target": {
                "type": "string",
                "label": "Target IP/Hostname",
                "required": true,
                "placeholder": "192.168.1.1 or example.com",
                "description": "IP address or hostname to scan",
            }
        });

        let extra = match mode {
            "full_scan" => Some((
                "port_range",
                json!({
                    "type": "string",
                    "label": "Port Range",
                    "required": false,
                    "placeholder": "1-65535",
                    "default": "1-1000",
                    "description": "Range of ports to scan (e.g., 1-1000, 80,443,8080)",
                }),
            )),
            "vuln_scan" => Some((
                "vuln_categories",
                json!({
                    "type": "multiselect",
                    "label": "Vulnerability Categories",
                    "options": [
                        {"value": "web", "label": "Web Vulnerabilities"},
                        {"value": "sql", "label": "SQL Injection"},
                        {"value": "rce", "label": "Remote Code Execution"},
                        {"value": "default", "label": "Default Credentials"},
                    ],
                    "default": ["web"],
                    "description": "Types of vulnerabilities to scan for",
                }),
            )),
            "stealth_scan" => Some((
                "timing",
                json!({
                    "type": "select",
                    "label": "Scan Timing",
                    "options": [
                        {"value": "paranoid", "label": "Paranoid (0)"},
                        {"value": "sneaky", "label": "Sneaky (1)"},
                        {"value": "polite", "label": "Polite (2)"},
                        {"value": "normal", "label": "Normal (3)"},
                    ],
                    "default": "sneaky",
                    "description": "Speed and aggressiveness of the scan",
                }),
            )),
            "custom_scan" => Some((
                "custom_args",
                json!({
                    "type": "string",
                    "label": "Custom Arguments",
                    "required": true,
                    "placeholder": "-sS -sV -p 22,80,443",
                    "description": "Custom scan arguments",
                }),
            )),
            _ => None,
        };

        if let Some((key, field)) = extra
            && let Value::Object(fields) = &mut schema
        {
            fields.insert(key.to_string(), field);
        }
        schema
    }

    fn validate(&self) -> GadgetResult<()> {
        match &self.binary {
            Some(path) if is_executable_file(path) => Ok(()),
            Some(path) => Err(CoreError::new(
                CoreErrorKind::ProcessFailure,
                format!("'{}' is not an executable file", path.display()),
            )
            .gadget(DESCRIPTOR.id)),
            None => Err(CoreError::new(
                CoreErrorKind::ProcessFailure,
                format!("required binary '{NMAP_BINARY}' was not found on PATH"),
            )
            .gadget(DESCRIPTOR.id)),
        }
    }

    fn execute(self: Box<Self>, invocation: GadgetInvocation) -> GadgetFuture {
        Box::pin(async move {
            let GadgetInvocation {
                task_id,
                mode,
                params,
                result_dir,
                signals,
            } = invocation;

            let binary = self.binary.clone().ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::ProcessFailure,
                    format!("required binary '{NMAP_BINARY}' is not available"),
                )
                .gadget(DESCRIPTOR.id)
                .task(task_id.clone())
            })?;

            write_json(
                DESCRIPTOR.id,
                &task_id,
                &result_dir.join("params.json"),
                &json!({"mode": mode, "params": params}),
            )
            .await?;

            let target = param_str(&params, "target").unwrap_or("localhost").trim();
            if target.is_empty() || target.starts_with('-') {
                return Ok(ExecutionOutcome::failed(format!(
                    "invalid scan target '{target}'"
                )));
            }
            let args = match scan_args(&mode, &params, target) {
                Ok(args) => args,
                Err(message) => return Ok(ExecutionOutcome::failed(message)),
            };

            let command = CommandSpec::new(&binary)
                .args(args)
                .working_dir(&result_dir);
            let rendered = command.display();
            tracing::info!(task_id = %task_id, mode = %mode, command = %rendered, "executing scan");

            let request = ProcessSpawnRequest::new(DESCRIPTOR.id, command).task_id(task_id.clone());
            let output = run_observing_signals(
                self.executor.as_ref(),
                request,
                &signals,
                self.grace_period,
            )
            .await;

            let error_file = result_dir.join("scan_errors.txt");
            let output = match output {
                Ok(output) => output,
                Err(error) => {
                    let message = format!("error executing scan: {}", error.message);
                    tracing::error!(task_id = %task_id, error = %message, "scan failed to run");
                    tokio::fs::write(&error_file, message.as_bytes())
                        .await
                        .map_err(|io_error| {
                            storage_failure(DESCRIPTOR.id, &task_id, &error_file, io_error)
                        })?;
                    return Ok(ExecutionOutcome::failed(message)
                        .result(json!({"command": rendered})));
                }
            };

            if signals.cancellation.is_cancelled() {
                return Err(CoreError::new(CoreErrorKind::Cancelled, "scan cancelled")
                    .gadget(DESCRIPTOR.id)
                    .task(task_id));
            }

            let output_file = result_dir.join("scan_results.txt");
            tokio::fs::write(&output_file, &output.stdout)
                .await
                .map_err(|io_error| storage_failure(DESCRIPTOR.id, &task_id, &output_file, io_error))?;
            if !output.stderr.is_empty() {
                tokio::fs::write(&error_file, &output.stderr)
                    .await
                    .map_err(|io_error| {
                        storage_failure(DESCRIPTOR.id, &task_id, &error_file, io_error)
                    })?;
            }

            let return_code = match output.status {
                ProcessExitStatus::ExitCode(code) => Some(code),
                ProcessExitStatus::Terminated => None,
            };
            let succeeded = return_code == Some(0) && !signals.soft_timeout.is_expired();

            write_json(
                DESCRIPTOR.id,
                &task_id,
                &result_dir.join("summary.json"),
                &json!({
                    "target": target,
                    "command": rendered,
                    "mode": mode,
                    "status": if succeeded { "completed" } else { "error" },
                    "return_code": return_code,
                    "result_files": [
                        {"name": "scan_results.txt", "path": output_file.display().to_string()}
                    ],
                }),
            )
            .await?;

            let details = json!({"command": rendered, "return_code": return_code});
            let outcome = if succeeded {
                ExecutionOutcome::completed()
            } else if signals.soft_timeout.is_expired() {
                ExecutionOutcome::failed("scan stopped after reaching the soft timeout")
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let reason = stderr.trim();
                ExecutionOutcome::failed(match return_code {
                    Some(code) if reason.is_empty() => format!("nmap exited with status {code}"),
                    Some(code) => format!("nmap exited with status {code}: {reason}"),
                    None => "nmap was terminated by a signal".to_string(),
                })
            };

            Ok(outcome.result_file(output_file).result(details))
        })
    }
}

fn scan_args(mode: &str, params: &TaskParams, target: &str) -> Result<Vec<String>, String> {
    let mut args: Vec<String> = match mode {
        "quick_scan" => vec!["-F".to_string()],
        "full_scan" => {
            let ports = param_str(params, "port_range").unwrap_or("1-1000");
            vec!["-p".to_string(), ports.to_string(), "-sV".to_string()]
        }
        "vuln_scan" => vec!["--script=vuln".to_string()],
        "stealth_scan" => {
            let timing = match param_str(params, "timing").unwrap_or("sneaky") {
                "paranoid" => "0",
                "polite" => "2",
                "normal" => "3",
                _ => "1",
            };
            vec![format!("-T{timing}"), "-sS".to_string()]
        }
        "os_detection" => vec!["-O".to_string()],
        "custom_scan" => {
            let custom = param_str(params, "custom_args").unwrap_or_default();
            let split: Vec<String> = custom.split_whitespace().map(str::to_string).collect();
            if split.is_empty() {
                return Err("custom_args parameter is required".to_string());
            }
            split
        }
        other => return Err(format!("unknown mode: {other}")),
    };
    args.push(target.to_string());
    Ok(args)
}
