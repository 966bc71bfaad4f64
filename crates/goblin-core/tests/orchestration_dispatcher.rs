use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use goblin_core::config::DispatcherConfig;
use goblin_core::gadgets::{EncoderGadget, Gadget, GadgetFuture, GadgetInvocation};
use goblin_core::models::{
    CoreError, CoreErrorKind, ExecutionOutcome, FormSchema, GadgetDescriptor, MinionId,
    MinionState, ModeDescriptor, StatusReport, TaskId, TaskParams, TaskStatus,
};
use goblin_core::orchestration::{Dispatcher, HostUsage, HostUsageProbe};
use goblin_core::registry::GadgetRegistry;
use goblin_core::results::ResultStore;
use serde_json::json;
use tokio::sync::Semaphore;

const WAIT: Duration = Duration::from_secs(5);

fn temp_results_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "goblin-dispatcher-{label}-{}-{nanos}",
        std::process::id()
    ))
}

struct FixedProbe;

impl HostUsageProbe for FixedProbe {
    fn sample(&self) -> HostUsage {
        HostUsage {
            cpu_percent: 12.5,
            memory_percent: 40.0,
        }
    }
}

const GATE: GadgetDescriptor = GadgetDescriptor {
    id: "gate",
    name: "Gate",
    description: "Blocks until a permit is released",
};

const HOLD: ModeDescriptor = ModeDescriptor {
    id: "hold",
    name: "Hold",
    description: "Wait for a permit",
};

/// Waits for a semaphore permit, so tests decide when each run finishes.
#[derive(Clone)]
struct GateGadget {
    gate: Arc<Semaphore>,
    entered: Arc<AtomicUsize>,
}

impl GateGadget {
    fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            entered: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Gadget for GateGadget {
    fn descriptor(&self) -> &GadgetDescriptor {
        &GATE
    }

    fn modes(&self) -> Vec<ModeDescriptor> {
        vec![HOLD]
    }

    fn form_schema(&self, _mode: &str) -> FormSchema {
        json!({})
    }

    fn execute(self: Box<Self>, invocation: GadgetInvocation) -> GadgetFuture {
        Box::pin(async move {
            self.entered.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                permit = self.gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = invocation.signals.cancellation.cancelled() => {
                    return Err(CoreError::new(CoreErrorKind::Cancelled, "gate cancelled"));
                }
            }
            Ok(ExecutionOutcome::completed().preview("opened"))
        })
    }
}

const FLAKY: GadgetDescriptor = GadgetDescriptor {
    id: "flaky",
    name: "Flaky Gadget",
    description: "Fails or panics on demand",
};

const FLAKY_MODES: &[ModeDescriptor] = &[
    ModeDescriptor {
        id: "fail",
        name: "Fail",
        description: "Report an error outcome",
    },
    ModeDescriptor {
        id: "panic",
        name: "Panic",
        description: "Panic inside the handler",
    },
    ModeDescriptor {
        id: "write",
        name: "Write",
        description: "Write a large result file without a preview",
    },
];

struct FlakyGadget;

impl Gadget for FlakyGadget {
    fn descriptor(&self) -> &GadgetDescriptor {
        &FLAKY
    }

    fn modes(&self) -> Vec<ModeDescriptor> {
        FLAKY_MODES.to_vec()
    }

    fn form_schema(&self, _mode: &str) -> FormSchema {
        json!({})
    }

    fn execute(self: Box<Self>, invocation: GadgetInvocation) -> GadgetFuture {
        Box::pin(async move {
            match invocation.mode.as_str() {
                "panic" => panic!("flaky gadget exploded"),
                "write" => {
                    let path = invocation.result_dir.join("big.txt");
                    tokio::fs::write(&path, "x".repeat(1500)).await.unwrap();
                    Ok(ExecutionOutcome::completed().result_file(path))
                }
                _ => Ok(ExecutionOutcome::failed("target unreachable")),
            }
        })
    }
}

struct Harness {
    dispatcher: Dispatcher,
    gate: GateGadget,
    results_dir: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.results_dir);
    }
}

fn harness_with(label: &str, tweak: impl FnOnce(&mut DispatcherConfig)) -> Harness {
    let results_dir = temp_results_dir(label);
    let mut config = DispatcherConfig {
        results_dir: results_dir.clone(),
        cancel_grace_secs: 1,
        ..DispatcherConfig::default()
    };
    tweak(&mut config);

    let gate = GateGadget::new();
    let mut registry = GadgetRegistry::new();
    registry.register(EncoderGadget::new).unwrap();
    registry.register(|| FlakyGadget).unwrap();
    {
        let gate = gate.clone();
        registry.register(move || gate.clone()).unwrap();
    }

    let store = ResultStore::new(&results_dir, config.retention_days).unwrap();
    let dispatcher =
        Dispatcher::new(config, registry, store).with_host_probe(Arc::new(FixedProbe));
    Harness {
        dispatcher,
        gate,
        results_dir,
    }
}

fn harness(label: &str) -> Harness {
    harness_with(label, |_| {})
}

fn input(text: &str) -> TaskParams {
    json!({ "input": text }).as_object().cloned().unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn encoder_base64_encodes_input() {
    let harness = harness("encoder");
    let dispatcher = &harness.dispatcher;

    let task_id = dispatcher
        .submit_mode("encoder", "base64_encode", input("hi"))
        .unwrap();
    let record = dispatcher.wait_for_completion(&task_id, WAIT).await.unwrap();

    assert_eq!(record.status, TaskStatus::Completed);
    let outcome = record.outcome.expect("completed task carries an outcome");
    assert_eq!(outcome.result, Some(json!("aGk=")));
    assert_eq!(outcome.result_preview.as_deref(), Some("aGk="));
    assert_eq!(
        std::fs::read_to_string(record.result_dir.join("result.txt")).unwrap(),
        "aGk="
    );
    assert!(record.result_dir.join("metadata.json").is_file());
    assert!(record.execution_duration.is_some());
    assert_eq!(record.minion, Some(MinionId(1)));
    assert_eq!(dispatcher.task_status(&task_id), StatusReport::Completed);
}

#[tokio::test]
async fn submit_creates_one_task_per_mode() {
    let harness = harness("multi-mode");
    let dispatcher = &harness.dispatcher;

    let modes = vec!["hex_encode".to_string(), "hash_sha256".to_string()];
    let parameters = HashMap::from([
        ("hex_encode".to_string(), input("hi")),
        ("hash_sha256".to_string(), input("abc")),
    ]);
    let receipt = dispatcher.submit("encoder", &modes, &parameters).unwrap();

    assert_eq!(receipt.status, TaskStatus::Busy);
    assert_eq!(receipt.task_ids.len(), 2);
    assert_eq!(receipt.result_dirs.len(), 2);
    assert_ne!(receipt.result_dirs[0], receipt.result_dirs[1]);

    let hex = dispatcher
        .wait_for_completion(&receipt.task_ids[0], WAIT)
        .await
        .unwrap();
    assert_eq!(hex.outcome.unwrap().result, Some(json!("6869")));
}

#[tokio::test]
async fn unknown_gadget_is_rejected_without_a_record() {
    let harness = harness("unknown");
    let dispatcher = &harness.dispatcher;

    let error = dispatcher
        .submit_mode("nope", "base64_encode", TaskParams::new())
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::GadgetNotFound);

    let error = dispatcher
        .submit_mode("encoder", "rot13", TaskParams::new())
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);

    assert!(dispatcher.pending_tasks().unwrap().is_empty());
    assert!(dispatcher.completed_tasks(10).unwrap().is_empty());
    assert!(dispatcher.recent_results(10).unwrap().is_empty());
}

#[tokio::test]
async fn sixth_submission_queues_until_a_minion_frees() {
    let harness = harness("queueing");
    let dispatcher = &harness.dispatcher;

    let started = Instant::now();
    let task_ids = (0..6)
        .map(|_| {
            dispatcher
                .submit_mode("gate", "hold", TaskParams::new())
                .unwrap()
        })
        .collect::<Vec<_>>();
    assert!(started.elapsed() < Duration::from_secs(1));

    let entered = harness.gate.entered.clone();
    wait_until(|| entered.load(Ordering::SeqCst) == 5).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(entered.load(Ordering::SeqCst), 5);
    assert_eq!(dispatcher.task_status(&task_ids[5]), StatusReport::Busy);

    harness.gate.gate.add_permits(1);
    wait_until(|| entered.load(Ordering::SeqCst) == 6).await;

    harness.gate.gate.add_permits(5);
    for task_id in &task_ids {
        let record = dispatcher.wait_for_completion(task_id, WAIT).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn cancel_wins_over_late_completion() {
    let harness = harness("cancel");
    let dispatcher = &harness.dispatcher;

    let task_id = dispatcher
        .submit_mode("gate", "hold", TaskParams::new())
        .unwrap();
    let entered = harness.gate.entered.clone();
    wait_until(|| entered.load(Ordering::SeqCst) == 1).await;

    let report = dispatcher.cancel_task(&task_id);
    assert!(report.is_success(), "{}", report.message);

    let record = dispatcher.wait_for_completion(&task_id, WAIT).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(record.error.as_deref(), Some("cancelled by user"));

    harness.gate.gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let record = dispatcher.task_details(&task_id).unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(record.error.as_deref(), Some("cancelled by user"));
    assert_eq!(dispatcher.completed_tasks(10).unwrap().len(), 1);

    let again = dispatcher.cancel_task(&task_id);
    assert!(!again.is_success());
    assert!(!dispatcher.cancel_task(&TaskId::from("missing")).is_success());
}

#[tokio::test]
async fn cancelling_a_queued_task_never_runs_it() {
    let harness = harness("cancel-queued");
    let dispatcher = &harness.dispatcher;

    let held = (0..5)
        .map(|_| {
            dispatcher
                .submit_mode("gate", "hold", TaskParams::new())
                .unwrap()
        })
        .collect::<Vec<_>>();
    let entered = harness.gate.entered.clone();
    wait_until(|| entered.load(Ordering::SeqCst) == 5).await;

    let queued = dispatcher
        .submit_mode("gate", "hold", TaskParams::new())
        .unwrap();
    assert_eq!(dispatcher.task_status(&queued), StatusReport::Busy);

    let report = dispatcher.cancel_task(&queued);
    assert!(report.is_success(), "{}", report.message);
    let record = dispatcher.wait_for_completion(&queued, WAIT).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(record.error.as_deref(), Some("cancelled by user"));
    assert_eq!(record.minion, None);

    harness.gate.gate.add_permits(5);
    for task_id in &held {
        let record = dispatcher.wait_for_completion(task_id, WAIT).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }
    assert_eq!(entered.load(Ordering::SeqCst), 5);

    let record = dispatcher.task_details(&queued).unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(record.error.as_deref(), Some("cancelled by user"));
    assert!(dispatcher.pending_tasks().unwrap().is_empty());
    wait_until(|| {
        dispatcher
            .minion_metrics()
            .unwrap()
            .minions
            .values()
            .all(|state| *state == MinionState::Idle)
    })
    .await;

    let fresh = dispatcher
        .submit_mode("encoder", "hex_encode", input("hi"))
        .unwrap();
    let record = dispatcher.wait_for_completion(&fresh, WAIT).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
}

#[tokio::test]
async fn retry_creates_a_linked_task_and_leaves_the_original() {
    let harness = harness("retry");
    let dispatcher = &harness.dispatcher;

    let failed_id = dispatcher
        .submit_mode("flaky", "fail", TaskParams::new())
        .unwrap();
    let failed = dispatcher.wait_for_completion(&failed_id, WAIT).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Error);
    assert_eq!(failed.error.as_deref(), Some("target unreachable"));

    let report = dispatcher.retry_task(&failed_id);
    assert!(report.is_success(), "{}", report.message);
    let retry_id = report.new_task_id.expect("retry returns the new id");
    assert_ne!(retry_id, failed_id);

    let retried = dispatcher.wait_for_completion(&retry_id, WAIT).await.unwrap();
    assert_eq!(retried.retry_of, Some(failed_id.clone()));
    assert_ne!(retried.result_dir, failed.result_dir);
    assert_eq!(dispatcher.task_details(&failed_id).unwrap(), failed);

    let ok_id = dispatcher
        .submit_mode("encoder", "hex_encode", input("hi"))
        .unwrap();
    dispatcher.wait_for_completion(&ok_id, WAIT).await.unwrap();
    assert!(!dispatcher.retry_task(&ok_id).is_success());
    assert!(!dispatcher.retry_task(&TaskId::from("missing")).is_success());
}

#[tokio::test]
async fn handler_panic_becomes_an_error_record() {
    let harness = harness("panic");
    let dispatcher = &harness.dispatcher;

    let task_id = dispatcher
        .submit_mode("flaky", "panic", TaskParams::new())
        .unwrap();
    let record = dispatcher.wait_for_completion(&task_id, WAIT).await.unwrap();

    assert_eq!(record.status, TaskStatus::Error);
    assert!(record.error.unwrap().contains("flaky gadget exploded"));
}

#[tokio::test]
async fn hard_timeout_marks_the_task_as_error() {
    let harness = harness_with("timeout", |config| {
        config.hard_timeout_secs = 1;
        config.soft_timeout_secs = 0;
    });
    let dispatcher = &harness.dispatcher;

    let task_id = dispatcher
        .submit_mode("gate", "hold", TaskParams::new())
        .unwrap();
    let record = dispatcher.wait_for_completion(&task_id, WAIT).await.unwrap();

    assert_eq!(record.status, TaskStatus::Error);
    assert_eq!(
        record.error.as_deref(),
        Some("task exceeded hard timeout of 1s")
    );
}

#[tokio::test]
async fn result_file_without_preview_gets_a_fallback_preview() {
    let harness = harness("preview");
    let dispatcher = &harness.dispatcher;

    let task_id = dispatcher
        .submit_mode("flaky", "write", TaskParams::new())
        .unwrap();
    let record = dispatcher.wait_for_completion(&task_id, WAIT).await.unwrap();

    let preview = record.outcome.unwrap().result_preview.unwrap();
    assert_eq!(preview.chars().count(), 1000);

    let details = dispatcher.result_details(&task_id).unwrap();
    let names = details
        .files
        .iter()
        .map(|file| file.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["big.txt"]);
    assert_eq!(details.metadata["gadget"], "Flaky Gadget");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fallback_preview_is_recorded_with_the_completion() {
    let harness = harness("preview-threaded");
    let dispatcher = &harness.dispatcher;

    let task_id = dispatcher
        .submit_mode("flaky", "write", TaskParams::new())
        .unwrap();
    wait_until(|| dispatcher.task_status(&task_id) == StatusReport::Completed).await;

    let record = dispatcher.task_details(&task_id).unwrap();
    let preview = record.outcome.unwrap().result_preview.unwrap();
    assert_eq!(preview, "x".repeat(1000));
}

#[tokio::test]
async fn concurrent_submissions_get_unique_ids() {
    let harness = harness("unique-ids");
    let dispatcher = harness.dispatcher.clone();

    let handles = (0..20)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .submit_mode("encoder", "hex_encode", input("hi"))
                    .unwrap()
            })
        })
        .collect::<Vec<_>>();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 20);

    for task_id in &ids {
        dispatcher.wait_for_completion(task_id, WAIT).await.unwrap();
    }
}

#[tokio::test]
async fn views_stay_disjoint_and_completed_is_newest_first() {
    let harness = harness("views");
    let dispatcher = &harness.dispatcher;

    let held = dispatcher
        .submit_mode("gate", "hold", TaskParams::new())
        .unwrap();
    let mut finished = Vec::new();
    for text in ["a", "b", "c"] {
        let task_id = dispatcher
            .submit_mode("encoder", "hex_encode", input(text))
            .unwrap();
        dispatcher.wait_for_completion(&task_id, WAIT).await.unwrap();
        finished.push(task_id);
    }

    let completed = dispatcher.completed_tasks(2).unwrap();
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[0].task_id, finished[2]);
    assert_eq!(completed[1].task_id, finished[1]);

    let pending = dispatcher
        .pending_tasks()
        .unwrap()
        .into_iter()
        .map(|record| record.task_id)
        .collect::<HashSet<_>>();
    let done = dispatcher
        .completed_tasks(100)
        .unwrap()
        .into_iter()
        .map(|record| record.task_id)
        .collect::<HashSet<_>>();
    assert!(pending.is_disjoint(&done));
    assert_eq!(pending.len() + done.len(), 4);
    assert!(pending.contains(&held));

    let live = dispatcher.minion_status().unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live.get(&held), Some(&TaskStatus::Busy));

    harness.gate.gate.add_permits(1);
    dispatcher.wait_for_completion(&held, WAIT).await.unwrap();
    assert!(dispatcher.minion_status().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_task_status_is_sleeping() {
    let harness = harness("sleeping");
    assert_eq!(
        harness.dispatcher.task_status(&TaskId::from("nope_mode_1")),
        StatusReport::Sleeping
    );
    assert_eq!(
        harness
            .dispatcher
            .task_details(&TaskId::from("nope_mode_1"))
            .unwrap_err()
            .kind,
        CoreErrorKind::NotFound
    );
}

#[tokio::test]
async fn pause_and_resume_return_structured_reports() {
    let harness = harness("pause");
    let dispatcher = &harness.dispatcher;

    let paused = dispatcher.pause_minion(MinionId(1));
    assert!(paused.is_success());
    assert_eq!(paused.message, "Minion 1 paused");

    let again = dispatcher.pause_minion(MinionId(1));
    assert!(!again.is_success());
    assert_eq!(again.message, "Minion already paused");

    let not_paused = dispatcher.resume_minion(MinionId(2));
    assert_eq!(not_paused.message, "Minion not paused");
    assert!(!dispatcher.pause_minion(MinionId(99)).is_success());

    let task_id = dispatcher
        .submit_mode("encoder", "hex_encode", input("hi"))
        .unwrap();
    let record = dispatcher.wait_for_completion(&task_id, WAIT).await.unwrap();
    assert_eq!(record.minion, Some(MinionId(2)));

    let minions = dispatcher.minion_metrics().unwrap().minions;
    assert_eq!(minions.len(), 5);
    assert_eq!(minions[&MinionId(1)], MinionState::Paused);
    assert_eq!(minions[&MinionId(5)].label(), "Idle Goblin");

    assert!(dispatcher.resume_minion(MinionId(1)).is_success());
    assert!(dispatcher.minion_metrics().unwrap().paused_minions.is_empty());
}

#[tokio::test]
async fn metrics_track_completions_and_error_rate() {
    let harness = harness("metrics");
    let dispatcher = &harness.dispatcher;

    let ok = dispatcher
        .submit_mode("encoder", "hex_encode", input("hi"))
        .unwrap();
    let failed = dispatcher
        .submit_mode("flaky", "fail", TaskParams::new())
        .unwrap();
    dispatcher.wait_for_completion(&ok, WAIT).await.unwrap();
    dispatcher.wait_for_completion(&failed, WAIT).await.unwrap();

    let metrics = dispatcher.minion_metrics().unwrap();
    assert_eq!(metrics.total_completed, 2);
    assert_eq!(metrics.error_rate, 50.0);
    assert_eq!(metrics.active_count, 0);
    assert_eq!(metrics.pending_count, 0);
    assert_eq!(metrics.concurrency, 5);
    assert_eq!(metrics.host.cpu_percent, 12.5);
}

#[tokio::test]
async fn start_sweeps_once_and_refuses_a_second_start() {
    let harness = harness("start");
    let dispatcher = &harness.dispatcher;

    let report = dispatcher.start().unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(
        dispatcher.start().unwrap_err().kind,
        CoreErrorKind::Conflict
    );
    assert!(dispatcher.shutdown(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn shutdown_cancels_live_tasks_and_rejects_new_work() {
    let harness = harness("shutdown");
    let dispatcher = &harness.dispatcher;

    let task_id = dispatcher
        .submit_mode("gate", "hold", TaskParams::new())
        .unwrap();
    let entered = harness.gate.entered.clone();
    wait_until(|| entered.load(Ordering::SeqCst) == 1).await;

    assert!(dispatcher.shutdown(Duration::from_secs(1)).await);
    assert_eq!(
        dispatcher.task_details(&task_id).unwrap().status,
        TaskStatus::Cancelled
    );

    let receipt = dispatcher
        .submit(
            "encoder",
            &["hex_encode".to_string()],
            &HashMap::from([("hex_encode".to_string(), input("hi"))]),
        )
        .unwrap();
    assert_eq!(receipt.status, TaskStatus::Error);
    let record = dispatcher.task_details(&receipt.task_ids[0]).unwrap();
    assert_eq!(record.status, TaskStatus::Error);
    assert!(record.error.unwrap().contains("shut down"));
}

#[test]
fn submission_without_a_runtime_is_recorded_as_error() {
    let harness = harness("no-runtime");
    let dispatcher = &harness.dispatcher;

    let receipt = dispatcher
        .submit(
            "encoder",
            &["hex_encode".to_string()],
            &HashMap::from([("hex_encode".to_string(), input("hi"))]),
        )
        .unwrap();

    assert_eq!(receipt.status, TaskStatus::Error);
    let record = dispatcher.task_details(&receipt.task_ids[0]).unwrap();
    assert_eq!(record.status, TaskStatus::Error);
    assert!(record.error.unwrap().contains("runtime"));
    assert!(dispatcher.pending_tasks().unwrap().is_empty());
}
