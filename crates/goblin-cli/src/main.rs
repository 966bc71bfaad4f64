use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use goblin_core::config::DispatcherConfig;
use goblin_core::execution::TokioProcessExecutor;
use goblin_core::models::{TaskParams, TaskStatus};
use goblin_core::orchestration::Dispatcher;
use goblin_core::registry::GadgetRegistry;
use goblin_core::results::ResultStore;
use tracing_subscriber::EnvFilter;

/// Goblin Forge: run gadgets and manage their results
#[derive(Parser, Debug)]
#[command(name = "goblin")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered gadgets and their modes
    Gadgets,
    /// Run one gadget mode and wait for it to finish
    Run {
        gadget: String,
        mode: String,
        /// Parameter as key=value; repeatable
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Parameters as a JSON object, merged before --param values
        #[arg(long)]
        params_json: Option<String>,
        /// Seconds to wait before giving up on the task
        #[arg(long, default_value = "3600")]
        wait_secs: u64,
    },
    /// List recent result directories
    Results {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Remove result directories past the retention window
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config =
        DispatcherConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let dispatcher = build_dispatcher(config)?;

    match args.command {
        Command::Gadgets => print_json(&dispatcher.list_gadgets()),
        Command::Results { limit } => print_json(&dispatcher.recent_results(limit)?),
        Command::Sweep => print_json(&dispatcher.cleanup_results()),
        Command::Run {
            gadget,
            mode,
            params,
            params_json,
            wait_secs,
        } => {
            let params = collect_params(params_json.as_deref(), params)?;
            run(&dispatcher, &gadget, &mode, params, Duration::from_secs(wait_secs)).await
        }
    }
}

fn build_dispatcher(config: DispatcherConfig) -> anyhow::Result<Dispatcher> {
    let store = ResultStore::new(&config.results_dir, config.retention_days)
        .context("failed to open results directory")?;
    let registry =
        GadgetRegistry::with_builtin_gadgets(Arc::new(TokioProcessExecutor), config.cancel_grace())
            .context("failed to register gadgets")?;
    Ok(Dispatcher::new(config, registry, store))
}

async fn run(
    dispatcher: &Dispatcher,
    gadget: &str,
    mode: &str,
    params: TaskParams,
    wait: Duration,
) -> anyhow::Result<()> {
    dispatcher.start()?;
    let task_id = dispatcher.submit_mode(gadget, mode, params)?;
    tracing::info!(task_id = %task_id, "waiting for task");

    let record = tokio::select! {
        record = dispatcher.wait_for_completion(&task_id, wait) => record?,
        _ = tokio::signal::ctrl_c() => {
            let report = dispatcher.cancel_task(&task_id);
            tracing::warn!(task_id = %task_id, message = %report.message, "interrupted");
            dispatcher.task_details(&task_id)?
        }
    };

    let grace = dispatcher.config().cancel_grace();
    dispatcher.shutdown(grace).await;
    print_json(&record)?;

    if record.status != TaskStatus::Completed {
        bail!(
            "task {} finished as {:?}: {}",
            record.task_id,
            record.status,
            record.error.as_deref().unwrap_or("no error message")
        );
    }
    Ok(())
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn collect_params(
    json: Option<&str>,
    pairs: Vec<(String, String)>,
) -> anyhow::Result<TaskParams> {
    let mut params = match json {
        Some(raw) => serde_json::from_str::<TaskParams>(raw)
            .context("--params-json must be a JSON object")?,
        None => TaskParams::new(),
    };
    for (key, value) in pairs {
        params.insert(key, serde_json::Value::String(value));
    }
    Ok(params)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
