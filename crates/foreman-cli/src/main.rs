//! # foreman-cli
//!
//! Binary entry point for Foreman.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Configuration loading and override handling
//! - The `run` entry point into the dispatch loop
//! - Plan validation and audit-log inspection commands

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use foreman_adapters::{CommandBackend, ProcessInvoker};
use foreman_core::{
    EventLog, EventQuery, ForemanConfig, IsolationManager, PatchStore, Plan, RunOutcome, Runner,
    Scheduler,
};
use foreman_proto::{AuditEvent, EventType, Severity};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Output format for the events command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Foreman - execution core for multi-agent development automation
#[derive(Parser, Debug)]
#[command(name = "foreman", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "foreman.yml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a plan
    Run(RunArgs),

    /// Validate a plan and print its execution levels
    Validate(ValidateArgs),

    /// Inspect the audit log
    Events(EventsArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the plan JSON file
    #[arg(short, long)]
    plan: PathBuf,

    /// Repository the tasks operate on
    #[arg(short, long, default_value = ".")]
    repo: PathBuf,

    /// Override the worker pool size
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Override the per-task timeout in seconds
    #[arg(long)]
    task_timeout: Option<u64>,

    /// Show the batch schedule without executing anything
    #[arg(long)]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    /// Path to the plan JSON file
    #[arg(short, long)]
    plan: PathBuf,
}

#[derive(Parser, Debug)]
struct EventsArgs {
    /// Show only the last N events
    #[arg(long)]
    last: Option<usize>,

    /// Filter by entity type (task, worktree, patch, backup, run)
    #[arg(long)]
    entity_type: Option<String>,

    /// Filter by entity ID
    #[arg(long)]
    entity_id: Option<String>,

    /// Filter by event type (snake_case, e.g. task_state_transition)
    #[arg(long)]
    event_type: Option<String>,

    /// Minimum severity (debug, info, warning, error, critical)
    #[arg(long)]
    min_severity: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let exit_code = match cli.command {
        Commands::Run(args) => run_command(&cli.config, args).await?,
        Commands::Validate(args) => validate_command(&cli.config, args)?,
        Commands::Events(args) => events_command(&cli.config, args)?,
    };
    std::process::exit(exit_code)
}

fn load_config(path: &PathBuf) -> Result<ForemanConfig> {
    if path.exists() {
        ForemanConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        Ok(ForemanConfig::default())
    }
}

async fn run_command(config_path: &PathBuf, args: RunArgs) -> Result<i32> {
    let mut config = load_config(config_path)?;
    if let Some(max_parallel) = args.max_parallel {
        config.scheduler.max_parallel = max_parallel;
    }
    if let Some(timeout) = args.task_timeout {
        config.scheduler.task_timeout_seconds = timeout;
    }
    config.validate().context("configuration validation failed")?;

    let plan = Plan::from_file(&args.plan)
        .with_context(|| format!("failed to load plan from {}", args.plan.display()))?;

    let log = Arc::new(EventLog::open(&config.events.path)?);
    let mut scheduler = Scheduler::new(Arc::clone(&log));
    scheduler.load_plan(&plan)?;

    if args.dry_run {
        if let Some(cycle) = scheduler.detect_cycles() {
            anyhow::bail!("dependency cycle: {}", cycle.join(" -> "));
        }
        let batches = scheduler.compute_batches(config.scheduler.max_parallel)?;
        println!("plan: {} tasks in {} batches", plan.tasks.len(), batches.len());
        for (i, batch) in batches.iter().enumerate() {
            println!("  batch {}: {}", i + 1, batch.join(", "));
        }
        return Ok(0);
    }

    let isolation = Arc::new(IsolationManager::new(
        args.repo.clone(),
        &config.isolation,
        Arc::clone(&log),
    )?);
    let patches = Arc::new(PatchStore::open(&config.patches.dir, Arc::clone(&log))?);

    let backend = CommandBackend::from_config(&config.agent)
        .context("failed to resolve agent backend")?;
    let invoker = Arc::new(ProcessInvoker::new(backend));

    let mut runner = Runner::new(scheduler, isolation, patches, invoker, log, config);

    // Ctrl-C cancels between batches; in-flight tasks finish or time out.
    let cancel = runner.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling after current batch");
            cancel.cancel();
        }
    });

    let summary = runner.run().await?;

    println!(
        "run finished in {:.1}s: {} completed, {} failed, {} blocked, {} skipped",
        summary.elapsed.as_secs_f64(),
        summary.completed.len(),
        summary.failed.len(),
        summary.blocked.len(),
        summary.skipped.len()
    );
    for id in &summary.failed {
        let reason = runner
            .scheduler()
            .task(id)
            .and_then(|t| t.failure_reason.clone())
            .unwrap_or_default();
        println!("  failed {id}: {reason}");
    }
    for id in &summary.blocked {
        println!("  blocked {id}: upstream dependency failed");
    }

    Ok(match summary.outcome {
        RunOutcome::Completed => 0,
        RunOutcome::CompletedWithFailures => 1,
        RunOutcome::Cancelled => 130,
    })
}

fn validate_command(config_path: &PathBuf, args: ValidateArgs) -> Result<i32> {
    let config = load_config(config_path)?;
    let plan = Plan::from_file(&args.plan)
        .with_context(|| format!("failed to load plan from {}", args.plan.display()))?;

    let log = Arc::new(EventLog::open(&config.events.path)?);
    let mut scheduler = Scheduler::new(log);
    scheduler.load_plan(&plan)?;

    if let Some(cycle) = scheduler.detect_cycles() {
        eprintln!("dependency cycle: {}", cycle.join(" -> "));
        return Ok(1);
    }

    let levels = scheduler.compute_levels()?;
    println!("plan ok: {} tasks, {} levels", plan.tasks.len(), levels.len());
    for (i, level) in levels.iter().enumerate() {
        println!("  level {}: {}", i + 1, level.join(", "));
    }
    Ok(0)
}

fn events_command(config_path: &PathBuf, args: EventsArgs) -> Result<i32> {
    let config = load_config(config_path)?;
    let log = EventLog::open(&config.events.path)?;

    let mut query = EventQuery {
        entity_type: args.entity_type,
        entity_id: args.entity_id,
        ..EventQuery::default()
    };
    if let Some(raw) = args.event_type {
        let event_type: EventType = serde_json::from_value(serde_json::Value::String(raw))
            .context("unknown event type")?;
        query.event_type = Some(event_type);
    }
    if let Some(raw) = args.min_severity {
        let severity: Severity = serde_json::from_value(serde_json::Value::String(raw))
            .context("unknown severity")?;
        query.min_severity = Some(severity);
    }

    let mut events = log.query(&query)?;
    if let Some(last) = args.last {
        if events.len() > last {
            events.drain(..events.len() - last);
        }
    }

    for event in &events {
        match args.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
            OutputFormat::Text => println!("{}", format_event(event)),
        }
    }
    Ok(0)
}

fn format_event(event: &AuditEvent) -> String {
    let timestamp = event
        .timestamp
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let event_type = serde_json::to_value(event.event_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let states = match (&event.from_state, &event.to_state) {
        (Some(from), Some(to)) => format!(" {from} -> {to}"),
        _ => String::new(),
    };
    format!(
        "{timestamp} {event_type} {}/{}{states}",
        event.entity_type, event.entity_id
    )
}
