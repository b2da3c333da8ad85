//! The run loop: dispatches parallel-safe batches to agent adapters.
//!
//! The runner drives the whole pipeline. It performs the upfront cycle
//! check, then walks level-ordered batches: each task gets an isolated
//! worktree, an agent invocation bounded by a timeout, patch capture and
//! scope validation, and a merge back under the ref lock. A batch's tasks
//! run fully concurrently; a later batch never starts before the previous
//! one reached terminal states.

use crate::config::ForemanConfig;
use crate::event_log::EventLog;
use crate::patch::PatchStore;
use crate::plan::TaskDescriptor;
use crate::scheduler::{Scheduler, TaskState};
use crate::scope::FileScope;
use crate::worktree::{IsolationManager, MergeOutcome};
use foreman_proto::{AgentInvoker, AuditEvent, Error, EventType, Result, Severity};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task completed.
    Completed,
    /// Every task reached a terminal or blocked state, at least one failed.
    CompletedWithFailures,
    /// The run was cancelled between batches.
    Cancelled,
}

/// Final report of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Tasks that completed.
    pub completed: Vec<String>,
    /// Tasks that failed, with their recorded reasons queryable by ID.
    pub failed: Vec<String>,
    /// Tasks permanently blocked by a failed dependency.
    pub blocked: Vec<String>,
    /// Tasks never dispatched (cancellation).
    pub skipped: Vec<String>,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Whether anything went wrong.
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Cooperative cancellation flag. Cancelling stops the run between
/// batches; in-flight tasks finish or time out, since the unit of work is
/// an external process whose partial state is unsafe to interrupt.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Dispatches a scheduled plan through the isolation, patch, and audit
/// subsystems.
pub struct Runner {
    scheduler: Scheduler,
    isolation: Arc<IsolationManager>,
    patches: Arc<PatchStore>,
    invoker: Arc<dyn AgentInvoker>,
    log: Arc<EventLog>,
    config: ForemanConfig,
    cancel: CancelHandle,
    run_id: String,
}

impl Runner {
    /// Creates a runner over already-constructed subsystems.
    pub fn new(
        scheduler: Scheduler,
        isolation: Arc<IsolationManager>,
        patches: Arc<PatchStore>,
        invoker: Arc<dyn AgentInvoker>,
        log: Arc<EventLog>,
        config: ForemanConfig,
    ) -> Self {
        Self {
            scheduler,
            isolation,
            patches,
            invoker,
            log,
            config,
            cancel: CancelHandle::default(),
            run_id: Uuid::new_v4().to_string(),
        }
    }

    /// Handle for cancelling this run between batches.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// The scheduler owning task state.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Executes the plan to completion, failure-exhaustion, or cancellation.
    ///
    /// A dependency cycle aborts before any task runs; a single task
    /// failure blocks only its transitive dependents while independent
    /// branches of the graph continue.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        self.log.emit(
            AuditEvent::new(EventType::RunStarted, "run", self.run_id.as_str()).with_metadata(
                serde_json::json!({
                    "tasks": self.scheduler.len(),
                    "max_parallel": self.config.scheduler.max_parallel,
                }),
            ),
        )?;

        if let Some(path) = self.scheduler.detect_cycles() {
            error!(cycle = ?path, "dependency cycle; aborting plan");
            self.log.emit(
                AuditEvent::new(EventType::Failed, "run", self.run_id.as_str())
                    .with_severity(Severity::Critical)
                    .with_metadata(serde_json::json!({ "cycle": path })),
            )?;
            return Err(Error::CycleDetected { path });
        }

        let batches = self
            .scheduler
            .compute_batches(self.config.scheduler.max_parallel)?;
        info!(run = %self.run_id, batches = batches.len(), "run starting");

        let mut cancelled = false;
        for batch in batches {
            if self.cancel.is_cancelled() {
                cancelled = true;
                warn!(run = %self.run_id, "run cancelled between batches");
                self.log.emit(
                    AuditEvent::new(EventType::RunCancelled, "run", self.run_id.as_str())
                        .with_severity(Severity::Warning),
                )?;
                break;
            }

            let ready = self.scheduler.get_ready_tasks()?;
            // a task whose dependency failed never became ready; skip it
            let runnable: Vec<String> =
                batch.into_iter().filter(|id| ready.contains(id)).collect();
            if runnable.is_empty() {
                continue;
            }

            self.dispatch_batch(runnable).await?;
        }

        let summary = self.summarize(started.elapsed(), cancelled);
        self.emit_outcome(&summary)?;
        Ok(summary)
    }

    /// Runs one batch's tasks fully concurrently and records verdicts.
    async fn dispatch_batch(&mut self, batch: Vec<String>) -> Result<()> {
        debug!(tasks = ?batch, "dispatching batch");
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut set = JoinSet::new();

        for id in batch {
            self.scheduler.mark_running(&id)?;
            in_flight.insert(id.clone());

            let descriptor = self
                .scheduler
                .task(&id)
                .expect("running task exists")
                .descriptor
                .clone();
            let ctx = TaskContext {
                id: id.clone(),
                descriptor,
                isolation: Arc::clone(&self.isolation),
                patches: Arc::clone(&self.patches),
                invoker: Arc::clone(&self.invoker),
                log: Arc::clone(&self.log),
                timeout_secs: self.config.scheduler.task_timeout_seconds,
                max_retries: self.config.scheduler.max_retries,
                retry_base_delay: Duration::from_millis(self.config.scheduler.retry_base_delay_ms),
                branch_prefix: self.config.isolation.branch_prefix.clone(),
                integration_branch: self.config.isolation.integration_branch.clone(),
            };
            set.spawn(async move {
                let verdict = execute_task(ctx).await;
                (id, verdict)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, verdict)) => {
                    in_flight.remove(&id);
                    match verdict {
                        TaskVerdict::Completed => self.scheduler.mark_completed(&id)?,
                        TaskVerdict::Failed { reason } => {
                            self.scheduler.mark_failed(&id, &reason)?;
                        }
                    }
                }
                Err(join_err) => {
                    error!(error = %join_err, "worker task aborted");
                }
            }
        }

        // a panicked worker never reported back; its task must not be left running
        for id in in_flight {
            self.scheduler.mark_failed(&id, "worker aborted unexpectedly")?;
        }
        Ok(())
    }

    fn summarize(&self, elapsed: Duration, cancelled: bool) -> RunSummary {
        let completed = self.scheduler.tasks_in_state(TaskState::Completed);
        let failed = self.scheduler.tasks_in_state(TaskState::Failed);
        let blocked: Vec<String> = self.scheduler.blocked_by_failure().into_iter().collect();
        let skipped: Vec<String> = self
            .scheduler
            .tasks_in_state(TaskState::Pending)
            .into_iter()
            .chain(self.scheduler.tasks_in_state(TaskState::Ready))
            .filter(|id| !blocked.contains(id))
            .collect();

        let outcome = if cancelled {
            RunOutcome::Cancelled
        } else if failed.is_empty() {
            RunOutcome::Completed
        } else {
            RunOutcome::CompletedWithFailures
        };

        RunSummary {
            outcome,
            completed,
            failed,
            blocked,
            skipped,
            elapsed,
        }
    }

    fn emit_outcome(&self, summary: &RunSummary) -> Result<()> {
        let metadata = serde_json::json!({
            "completed": summary.completed.len(),
            "failed": summary.failed.len(),
            "blocked": summary.blocked.len(),
            "skipped": summary.skipped.len(),
            "elapsed_secs": summary.elapsed.as_secs_f64(),
        });
        let event = match summary.outcome {
            RunOutcome::Completed => {
                AuditEvent::new(EventType::Completed, "run", self.run_id.as_str())
                    .with_metadata(metadata)
            }
            RunOutcome::CompletedWithFailures | RunOutcome::Cancelled => {
                AuditEvent::new(EventType::Failed, "run", self.run_id.as_str())
                    .with_severity(Severity::Error)
                    .with_metadata(metadata)
            }
        };
        self.log.emit(event)?;
        info!(
            run = %self.run_id,
            outcome = ?summary.outcome,
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            "run finished"
        );
        Ok(())
    }
}

/// Everything one worker needs, cloned out of the runner so the borrow
/// does not cross the spawn.
struct TaskContext {
    id: String,
    descriptor: TaskDescriptor,
    isolation: Arc<IsolationManager>,
    patches: Arc<PatchStore>,
    invoker: Arc<dyn AgentInvoker>,
    log: Arc<EventLog>,
    timeout_secs: u64,
    max_retries: u32,
    retry_base_delay: Duration,
    branch_prefix: String,
    integration_branch: String,
}

enum TaskVerdict {
    Completed,
    Failed { reason: String },
}

/// Exponential backoff delay for the given 1-indexed attempt.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

async fn execute_task(ctx: TaskContext) -> TaskVerdict {
    match run_pipeline(&ctx).await {
        Ok(()) => TaskVerdict::Completed,
        Err(reason) => {
            warn!(task = %ctx.id, reason = %reason, "task failed");
            TaskVerdict::Failed { reason }
        }
    }
}

/// Worktree -> invoke -> capture -> validate -> commit -> merge. Any error
/// leaves the worktree in place for inspection; only a clean merge removes
/// it.
async fn run_pipeline(ctx: &TaskContext) -> std::result::Result<(), String> {
    let branch = format!("{}/{}", ctx.branch_prefix, ctx.id);
    let agent_id = format!("worker-{}", ctx.id);

    // the declared scope must compile before any work happens
    let scope = FileScope::parse(&ctx.descriptor.file_scope).map_err(|e| e.to_string())?;

    let handle = {
        let isolation = Arc::clone(&ctx.isolation);
        let (agent, branch, task) = (agent_id.clone(), branch.clone(), ctx.id.clone());
        tokio::task::spawn_blocking(move || isolation.create_worktree(&agent, &branch, &task))
            .await
            .map_err(|e| format!("worktree worker aborted: {e}"))?
            .map_err(|e| format!("worktree creation failed: {e}"))?
    };
    ctx.isolation.occupy(&ctx.id).map_err(|e| e.to_string())?;

    let instructions = ctx.descriptor.instructions().unwrap_or("").to_string();
    let timeout = (ctx.timeout_secs > 0).then(|| Duration::from_secs(ctx.timeout_secs));

    let mut attempt = 0u32;
    let successful_attempt = loop {
        attempt += 1;
        ctx.log
            .emit(
                AuditEvent::new(EventType::ProcessStarted, "task", ctx.id.as_str()).with_metadata(
                    serde_json::json!({
                        "attempt": attempt,
                        "workdir": handle.path.display().to_string(),
                    }),
                ),
            )
            .map_err(|e| e.to_string())?;

        let invoked = ctx
            .invoker
            .invoke(&handle.path, &instructions, timeout)
            .await;

        let failure = match invoked {
            Ok(outcome) if outcome.timed_out => {
                // worktree left intact for inspection, no retry on a spent budget
                return Err(format!("timeout after {}s", ctx.timeout_secs));
            }
            Ok(outcome) if outcome.success() => break attempt,
            Ok(outcome) => format!("agent exited with code {:?}", outcome.exit_code),
            Err(e) => format!("agent invocation error: {e}"),
        };

        if attempt > ctx.max_retries {
            ctx.log
                .emit(
                    AuditEvent::new(EventType::CircuitBreakerTrip, "task", ctx.id.as_str())
                        .with_severity(Severity::Error)
                        .with_metadata(serde_json::json!({ "attempts": attempt })),
                )
                .map_err(|e| e.to_string())?;
            return Err(format!("{failure} after {attempt} attempt(s)"));
        }

        let delay = backoff_delay(ctx.retry_base_delay, attempt);
        debug!(task = %ctx.id, attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
        tokio::time::sleep(delay).await;
    };

    let artifact = {
        let patches = Arc::clone(&ctx.patches);
        let (path, task) = (handle.path.clone(), ctx.id.clone());
        tokio::task::spawn_blocking(move || patches.capture(&path, &task, successful_attempt))
            .await
            .map_err(|e| format!("capture worker aborted: {e}"))?
            .map_err(|e| format!("patch capture failed: {e}"))?
    };

    ctx.patches
        .validate_scope(&artifact, &scope)
        .map_err(|e| e.to_string())?;

    {
        let isolation = Arc::clone(&ctx.isolation);
        let path = handle.path.clone();
        let message = format!("{}: attempt {}", ctx.id, successful_attempt);
        tokio::task::spawn_blocking(move || isolation.commit(&path, &message))
            .await
            .map_err(|e| format!("commit worker aborted: {e}"))?
            .map_err(|e| format!("commit failed: {e}"))?;
    }

    let merge = {
        let isolation = Arc::clone(&ctx.isolation);
        let (branch, target) = (branch.clone(), ctx.integration_branch.clone());
        tokio::task::spawn_blocking(move || isolation.merge_back(&branch, &target))
            .await
            .map_err(|e| format!("merge worker aborted: {e}"))?
            .map_err(|e| format!("merge failed: {e}"))?
    };

    match merge {
        MergeOutcome::Merged { .. } => {
            let isolation = Arc::clone(&ctx.isolation);
            let (agent, task) = (agent_id, ctx.id.clone());
            let cleanup =
                tokio::task::spawn_blocking(move || isolation.cleanup_worktree(&agent, &task))
                    .await;
            if let Ok(Err(e)) = cleanup {
                warn!(task = %ctx.id, error = %e, "worktree cleanup failed");
            }
            Ok(())
        }
        MergeOutcome::Conflict { .. } => Err(format!(
            "merge conflict on {branch}; branch and worktree preserved for inspection"
        )),
    }
}
