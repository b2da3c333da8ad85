//! End-to-end pipeline tests over a temporary git repository.
//!
//! These drive the full path: plan -> scheduler -> worktree isolation ->
//! scripted agent invocation -> patch capture -> scope validation ->
//! merge-back -> audit log.

use foreman_core::testing::{ScriptedInvoker, ScriptedStep};
use foreman_core::{
    EventLog, EventQuery, ForemanConfig, IsolationManager, PatchStore, Plan, PlanMetadata,
    RunOutcome, Runner, Scheduler, TaskDescriptor,
};
use foreman_proto::{Error, EventType};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    tmp: TempDir,
    repo: PathBuf,
    log: Arc<EventLog>,
    config: ForemanConfig,
}

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

fn harness() -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let repo = tmp.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-b", "main"]);
    git(&repo, &["config", "user.name", "Foreman"]);
    git(&repo, &["config", "user.email", "foreman@example.com"]);
    std::fs::write(repo.join("README.md"), "seed\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "init"]);

    let mut config = ForemanConfig::default();
    config.isolation.worktree_dir = tmp.path().join("worktrees");
    config.scheduler.retry_base_delay_ms = 10;
    config.scheduler.task_timeout_seconds = 5;

    let log = Arc::new(EventLog::open(tmp.path().join("events.jsonl")).unwrap());

    Harness {
        tmp,
        repo,
        log,
        config,
    }
}

fn plan(tasks: Vec<TaskDescriptor>) -> Plan {
    Plan {
        tasks,
        metadata: PlanMetadata::default(),
    }
}

fn runner(h: &Harness, plan: &Plan, invoker: ScriptedInvoker) -> Runner {
    let mut scheduler = Scheduler::new(Arc::clone(&h.log));
    scheduler.load_plan(plan).expect("load plan");

    let isolation = Arc::new(
        IsolationManager::new(h.repo.clone(), &h.config.isolation, Arc::clone(&h.log)).unwrap(),
    );
    let patches =
        Arc::new(PatchStore::open(h.tmp.path().join("patches"), Arc::clone(&h.log)).unwrap());

    Runner::new(
        scheduler,
        isolation,
        patches,
        Arc::new(invoker),
        Arc::clone(&h.log),
        h.config.clone(),
    )
}

fn transitions(h: &Harness, task: &str) -> Vec<String> {
    h.log
        .query(
            &EventQuery::for_entity("task", task).with_event_type(EventType::TaskStateTransition),
        )
        .unwrap()
        .into_iter()
        .filter_map(|e| e.to_state)
        .collect()
}

#[tokio::test]
async fn diamond_plan_completes_and_merges_every_task() {
    let h = harness();
    let plan = plan(vec![
        TaskDescriptor::new("A").with_scope_glob("a.txt"),
        TaskDescriptor::new("B")
            .with_dependency("A")
            .with_scope_glob("b.txt"),
        TaskDescriptor::new("C")
            .with_dependency("A")
            .with_scope_glob("c.txt"),
        TaskDescriptor::new("D")
            .with_dependency("B")
            .with_dependency("C")
            .with_scope_glob("d.txt"),
    ]);
    let invoker = ScriptedInvoker::new()
        .script("A", ScriptedStep::success().write("a.txt", "a"))
        .script("B", ScriptedStep::success().write("b.txt", "b"))
        .script("C", ScriptedStep::success().write("c.txt", "c"))
        .script("D", ScriptedStep::success().write("d.txt", "d"));

    let mut runner = runner(&h, &plan, invoker);
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.completed.len(), 4);
    assert!(summary.failed.is_empty());

    // every task's result landed on the integration branch
    for file in ["a.txt", "b.txt", "c.txt", "d.txt"] {
        assert!(h.repo.join(file).exists(), "{file} missing after merge");
    }

    // D ran after B and C: its worktree was cut from a tip containing both
    assert_eq!(transitions(&h, "A"), vec!["ready", "running", "completed"]);
    assert_eq!(transitions(&h, "D"), vec!["ready", "running", "completed"]);

    // patches were captured for each task
    let captured = h
        .log
        .query(&EventQuery::all().with_event_type(EventType::PatchCaptured))
        .unwrap();
    assert_eq!(captured.len(), 4);
}

#[tokio::test]
async fn failed_task_blocks_dependents_but_not_independent_branches() {
    let h = harness();
    let plan = plan(vec![
        TaskDescriptor::new("A").with_scope_glob("a.txt"),
        TaskDescriptor::new("B")
            .with_dependency("A")
            .with_scope_glob("b.txt"),
        TaskDescriptor::new("C")
            .with_dependency("A")
            .with_scope_glob("c.txt"),
        TaskDescriptor::new("D")
            .with_dependency("B")
            .with_dependency("C")
            .with_scope_glob("d.txt"),
        TaskDescriptor::new("E").with_scope_glob("e.txt"),
    ]);
    // A fails every attempt; E succeeds
    let invoker = ScriptedInvoker::new()
        .script("A", ScriptedStep::failure(1))
        .script("A", ScriptedStep::failure(1))
        .script("A", ScriptedStep::failure(1))
        .script("E", ScriptedStep::success().write("e.txt", "e"));

    let mut runner = runner(&h, &plan, invoker);
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::CompletedWithFailures);
    assert_eq!(summary.failed, vec!["A".to_string()]);
    assert_eq!(summary.completed, vec!["E".to_string()]);
    assert_eq!(
        summary.blocked,
        vec!["B".to_string(), "C".to_string(), "D".to_string()]
    );

    let blocked = runner.scheduler().get_blocked_tasks("A");
    assert_eq!(
        blocked,
        ["B", "C", "D"].iter().map(|s| (*s).to_string()).collect()
    );

    // bounded retries were exhausted and reported, never silently dropped
    let trips = h
        .log
        .query(&EventQuery::for_entity("task", "A").with_event_type(EventType::CircuitBreakerTrip))
        .unwrap();
    assert_eq!(trips.len(), 1);

    // blocked tasks never transitioned beyond pending
    assert!(transitions(&h, "D").is_empty());
}

#[tokio::test]
async fn out_of_scope_patch_is_rejected_before_merge() {
    let h = harness();
    let plan = plan(vec![
        TaskDescriptor::new("rogue").with_scope_glob("src/*.rs")
    ]);
    let invoker = ScriptedInvoker::new().script(
        "rogue",
        ScriptedStep::success().write("secrets.txt", "oops"),
    );

    let mut runner = runner(&h, &plan, invoker);
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::CompletedWithFailures);
    assert_eq!(summary.failed, vec!["rogue".to_string()]);

    let task = runner.scheduler().task("rogue").unwrap();
    let reason = task.failure_reason.as_deref().unwrap();
    assert!(reason.contains("scope"), "reason was: {reason}");

    // the violation is queryable and names the offending path
    let violations = h
        .log
        .query(&EventQuery::all().with_event_type(EventType::ScopeViolation))
        .unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].metadata["violating_paths"][0], "secrets.txt");

    // nothing leaked onto the integration branch; worktree kept for forensics
    assert!(!h.repo.join("secrets.txt").exists());
    assert!(h.config.isolation.worktree_dir.join("rogue").exists());
}

#[tokio::test]
async fn hung_agent_fails_with_timeout_reason_and_keeps_worktree() {
    let mut h = harness();
    h.config.scheduler.task_timeout_seconds = 1;

    let plan = plan(vec![
        TaskDescriptor::new("stuck").with_scope_glob("out.txt")
    ]);
    let invoker = ScriptedInvoker::new().script("stuck", ScriptedStep::hang());

    let mut runner = runner(&h, &plan, invoker);
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.failed, vec!["stuck".to_string()]);
    let reason = runner
        .scheduler()
        .task("stuck")
        .unwrap()
        .failure_reason
        .clone()
        .unwrap();
    assert!(
        reason.starts_with("timeout after"),
        "timeout must be distinguishable from a non-zero exit, got: {reason}"
    );
    assert!(h.config.isolation.worktree_dir.join("stuck").exists());
}

#[tokio::test]
async fn cyclic_plan_aborts_before_any_task_runs() {
    let h = harness();
    let plan = plan(vec![
        TaskDescriptor::new("a").with_dependency("b"),
        TaskDescriptor::new("b").with_dependency("a"),
    ]);

    let mut runner = runner(&h, &plan, ScriptedInvoker::new());
    let err = runner.run().await.unwrap_err();

    match err {
        Error::CycleDetected { path } => {
            assert_eq!(path.first(), path.last());
            assert!(!path.is_empty());
        }
        other => panic!("expected cycle error, got {other:?}"),
    }

    // no task was ever dispatched
    assert!(transitions(&h, "a").is_empty());
    assert!(transitions(&h, "b").is_empty());
}

#[tokio::test]
async fn cancelled_run_dispatches_nothing_further() {
    let h = harness();
    let plan = plan(vec![
        TaskDescriptor::new("first").with_scope_glob("f.txt"),
        TaskDescriptor::new("second")
            .with_dependency("first")
            .with_scope_glob("s.txt"),
    ]);
    let invoker =
        ScriptedInvoker::new().script("first", ScriptedStep::success().write("f.txt", "f"));

    let mut runner = runner(&h, &plan, invoker);
    runner.cancel_handle().cancel();
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert!(summary.completed.is_empty());
    assert_eq!(
        summary.skipped,
        vec!["first".to_string(), "second".to_string()]
    );

    let cancelled = h
        .log
        .query(&EventQuery::all().with_event_type(EventType::RunCancelled))
        .unwrap();
    assert_eq!(cancelled.len(), 1);

    // no task was ever dispatched
    assert!(transitions(&h, "first").is_empty());
    assert!(transitions(&h, "second").is_empty());
}

#[tokio::test]
async fn parallel_batch_merges_all_independent_tasks() {
    let mut h = harness();
    h.config.scheduler.max_parallel = 3;

    let plan = plan(vec![
        TaskDescriptor::new("x").with_scope_glob("x.txt"),
        TaskDescriptor::new("y").with_scope_glob("y.txt"),
        TaskDescriptor::new("z").with_scope_glob("z.txt"),
    ]);
    let invoker = ScriptedInvoker::new()
        .script("x", ScriptedStep::success().write("x.txt", "x"))
        .script("y", ScriptedStep::success().write("y.txt", "y"))
        .script("z", ScriptedStep::success().write("z.txt", "z"));

    let mut runner = runner(&h, &plan, invoker);
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    for file in ["x.txt", "y.txt", "z.txt"] {
        assert!(h.repo.join(file).exists());
    }

    // merged task branches were deleted
    let out = Command::new("git")
        .current_dir(&h.repo)
        .args(["branch", "--list", "foreman/*"])
        .output()
        .unwrap();
    assert!(String::from_utf8_lossy(&out.stdout).trim().is_empty());
}

#[tokio::test]
async fn conflicting_same_level_merges_surface_not_resolve() {
    let mut h = harness();
    h.config.scheduler.max_parallel = 2;

    // both tasks rewrite the same seed file with different content
    let plan = plan(vec![
        TaskDescriptor::new("left").with_scope_glob("README.md"),
        TaskDescriptor::new("right").with_scope_glob("README.md"),
    ]);
    let invoker = ScriptedInvoker::new()
        .script("left", ScriptedStep::success().write("README.md", "left version\n"))
        .script("right", ScriptedStep::success().write("README.md", "right version\n"));

    let mut runner = runner(&h, &plan, invoker);
    let summary = runner.run().await.unwrap();

    // one merge wins, the other conflicts; which is which is unordered
    assert_eq!(summary.completed.len(), 1);
    assert_eq!(summary.failed.len(), 1);

    let loser = &summary.failed[0];
    let reason = runner
        .scheduler()
        .task(loser)
        .unwrap()
        .failure_reason
        .clone()
        .unwrap();
    assert!(reason.contains("merge conflict"), "got: {reason}");

    // the conflicted branch survives for inspection
    let out = Command::new("git")
        .current_dir(&h.repo)
        .args(["branch", "--list", &format!("foreman/{loser}")])
        .output()
        .unwrap();
    assert!(
        String::from_utf8_lossy(&out.stdout).contains(&format!("foreman/{loser}")),
        "conflicted branch must be preserved"
    );

    let conflicts = h
        .log
        .query(&EventQuery::all().with_event_type(EventType::MergeConflict))
        .unwrap();
    assert_eq!(conflicts.len(), 1);
}
