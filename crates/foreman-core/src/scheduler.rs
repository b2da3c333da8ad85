//! Scheduler - task state ownership and execution ordering.
//!
//! The scheduler owns all task state. State changes go through the
//! `mark_*` transition API, and every transition is recorded in the audit
//! log before the in-memory state is updated, so the log is always at
//! least as current as the state it describes.

use crate::event_log::EventLog;
use crate::graph::DependencyGraph;
use crate::plan::{Plan, TaskDescriptor};
use foreman_proto::{AuditEvent, Error, EventType, Result, Severity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle state of a task. States are mutually exclusive and only move
/// forward: `pending -> ready -> running -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable string form used in audit records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A scheduled task: its submitted descriptor plus runtime state.
#[derive(Debug, Clone)]
pub struct Task {
    /// The descriptor as submitted.
    pub descriptor: TaskDescriptor,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Number of invocation attempts so far.
    pub attempts: u32,
    /// Human-readable reason, set when the task fails.
    pub failure_reason: Option<String>,
}

impl Task {
    fn new(descriptor: TaskDescriptor) -> Self {
        Self {
            descriptor,
            state: TaskState::Pending,
            attempts: 0,
            failure_reason: None,
        }
    }
}

/// Owns task and dependency state; decides what may run, in what order,
/// with what parallelism.
pub struct Scheduler {
    tasks: HashMap<String, Task>,
    graph: DependencyGraph,
    log: Arc<EventLog>,
}

impl Scheduler {
    /// Creates an empty scheduler writing transitions to the given log.
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            tasks: HashMap::new(),
            graph: DependencyGraph::new(),
            log,
        }
    }

    /// Loads every task of a validated plan.
    pub fn load_plan(&mut self, plan: &Plan) -> Result<()> {
        for descriptor in &plan.tasks {
            self.add_task(descriptor.clone())?;
        }
        Ok(())
    }

    /// Inserts a task and its declared dependencies into the graph.
    pub fn add_task(&mut self, descriptor: TaskDescriptor) -> Result<()> {
        descriptor.validate()?;
        if self.tasks.contains_key(&descriptor.id) {
            return Err(Error::DuplicateTask(descriptor.id));
        }

        self.graph.insert(&descriptor.id, &descriptor.depends_on);
        debug!(task = %descriptor.id, deps = descriptor.depends_on.len(), "task added");
        self.tasks
            .insert(descriptor.id.clone(), Task::new(descriptor));
        Ok(())
    }

    /// Looks up a task by ID.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Number of tasks loaded.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks are loaded.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Finds the first dependency cycle, if any. A cycle is a fatal,
    /// whole-plan error; the plan is never partially scheduled.
    pub fn detect_cycles(&self) -> Option<Vec<String>> {
        self.graph.detect_cycle()
    }

    /// Computes strictly ordered levels: each level holds tasks whose
    /// dependencies are all satisfied by earlier levels or already-completed
    /// tasks. Terminal tasks and tasks transitively blocked by a failure are
    /// excluded. If unblocked tasks remain but no progress is possible this
    /// is an `UnresolvableGraph` error, kept in addition to the upfront
    /// cycle check.
    pub fn compute_levels(&self) -> Result<Vec<Vec<String>>> {
        let blocked = self.blocked_by_failure();

        let mut satisfied: HashSet<&str> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Completed)
            .map(|t| t.descriptor.id.as_str())
            .collect();

        let mut remaining: BTreeSet<&str> = self
            .tasks
            .values()
            .filter(|t| !t.state.is_terminal() && !blocked.contains(&t.descriptor.id))
            .map(|t| t.descriptor.id.as_str())
            .collect();

        let mut levels = Vec::new();
        while !remaining.is_empty() {
            let level: Vec<String> = remaining
                .iter()
                .filter(|id| {
                    self.graph
                        .dependencies_of(id)
                        .iter()
                        .all(|dep| satisfied.contains(dep.as_str()))
                })
                .map(|id| (*id).to_string())
                .collect();

            if level.is_empty() {
                return Err(Error::UnresolvableGraph {
                    remaining: remaining.len(),
                });
            }

            for id in &level {
                remaining.remove(id.as_str());
            }
            for id in &level {
                let task = self.tasks.get(id).expect("leveled task exists");
                satisfied.insert(task.descriptor.id.as_str());
            }
            levels.push(level);
        }

        Ok(levels)
    }

    /// Subdivides each level into batches of at most `max_parallel` tasks,
    /// preserving level order: a later level's batch never precedes an
    /// earlier level's.
    pub fn compute_batches(&self, max_parallel: usize) -> Result<Vec<Vec<String>>> {
        let max_parallel = if max_parallel == 0 {
            warn!("max_parallel of 0 treated as 1");
            1
        } else {
            max_parallel
        };

        let levels = self.compute_levels()?;
        let mut batches = Vec::new();
        for level in levels {
            for chunk in level.chunks(max_parallel) {
                batches.push(chunk.to_vec());
            }
        }
        Ok(batches)
    }

    /// Promotes every pending task whose dependencies are all completed to
    /// ready, and returns the ready set. Idempotent; no side effects beyond
    /// the promotion (and its audit records).
    pub fn get_ready_tasks(&mut self) -> Result<Vec<String>> {
        let promotable: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .filter(|t| {
                self.graph
                    .dependencies_of(&t.descriptor.id)
                    .iter()
                    .all(|dep| {
                        self.tasks
                            .get(dep)
                            .is_some_and(|d| d.state == TaskState::Completed)
                    })
            })
            .map(|t| t.descriptor.id.clone())
            .collect();

        for id in &promotable {
            self.transition(id, TaskState::Ready, None)?;
        }

        let mut ready: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Ready)
            .map(|t| t.descriptor.id.clone())
            .collect();
        ready.sort();
        Ok(ready)
    }

    /// Marks a task running. Legal only from the ready state.
    pub fn mark_running(&mut self, id: &str) -> Result<()> {
        self.expect_state(id, &[TaskState::Ready], TaskState::Running)?;
        self.transition(id, TaskState::Running, None)?;
        if let Some(task) = self.tasks.get_mut(id) {
            task.attempts += 1;
        }
        Ok(())
    }

    /// Marks a task completed. Legal only from the running state.
    pub fn mark_completed(&mut self, id: &str) -> Result<()> {
        self.expect_state(id, &[TaskState::Running], TaskState::Completed)?;
        self.transition(id, TaskState::Completed, None)
    }

    /// Marks a task failed with a human-readable reason. Dependents are not
    /// rewritten; they simply never become ready. Legal from ready or
    /// running so dispatch-time failures are representable.
    pub fn mark_failed(&mut self, id: &str, reason: &str) -> Result<()> {
        self.expect_state(id, &[TaskState::Ready, TaskState::Running], TaskState::Failed)?;
        self.transition(id, TaskState::Failed, Some(reason))?;
        if let Some(task) = self.tasks.get_mut(id) {
            task.failure_reason = Some(reason.to_string());
        }
        Ok(())
    }

    /// The transitive dependents of a task: everything that can never run
    /// once the task has failed.
    pub fn get_blocked_tasks(&self, id: &str) -> BTreeSet<String> {
        self.graph.transitive_dependents(id)
    }

    /// Tasks that can never run because a task they transitively depend on
    /// has failed.
    pub fn blocked_by_failure(&self) -> BTreeSet<String> {
        let mut blocked = BTreeSet::new();
        for task in self.tasks.values() {
            if task.state == TaskState::Failed {
                blocked.extend(self.graph.transitive_dependents(&task.descriptor.id));
            }
        }
        blocked
    }

    /// Whether the run can make no further progress: every task is terminal
    /// or permanently blocked by a failure.
    pub fn is_complete(&self) -> bool {
        let blocked = self.blocked_by_failure();
        self.tasks
            .values()
            .all(|t| t.state.is_terminal() || blocked.contains(&t.descriptor.id))
    }

    /// Whether any task has failed.
    pub fn has_failures(&self) -> bool {
        self.tasks
            .values()
            .any(|t| t.state == TaskState::Failed)
    }

    /// IDs currently in the given state, sorted.
    pub fn tasks_in_state(&self, state: TaskState) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.state == state)
            .map(|t| t.descriptor.id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn expect_state(&self, id: &str, allowed: &[TaskState], to: TaskState) -> Result<()> {
        let task = self
            .tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        if !allowed.contains(&task.state) {
            return Err(Error::InvalidTransition {
                task: id.to_string(),
                from: task.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Emits the transition record, then updates in-memory state. The log
    /// write happens first so dependents always observe a recorded fact.
    fn transition(&mut self, id: &str, to: TaskState, reason: Option<&str>) -> Result<()> {
        let from = self
            .tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?
            .state;

        let severity = if to == TaskState::Failed {
            Severity::Error
        } else {
            Severity::Info
        };
        let mut event = AuditEvent::new(EventType::TaskStateTransition, "task", id)
            .with_states(from.as_str(), to.as_str())
            .with_severity(severity);
        if let Some(reason) = reason {
            event = event.with_metadata(serde_json::json!({ "reason": reason }));
        }
        self.log.emit(event)?;

        if let Some(task) = self.tasks.get_mut(id) {
            task.state = to;
        }
        debug!(task = %id, from = from.as_str(), to = to.as_str(), "task transition");
        Ok(())
    }
}
