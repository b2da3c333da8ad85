//! Error taxonomy for the Foreman execution core.
//!
//! Callers branch on the error kind, never on message text. Fatal kinds
//! abort the whole plan; everything else is local to one task or one record.

use std::path::PathBuf;

/// Errors produced by the Foreman execution core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task with the same ID was already inserted.
    #[error("task '{0}' already exists")]
    DuplicateTask(String),

    /// Referenced task does not exist.
    #[error("task '{0}' not found")]
    TaskNotFound(String),

    /// The dependency graph contains a cycle. The path starts and ends at
    /// the same task ID.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// No runnable tasks remain while unfinished, unblocked tasks exist.
    /// Should be unreachable after a clean cycle check.
    #[error("unresolvable graph: no runnable tasks while {remaining} remain unfinished")]
    UnresolvableGraph { remaining: usize },

    /// A state mutator was called on a task in the wrong state.
    #[error("invalid transition for task '{task}': {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    /// A captured patch touches paths outside the task's declared scope.
    #[error("patch touches {} path(s) outside declared scope: {}", paths.len(), paths.join(", "))]
    ScopeViolation { paths: Vec<String> },

    /// Merging a task branch back into the integration branch conflicted.
    /// The source branch and worktree are left intact.
    #[error("merge of '{branch}' into '{target}' conflicted")]
    MergeConflict {
        branch: String,
        target: String,
        details: String,
    },

    /// Worktree directory already exists for this task.
    #[error("worktree already exists at {}", .0.display())]
    WorktreeExists(PathBuf),

    /// Agent invocation exceeded its time budget. Distinct from a non-zero
    /// exit code.
    #[error("agent invocation exceeded {limit_secs}s budget")]
    Timeout { limit_secs: u64 },

    /// A stored patch no longer matches its recorded digest.
    #[error("patch '{patch_id}' digest mismatch: stored {stored}, computed {computed}")]
    PatchCorrupted {
        patch_id: String,
        stored: String,
        computed: String,
    },

    /// Referenced patch does not exist in the store.
    #[error("patch '{0}' not found")]
    PatchNotFound(String),

    /// Referenced backup does not exist.
    #[error("backup '{0}' not found")]
    BackupNotFound(String),

    /// The submitted plan failed validation.
    #[error("invalid plan: {0}")]
    PlanInvalid(String),

    /// An audit event is missing a required field.
    #[error("audit event missing required field: {0}")]
    MissingEventField(&'static str),

    /// A git subprocess failed.
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// True for whole-plan failures that abort scheduling before any task
    /// runs. Everything else is task-local or record-local.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. } | Self::UnresolvableGraph { .. } | Self::PlanInvalid(_)
        )
    }
}

/// Result type used across Foreman crates.
pub type Result<T> = std::result::Result<T, Error>;
