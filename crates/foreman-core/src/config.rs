//! Configuration types for Foreman.
//!
//! The config file is YAML with one nested section per subsystem. Every
//! field has a serde default so a partial (or absent) file is valid.

use foreman_proto::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// Scheduler and dispatch settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Worktree isolation settings.
    #[serde(default)]
    pub isolation: IsolationConfig,

    /// Patch store settings.
    #[serde(default)]
    pub patches: PatchConfig,

    /// Audit log settings.
    #[serde(default)]
    pub events: EventsConfig,

    /// Agent adapter settings.
    #[serde(default)]
    pub agent: AgentConfig,
}

impl ForemanConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates settings; hard-errors on values the core cannot run with,
    /// warns on values that are legal but probably unintended.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_parallel == 0 {
            return Err(Error::Config(
                "scheduler.max_parallel must be at least 1".to_string(),
            ));
        }
        if self.isolation.integration_branch.is_empty() {
            return Err(Error::Config(
                "isolation.integration_branch must not be empty".to_string(),
            ));
        }
        if self.scheduler.task_timeout_seconds == 0 {
            warn!("scheduler.task_timeout_seconds is 0; agent invocations will run unbounded");
        }
        if self.scheduler.max_parallel > 64 {
            warn!(
                max_parallel = self.scheduler.max_parallel,
                "unusually large worker pool"
            );
        }
        Ok(())
    }
}

/// Scheduler and dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum tasks dispatched concurrently within a level.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Bounded retries per task after a non-zero agent exit.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Per-task agent invocation budget. 0 disables the timeout.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            task_timeout_seconds: default_task_timeout(),
        }
    }
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_task_timeout() -> u64 {
    300 // 5 minutes
}

/// Worktree isolation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Directory worktrees are created under (relative to the repo root).
    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: PathBuf,

    /// Branch merged results land on.
    #[serde(default = "default_integration_branch")]
    pub integration_branch: String,

    /// Prefix for per-task branches.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            worktree_dir: default_worktree_dir(),
            integration_branch: default_integration_branch(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

fn default_worktree_dir() -> PathBuf {
    PathBuf::from(".foreman/worktrees")
}

fn default_integration_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "foreman".to_string()
}

/// Patch store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchConfig {
    /// Directory patch artifacts are persisted under.
    #[serde(default = "default_patch_dir")]
    pub dir: PathBuf,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            dir: default_patch_dir(),
        }
    }
}

fn default_patch_dir() -> PathBuf {
    PathBuf::from(".foreman/patches")
}

/// Audit log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Path of the JSONL audit log.
    #[serde(default = "default_events_path")]
    pub path: PathBuf,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            path: default_events_path(),
        }
    }
}

fn default_events_path() -> PathBuf {
    PathBuf::from(".foreman/events.jsonl")
}

/// Agent adapter settings.
///
/// `backend` names a known adapter ("claude", "codex", "gemini", "custom",
/// or "auto" for PATH detection). `command`/`args` are only consulted for
/// the custom backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Backend name.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Command for the custom backend.
    #[serde(default)]
    pub command: Option<String>,

    /// Extra arguments passed before the instructions.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            command: None,
            args: Vec::new(),
        }
    }
}

fn default_backend() -> String {
    "auto".to_string()
}
