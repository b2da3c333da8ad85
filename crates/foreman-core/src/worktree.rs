//! Worktree isolation for concurrent task execution.
//!
//! Each running task gets an exclusive, branch-backed working copy. The
//! repository's ref namespace is shared by every worktree, so all branch
//! creation and merge operations serialize through one process-wide lock;
//! file I/O inside a worktree needs no lock because a worktree has at most
//! one occupant.

use crate::config::IsolationConfig;
use crate::event_log::EventLog;
use foreman_proto::{AuditEvent, Error, EventType, Result, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Lifecycle state of a worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeState {
    Created,
    InUse,
    Merged,
    Abandoned,
}

/// An isolated working copy bound to exactly one branch and at most one
/// concurrent occupant.
#[derive(Debug, Clone)]
pub struct WorktreeHandle {
    /// On-disk location of the working copy.
    pub path: PathBuf,
    /// Branch the worktree is bound to.
    pub branch: String,
    /// Worker that owns the worktree.
    pub agent_id: String,
    /// Task the worktree was created for.
    pub task_id: String,
    /// Lifecycle state.
    pub state: WorktreeState,
}

/// Outcome of a merge-back attempt. Conflicts are values, not errors: the
/// source branch and worktree survive for forensic inspection.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// The branch merged; the merge commit is recorded and the source
    /// branch deleted.
    Merged { commit: String },
    /// The merge conflicted and was aborted; nothing was deleted.
    Conflict { details: String },
}

/// Creates, merges, and removes branch-backed worktrees.
pub struct IsolationManager {
    repo_root: PathBuf,
    worktree_dir: PathBuf,
    integration_branch: String,
    /// Serializes every mutation of the shared ref namespace. Branch
    /// creation and worktree registration are two non-atomic git operations;
    /// unserialized callers can race and corrupt the ref store.
    git_lock: Mutex<()>,
    handles: Mutex<HashMap<String, WorktreeHandle>>,
    log: Arc<EventLog>,
}

impl IsolationManager {
    /// Creates a manager rooted at a git repository.
    pub fn new(repo_root: impl Into<PathBuf>, config: &IsolationConfig, log: Arc<EventLog>) -> Result<Self> {
        let repo_root = repo_root.into();

        let is_repo = Command::new("git")
            .current_dir(&repo_root)
            .args(["rev-parse", "--git-dir"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !is_repo {
            return Err(Error::Git {
                command: "rev-parse --git-dir".to_string(),
                stderr: format!("not a git repository: {}", repo_root.display()),
            });
        }

        let worktree_dir = if config.worktree_dir.is_absolute() {
            config.worktree_dir.clone()
        } else {
            repo_root.join(&config.worktree_dir)
        };

        Ok(Self {
            repo_root,
            worktree_dir,
            integration_branch: config.integration_branch.clone(),
            git_lock: Mutex::new(()),
            handles: Mutex::new(HashMap::new()),
            log,
        })
    }

    /// The repository root.
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// The integration branch merged results land on.
    pub fn integration_branch(&self) -> &str {
        &self.integration_branch
    }

    /// Creates an exclusive worktree for a task, creating the branch from
    /// the integration tip if it does not exist yet.
    pub fn create_worktree(
        &self,
        agent_id: &str,
        branch: &str,
        task_id: &str,
    ) -> Result<WorktreeHandle> {
        let _guard = self.lock_refs();

        let path = self.worktree_dir.join(task_id);
        if path.exists() {
            return Err(Error::WorktreeExists(path));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if !self.branch_exists(branch) {
            self.git(&["branch", branch, self.integration_branch.as_str()])?;
            debug!(branch = %branch, base = %self.integration_branch, "branch created");
        }

        let path_str = path.to_str().ok_or_else(|| Error::Git {
            command: "worktree add".to_string(),
            stderr: "worktree path is not valid UTF-8".to_string(),
        })?;
        self.git(&["worktree", "add", path_str, branch])?;

        let handle = WorktreeHandle {
            path: path.clone(),
            branch: branch.to_string(),
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            state: WorktreeState::Created,
        };
        self.handles
            .lock()
            .expect("handle table lock poisoned")
            .insert(task_id.to_string(), handle.clone());

        info!(task = %task_id, branch = %branch, path = %path.display(), "worktree created");
        self.log.emit(
            AuditEvent::new(EventType::WorktreeCreated, "worktree", task_id).with_metadata(
                serde_json::json!({
                    "agent_id": agent_id,
                    "branch": branch,
                    "path": path.display().to_string(),
                }),
            ),
        )?;

        Ok(handle)
    }

    /// Marks a worktree occupied by its worker.
    pub fn occupy(&self, task_id: &str) -> Result<()> {
        let mut handles = self.handles.lock().expect("handle table lock poisoned");
        let handle = handles
            .get_mut(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        handle.state = WorktreeState::InUse;
        Ok(())
    }

    /// Stages and commits everything in a worktree, returning the commit
    /// hash. Touches only the worktree's own index; no ref-namespace lock
    /// needed.
    pub fn commit(&self, worktree: &Path, message: &str) -> Result<String> {
        git_in(worktree, &["add", "-A"])?;
        git_in(worktree, &["commit", "--allow-empty", "-m", message])?;
        Ok(git_in(worktree, &["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Merges a task branch back into the target branch under the ref lock.
    ///
    /// On success the source branch is deleted. On conflict the merge is
    /// aborted and the source branch and worktree are left untouched.
    pub fn merge_back(&self, branch: &str, target: &str) -> Result<MergeOutcome> {
        let _guard = self.lock_refs();

        self.git(&["checkout", target])?;
        let message = format!("merge {branch} into {target}");
        let merge = Command::new("git")
            .current_dir(&self.repo_root)
            .args(["merge", "--no-ff", "-m", message.as_str(), branch])
            .output()?;

        if !merge.status.success() {
            let details = format!(
                "{}{}",
                String::from_utf8_lossy(&merge.stdout),
                String::from_utf8_lossy(&merge.stderr)
            );
            // leave a clean target; the source branch stays for inspection
            if let Err(e) = self.git(&["merge", "--abort"]) {
                warn!(error = %e, "merge --abort failed");
            }

            warn!(branch = %branch, target = %target, "merge conflict");
            self.log.emit(
                AuditEvent::new(EventType::MergeConflict, "worktree", branch)
                    .with_severity(Severity::Error)
                    .with_metadata(serde_json::json!({
                        "target": target,
                        "details": details,
                    })),
            )?;
            return Ok(MergeOutcome::Conflict { details });
        }

        let commit = self.git(&["rev-parse", "HEAD"])?.trim().to_string();

        // git refuses to delete a branch checked out in a live worktree;
        // the merged worktree is done with it, so detach before deleting
        {
            let mut handles = self.handles.lock().expect("handle table lock poisoned");
            if let Some(handle) = handles.values_mut().find(|h| h.branch == branch) {
                if handle.path.exists() {
                    git_in(&handle.path, &["checkout", "--detach"])?;
                }
                handle.state = WorktreeState::Merged;
            }
        }
        self.git(&["branch", "-d", branch])?;

        info!(branch = %branch, target = %target, commit = %commit, "merge completed");
        self.log.emit(
            AuditEvent::new(EventType::MergeCompleted, "worktree", branch).with_metadata(
                serde_json::json!({
                    "target": target,
                    "commit": commit,
                }),
            ),
        )?;

        Ok(MergeOutcome::Merged { commit })
    }

    /// Removes a task's worktree from disk. Idempotent: removing an
    /// already-removed worktree warns and succeeds.
    pub fn cleanup_worktree(&self, agent_id: &str, task_id: &str) -> Result<()> {
        let path = self.worktree_dir.join(task_id);
        if !path.exists() {
            warn!(task = %task_id, agent = %agent_id, "worktree already removed");
            return Ok(());
        }

        {
            let _guard = self.lock_refs();
            let path_str = path.to_string_lossy();
            self.git(&["worktree", "remove", "--force", path_str.as_ref()])?;
        }

        if let Some(handle) = self
            .handles
            .lock()
            .expect("handle table lock poisoned")
            .get_mut(task_id)
        {
            if handle.state != WorktreeState::Merged {
                handle.state = WorktreeState::Abandoned;
            }
        }

        self.log.emit(
            AuditEvent::new(EventType::WorktreeRemoved, "worktree", task_id)
                .with_metadata(serde_json::json!({ "agent_id": agent_id })),
        )?;
        Ok(())
    }

    /// Snapshot of every handle this manager has issued.
    pub fn list_worktrees(&self) -> Vec<WorktreeHandle> {
        let mut handles: Vec<WorktreeHandle> = self
            .handles
            .lock()
            .expect("handle table lock poisoned")
            .values()
            .cloned()
            .collect();
        handles.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        handles
    }

    /// Current state of one task's worktree.
    pub fn status(&self, task_id: &str) -> Option<WorktreeHandle> {
        self.handles
            .lock()
            .expect("handle table lock poisoned")
            .get(task_id)
            .cloned()
    }

    fn lock_refs(&self) -> std::sync::MutexGuard<'_, ()> {
        self.git_lock.lock().expect("git lock poisoned")
    }

    fn branch_exists(&self, branch: &str) -> bool {
        let reference = format!("refs/heads/{branch}");
        Command::new("git")
            .current_dir(&self.repo_root)
            .args(["rev-parse", "--verify", "--quiet", reference.as_str()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        git_in(&self.repo_root, args)
    }
}

fn git_in(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").current_dir(dir).args(args).output()?;
    if !output.status.success() {
        return Err(Error::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
