//! Test support for exercising the pipeline without live agent CLIs.
//!
//! `ScriptedInvoker` stands in for an external coding assistant: each task
//! gets a queue of scripted outcomes that write files into the worktree and
//! report an exit code, so integration tests drive the full
//! worktree/patch/merge pipeline hermetically.

use async_trait::async_trait;
use foreman_proto::{AgentInvoker, InvokeOutcome};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted invocation outcome.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStep {
    /// Files written into the workdir before returning.
    pub files: Vec<(PathBuf, String)>,
    /// Exit code to report.
    pub exit_code: i32,
    /// Sleep before returning; sleeping past the timeout simulates a hung
    /// agent.
    pub delay: Option<Duration>,
}

impl ScriptedStep {
    /// A step that exits zero without touching anything.
    pub fn success() -> Self {
        Self::default()
    }

    /// A step that exits with the given non-zero code.
    pub fn failure(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    /// A step that never finishes within any reasonable timeout.
    pub fn hang() -> Self {
        Self {
            delay: Some(Duration::from_secs(3600)),
            ..Self::default()
        }
    }

    /// Adds a file the step writes into the workdir.
    pub fn write(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.files.push((path.into(), contents.into()));
        self
    }
}

/// An `AgentInvoker` that replays scripted outcomes.
///
/// Steps are keyed by the workdir's final path component, which under the
/// worktree layout is the task ID. Tasks without a script succeed as
/// no-ops. Each queued step is consumed once; retries pull the next step.
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, Vec<ScriptedStep>>>,
}

impl ScriptedInvoker {
    /// Creates an invoker with no scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a step for a task.
    pub fn script(self, task_id: impl Into<String>, step: ScriptedStep) -> Self {
        self.scripts
            .lock()
            .expect("script table lock poisoned")
            .entry(task_id.into())
            .or_default()
            .push(step);
        self
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        workdir: &Path,
        _instructions: &str,
        timeout: Option<Duration>,
    ) -> std::io::Result<InvokeOutcome> {
        let key = workdir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let step = {
            let mut scripts = self.scripts.lock().expect("script table lock poisoned");
            match scripts.get_mut(&key) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => ScriptedStep::success(),
            }
        };

        if let Some(delay) = step.delay {
            if let Some(budget) = timeout {
                if delay >= budget {
                    tokio::time::sleep(budget).await;
                    return Ok(InvokeOutcome {
                        timed_out: true,
                        ..InvokeOutcome::default()
                    });
                }
            }
            tokio::time::sleep(delay).await;
        }

        let mut files_modified = Vec::new();
        for (path, contents) in &step.files {
            let dest = workdir.join(path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, contents)?;
            files_modified.push(path.display().to_string());
        }

        Ok(InvokeOutcome {
            exit_code: Some(step.exit_code),
            files_modified,
            ..InvokeOutcome::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn unscripted_task_succeeds_as_noop() {
        let invoker = ScriptedInvoker::new();
        let dir = tempdir().unwrap();
        let outcome = invoker.invoke(dir.path(), "", None).await.unwrap();
        assert!(outcome.success());
        assert!(outcome.files_modified.is_empty());
    }

    #[tokio::test]
    async fn steps_are_consumed_in_order() {
        let invoker = ScriptedInvoker::new()
            .script("t1", ScriptedStep::failure(1))
            .script("t1", ScriptedStep::success().write("out.txt", "done"));

        let dir = tempdir().unwrap();
        let workdir = dir.path().join("t1");
        std::fs::create_dir_all(&workdir).unwrap();

        let first = invoker.invoke(&workdir, "", None).await.unwrap();
        assert_eq!(first.exit_code, Some(1));

        let second = invoker.invoke(&workdir, "", None).await.unwrap();
        assert!(second.success());
        assert_eq!(
            std::fs::read_to_string(workdir.join("out.txt")).unwrap(),
            "done"
        );
    }

    #[tokio::test]
    async fn hang_times_out_within_budget() {
        let invoker = ScriptedInvoker::new().script("t1", ScriptedStep::hang());
        let dir = tempdir().unwrap();
        let workdir = dir.path().join("t1");
        std::fs::create_dir_all(&workdir).unwrap();

        let outcome = invoker
            .invoke(&workdir, "", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
    }
}
