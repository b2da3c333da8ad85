//! Patch lifecycle management.
//!
//! Turns "a worktree has uncommitted changes" into a durable, hashed,
//! reversible artifact. The raw diff and its metadata are persisted side by
//! side, keyed by a patch ID unique per (task, attempt), so concurrent
//! captures never collide. Artifacts are immutable once stored; the digest
//! is recomputed on every load to detect silent corruption.

use crate::event_log::EventLog;
use crate::scope::FileScope;
use chrono::{DateTime, Utc};
use foreman_proto::{AuditEvent, Error, EventType, Result, Severity};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, warn};

/// Metadata for one captured patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchArtifact {
    /// Unique ID, derived from task ID and attempt number.
    pub patch_id: String,
    /// Task that produced the patch.
    pub task_id: String,
    /// Attempt number (1-indexed).
    pub attempt: u32,
    /// SHA-256 hex digest of the diff text.
    pub diff_hash: String,
    /// Paths the patch touches.
    pub files_modified: Vec<String>,
    /// Number of `@@` hunk markers.
    pub hunks: usize,
    /// Added lines.
    pub additions: usize,
    /// Deleted lines.
    pub deletions: usize,
    /// additions + deletions; used for size-based triage, not correctness.
    pub line_count: usize,
    /// Where the raw diff is stored.
    pub diff_path: PathBuf,
    /// Capture timestamp.
    pub created_at: DateTime<Utc>,
}

/// Result of applying or reversing a patch. A failed apply reports its
/// conflicts but never partially writes files; `git apply` is all-or-nothing.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// Whether the patch applied cleanly.
    pub success: bool,
    /// Paths modified on success.
    pub files_modified: Vec<String>,
    /// Conflict/error lines reported by the tool on failure.
    pub conflicts: Vec<String>,
}

/// Append-only, content-addressed store of patch artifacts.
pub struct PatchStore {
    dir: PathBuf,
    log: Arc<EventLog>,
}

impl PatchStore {
    /// Opens (or creates) the store directory.
    pub fn open(dir: impl AsRef<Path>, log: Arc<EventLog>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, log })
    }

    /// Returns the store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Captures the working changes of a worktree as a patch artifact.
    ///
    /// Stages everything (so untracked files are included), takes the staged
    /// diff, hashes and parses it, and persists the raw diff plus metadata.
    pub fn capture(&self, worktree: &Path, task_id: &str, attempt: u32) -> Result<PatchArtifact> {
        run_git(worktree, &["add", "-A"])?;
        let diff = run_git(worktree, &["diff", "--cached", "--binary"])?;

        let patch_id = format!("{task_id}-{attempt}");
        let diff_hash = digest(&diff);
        let stats = parse_diff(&diff);

        let diff_path = self.dir.join(format!("{patch_id}.patch"));
        std::fs::write(&diff_path, &diff)?;

        let artifact = PatchArtifact {
            patch_id: patch_id.clone(),
            task_id: task_id.to_string(),
            attempt,
            diff_hash,
            files_modified: stats.files,
            hunks: stats.hunks,
            additions: stats.additions,
            deletions: stats.deletions,
            line_count: stats.additions + stats.deletions,
            diff_path,
            created_at: Utc::now(),
        };
        let meta_path = self.dir.join(format!("{patch_id}.json"));
        std::fs::write(&meta_path, serde_json::to_string_pretty(&artifact)?)?;

        debug!(
            patch = %patch_id,
            files = artifact.files_modified.len(),
            lines = artifact.line_count,
            "patch captured"
        );
        self.log.emit(
            AuditEvent::new(EventType::PatchCaptured, "patch", patch_id.as_str()).with_metadata(
                serde_json::json!({
                    "task_id": task_id,
                    "attempt": attempt,
                    "diff_hash": artifact.diff_hash,
                    "files_modified": artifact.files_modified,
                    "hunks": artifact.hunks,
                    "additions": artifact.additions,
                    "deletions": artifact.deletions,
                    "line_count": artifact.line_count,
                }),
            ),
        )?;

        Ok(artifact)
    }

    /// Loads an artifact and its diff text, verifying the stored digest.
    /// A mismatch is reported for this artifact only, never store-fatal.
    pub fn load(&self, patch_id: &str) -> Result<(PatchArtifact, String)> {
        let meta_path = self.dir.join(format!("{patch_id}.json"));
        if !meta_path.exists() {
            return Err(Error::PatchNotFound(patch_id.to_string()));
        }
        let artifact: PatchArtifact =
            serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
        let diff = std::fs::read_to_string(&artifact.diff_path)?;

        let computed = digest(&diff);
        if computed != artifact.diff_hash {
            warn!(patch = %patch_id, "patch digest mismatch");
            return Err(Error::PatchCorrupted {
                patch_id: patch_id.to_string(),
                stored: artifact.diff_hash,
                computed,
            });
        }

        Ok((artifact, diff))
    }

    /// Validates every touched path against the task's allowed globs. Any
    /// out-of-scope path rejects the patch whole; it is never truncated to
    /// the allowed files.
    pub fn validate_scope(&self, artifact: &PatchArtifact, scope: &FileScope) -> Result<()> {
        let check = scope.check(&artifact.files_modified);
        if !check.is_ok() {
            self.log.emit(
                AuditEvent::new(EventType::ScopeViolation, "patch", artifact.patch_id.as_str())
                    .with_severity(Severity::Error)
                    .with_metadata(serde_json::json!({
                        "task_id": artifact.task_id,
                        "violating_paths": check.violations,
                    })),
            )?;
            return Err(Error::ScopeViolation {
                paths: check.violations,
            });
        }

        self.log.emit(
            AuditEvent::new(EventType::PatchValidated, "patch", artifact.patch_id.as_str())
                .with_metadata(serde_json::json!({ "task_id": artifact.task_id })),
        )?;
        Ok(())
    }

    /// Applies the patch to a target tree. In dry-run mode only checks
    /// applicability without mutating files.
    pub fn apply(
        &self,
        artifact: &PatchArtifact,
        target: &Path,
        dry_run: bool,
    ) -> Result<ApplyResult> {
        // Re-verify the stored diff before letting it touch a tree
        let (_, _diff) = self.load(&artifact.patch_id)?;
        let diff_path = artifact.diff_path.canonicalize()?;

        let mut args: Vec<&str> = vec!["apply"];
        if dry_run {
            args.push("--check");
        }
        let diff_arg = diff_path.to_string_lossy();
        args.push(diff_arg.as_ref());

        let result = self.run_apply(target, &args, artifact)?;
        if result.success && !dry_run {
            self.log.emit(
                AuditEvent::new(EventType::PatchApplied, "patch", artifact.patch_id.as_str())
                    .with_metadata(serde_json::json!({
                        "target": target.display().to_string(),
                        "files_modified": artifact.files_modified,
                    })),
            )?;
        }
        Ok(result)
    }

    /// Applies the inverse of a previously applied patch.
    pub fn reverse(&self, artifact: &PatchArtifact, target: &Path) -> Result<ApplyResult> {
        let (_, _diff) = self.load(&artifact.patch_id)?;
        let diff_path = artifact.diff_path.canonicalize()?;
        let diff_arg = diff_path.to_string_lossy();

        let result =
            self.run_apply(target, &["apply", "--reverse", diff_arg.as_ref()], artifact)?;
        if result.success {
            self.log.emit(
                AuditEvent::new(EventType::PatchReversed, "patch", artifact.patch_id.as_str())
                    .with_metadata(serde_json::json!({
                        "target": target.display().to_string(),
                    })),
            )?;
        }
        Ok(result)
    }

    fn run_apply(
        &self,
        target: &Path,
        args: &[&str],
        artifact: &PatchArtifact,
    ) -> Result<ApplyResult> {
        let output = Command::new("git")
            .current_dir(target)
            .args(args)
            .output()?;

        if output.status.success() {
            Ok(ApplyResult {
                success: true,
                files_modified: artifact.files_modified.clone(),
                conflicts: Vec::new(),
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(ApplyResult {
                success: false,
                files_modified: Vec::new(),
                conflicts: stderr.lines().map(str::to_string).collect(),
            })
        }
    }
}

fn digest(diff: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(diff.as_bytes());
    hex::encode(hasher.finalize())
}

struct DiffStats {
    files: Vec<String>,
    hunks: usize,
    additions: usize,
    deletions: usize,
}

/// Parses unified diff text: touched files from the file headers, hunk
/// count from `@@` markers, additions/deletions per changed line.
fn parse_diff(diff: &str) -> DiffStats {
    let mut files = Vec::new();
    let mut hunks = 0;
    let mut additions = 0;
    let mut deletions = 0;
    let mut pending_old: Option<String> = None;

    let mut push_file = |files: &mut Vec<String>, path: String| {
        if !files.contains(&path) {
            files.push(path);
        }
    };

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("--- a/") {
            pending_old = Some(rest.to_string());
        } else if line == "--- /dev/null" {
            pending_old = None;
        } else if let Some(rest) = line.strip_prefix("+++ b/") {
            push_file(&mut files, rest.to_string());
            pending_old = None;
        } else if line == "+++ /dev/null" {
            // file deletion: the old side names the path
            if let Some(old) = pending_old.take() {
                push_file(&mut files, old);
            }
        } else if line.starts_with("@@") {
            hunks += 1;
        } else if line.starts_with('+') {
            additions += 1;
        } else if line.starts_with('-') {
            deletions += 1;
        }
    }

    DiffStats {
        files,
        hunks,
        additions,
        deletions,
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").current_dir(dir).args(args).output()?;
    if !output.status.success() {
        return Err(Error::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE_DIFF: &str = "\
diff --git a/src/a.py b/src/a.py
index 1111111..2222222 100644
--- a/src/a.py
+++ b/src/a.py
@@ -1,3 +1,4 @@
 import os
-print(\"old\")
+print(\"new\")
+print(\"extra\")
@@ -10,2 +11,2 @@
-x = 1
+x = 2
diff --git a/docs/gone.md b/docs/gone.md
deleted file mode 100644
index 3333333..0000000
--- a/docs/gone.md
+++ /dev/null
@@ -1,1 +0,0 @@
-obsolete
";

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let out = Command::new("git").current_dir(dir).args(args).output().unwrap();
            assert!(out.status.success(), "git {args:?} failed");
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.name", "Foreman"]);
        run(&["config", "user.email", "foreman@example.com"]);
        std::fs::write(dir.join("base.txt"), "base\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
    }

    fn store(dir: &Path) -> PatchStore {
        let log = Arc::new(EventLog::open(dir.join("events.jsonl")).unwrap());
        PatchStore::open(dir.join("patches"), log).unwrap()
    }

    #[test]
    fn diff_stats_count_hunks_and_lines() {
        let stats = parse_diff(SAMPLE_DIFF);
        assert_eq!(
            stats.files,
            vec!["src/a.py".to_string(), "docs/gone.md".to_string()]
        );
        assert_eq!(stats.hunks, 3);
        assert_eq!(stats.additions, 3);
        assert_eq!(stats.deletions, 3);
    }

    #[test]
    fn empty_diff_has_empty_stats() {
        let stats = parse_diff("");
        assert!(stats.files.is_empty());
        assert_eq!(stats.hunks, 0);
        assert_eq!(stats.additions + stats.deletions, 0);
    }

    #[test]
    fn capture_persists_diff_and_metadata() {
        let tmp = tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);

        std::fs::write(repo.join("base.txt"), "changed\n").unwrap();
        std::fs::write(repo.join("new.txt"), "fresh\n").unwrap();

        let store = store(tmp.path());
        let artifact = store.capture(&repo, "task-1", 1).unwrap();

        assert_eq!(artifact.patch_id, "task-1-1");
        assert!(artifact.files_modified.contains(&"base.txt".to_string()));
        assert!(artifact.files_modified.contains(&"new.txt".to_string()));
        assert_eq!(artifact.line_count, artifact.additions + artifact.deletions);
        assert!(artifact.diff_path.exists());

        // load verifies the digest
        let (loaded, diff) = store.load("task-1-1").unwrap();
        assert_eq!(loaded.diff_hash, artifact.diff_hash);
        assert!(diff.contains("new.txt"));
    }

    #[test]
    fn corrupted_diff_is_detected_on_load() {
        let tmp = tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);
        std::fs::write(repo.join("base.txt"), "changed\n").unwrap();

        let store = store(tmp.path());
        let artifact = store.capture(&repo, "t", 1).unwrap();

        std::fs::write(&artifact.diff_path, "tampered").unwrap();
        assert!(matches!(
            store.load("t-1"),
            Err(Error::PatchCorrupted { .. })
        ));
    }

    #[test]
    fn missing_patch_reported() {
        let tmp = tempdir().unwrap();
        let store = store(tmp.path());
        assert!(matches!(
            store.load("ghost-1"),
            Err(Error::PatchNotFound(_))
        ));
    }

    #[test]
    fn apply_then_reverse_restores_tree() {
        let tmp = tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);

        std::fs::write(repo.join("base.txt"), "changed\n").unwrap();
        let store = store(tmp.path());
        let artifact = store.capture(&repo, "t", 1).unwrap();

        // fresh checkout to apply against
        let target = tmp.path().join("target");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("base.txt"), "base\n").unwrap();

        let dry = store.apply(&artifact, &target, true).unwrap();
        assert!(dry.success);
        assert_eq!(
            std::fs::read_to_string(target.join("base.txt")).unwrap(),
            "base\n",
            "dry run must not mutate"
        );

        let applied = store.apply(&artifact, &target, false).unwrap();
        assert!(applied.success);
        assert_eq!(
            std::fs::read_to_string(target.join("base.txt")).unwrap(),
            "changed\n"
        );

        let reversed = store.reverse(&artifact, &target).unwrap();
        assert!(reversed.success);
        assert_eq!(
            std::fs::read_to_string(target.join("base.txt")).unwrap(),
            "base\n"
        );
    }

    #[test]
    fn conflicting_apply_reports_and_leaves_tree_alone() {
        let tmp = tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);

        std::fs::write(repo.join("base.txt"), "changed\n").unwrap();
        let store = store(tmp.path());
        let artifact = store.capture(&repo, "t", 1).unwrap();

        let target = tmp.path().join("target");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("base.txt"), "diverged\n").unwrap();

        let result = store.apply(&artifact, &target, false).unwrap();
        assert!(!result.success);
        assert!(!result.conflicts.is_empty());
        assert_eq!(
            std::fs::read_to_string(target.join("base.txt")).unwrap(),
            "diverged\n"
        );
    }

    #[test]
    fn scope_validation_rejects_out_of_scope_patch() {
        let tmp = tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);

        std::fs::create_dir_all(repo.join("src")).unwrap();
        std::fs::write(repo.join("src/a.py"), "print('x')\n").unwrap();

        let store = store(tmp.path());
        let artifact = store.capture(&repo, "t", 1).unwrap();

        let allowed = FileScope::parse(&["src/*.py".to_string()]).unwrap();
        assert!(store.validate_scope(&artifact, &allowed).is_ok());

        let rejected = FileScope::parse(&["docs/*".to_string()]).unwrap();
        match store.validate_scope(&artifact, &rejected) {
            Err(Error::ScopeViolation { paths }) => {
                assert_eq!(paths, vec!["src/a.py".to_string()]);
            }
            other => panic!("expected scope violation, got {other:?}"),
        }
    }
}
