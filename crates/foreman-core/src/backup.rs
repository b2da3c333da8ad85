//! Snapshot backups independent of patch reversal.
//!
//! Used when reversal is not possible or several patches must be unwound
//! together. Each backup copies the named files under a unique ID with a
//! manifest; restore reports per-file misses instead of failing wholesale.

use crate::event_log::EventLog;
use chrono::{DateTime, Utc};
use foreman_proto::{AuditEvent, Error, EventType, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// One file within a backup set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupEntry {
    /// Path relative to the backed-up root.
    path: PathBuf,
    /// Whether the source file existed and was copied.
    stored: bool,
}

/// Manifest persisted next to the copied files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupManifest {
    backup_id: String,
    root: PathBuf,
    entries: Vec<BackupEntry>,
    created_at: DateTime<Utc>,
}

/// Result of restoring a backup.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Files copied back into place.
    pub restored: Vec<PathBuf>,
    /// Files requested but never successfully backed up.
    pub missing: Vec<PathBuf>,
}

/// Directory-backed snapshot store.
pub struct BackupStore {
    dir: PathBuf,
    log: Arc<EventLog>,
}

impl BackupStore {
    /// Opens (or creates) the store directory.
    pub fn open(dir: impl AsRef<Path>, log: Arc<EventLog>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, log })
    }

    /// Snapshots the given files (relative to `root`) and returns the
    /// backup ID. Missing sources are recorded as not stored rather than
    /// aborting the snapshot.
    pub fn backup(&self, root: &Path, paths: &[PathBuf]) -> Result<String> {
        let backup_id = Uuid::new_v4().to_string();
        let backup_dir = self.dir.join(&backup_id);
        std::fs::create_dir_all(&backup_dir)?;

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let source = root.join(path);
            let stored = if source.is_file() {
                let dest = backup_dir.join(path);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&source, &dest)?;
                true
            } else {
                warn!(path = %path.display(), "backup source missing, recording as not stored");
                false
            };
            entries.push(BackupEntry {
                path: path.clone(),
                stored,
            });
        }

        let manifest = BackupManifest {
            backup_id: backup_id.clone(),
            root: root.to_path_buf(),
            entries,
            created_at: Utc::now(),
        };
        std::fs::write(
            backup_dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        self.log.emit(
            AuditEvent::new(EventType::BackupCreated, "backup", backup_id.as_str()).with_metadata(
                serde_json::json!({
                    "root": root.display().to_string(),
                    "files": manifest.entries.len(),
                }),
            ),
        )?;

        Ok(backup_id)
    }

    /// Restores a backup into its original root, reporting per-file what
    /// was restored and what was never backed up.
    pub fn restore(&self, backup_id: &str) -> Result<RestoreReport> {
        let backup_dir = self.dir.join(backup_id);
        let manifest_path = backup_dir.join("manifest.json");
        if !manifest_path.exists() {
            return Err(Error::BackupNotFound(backup_id.to_string()));
        }
        let manifest: BackupManifest =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)?;

        let mut report = RestoreReport::default();
        for entry in &manifest.entries {
            let stored = backup_dir.join(&entry.path);
            if entry.stored && stored.is_file() {
                let dest = manifest.root.join(&entry.path);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&stored, &dest)?;
                report.restored.push(entry.path.clone());
            } else {
                report.missing.push(entry.path.clone());
            }
        }

        self.log.emit(
            AuditEvent::new(EventType::BackupRestored, "backup", backup_id).with_metadata(
                serde_json::json!({
                    "restored": report.restored.len(),
                    "missing": report.missing.len(),
                }),
            ),
        )?;

        Ok(report)
    }
}
