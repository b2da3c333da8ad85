//! Audit event schema.
//!
//! Audit events are immutable facts. The event log is the source of truth
//! for "what happened", independent of any in-memory state, so a crashed
//! process can reconstruct its state by replay.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of event types emitted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A task moved between lifecycle states.
    TaskStateTransition,
    /// An external agent process was spawned.
    ProcessStarted,
    /// A diff was captured from a worktree.
    PatchCaptured,
    /// A patch passed scope validation.
    PatchValidated,
    /// A patch was applied to a target tree.
    PatchApplied,
    /// A previously applied patch was reversed.
    PatchReversed,
    /// A patch touched paths outside its declared scope.
    ScopeViolation,
    /// An isolated worktree was created.
    WorktreeCreated,
    /// A worktree was removed.
    WorktreeRemoved,
    /// A task branch merged cleanly into the integration branch.
    MergeCompleted,
    /// A merge-back attempt conflicted and was aborted.
    MergeConflict,
    /// A file backup snapshot was taken.
    BackupCreated,
    /// A backup snapshot was restored.
    BackupRestored,
    /// Bounded retries were exhausted for a task.
    CircuitBreakerTrip,
    /// A run began executing.
    RunStarted,
    /// A run was cancelled between batches.
    RunCancelled,
    /// A run finished with every task completed.
    Completed,
    /// A run finished with at least one failed task.
    Failed,
}

/// Event severity levels, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

/// An immutable audit record, serialized as one JSON object per log line.
///
/// `event_id` and `timestamp` may be left unset at construction; the event
/// log assigns them on emit. Once written, a record is never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID, assigned on emit if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,

    /// ISO-8601 timestamp, assigned on emit if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// What happened.
    pub event_type: EventType,

    /// How important it is.
    #[serde(default)]
    pub severity: Severity,

    /// Kind of entity the event is about ("task", "worktree", "patch", ...).
    pub entity_type: String,

    /// Identity of the entity within its kind.
    pub entity_id: String,

    /// State before the transition, for state-change events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,

    /// State after the transition, for state-change events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<String>,

    /// Free-form structured context.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl AuditEvent {
    /// Creates an event with the required fields; ID and timestamp are
    /// filled in by the log on emit.
    pub fn new(
        event_type: EventType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: None,
            timestamp: None,
            event_type,
            severity: Severity::default(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            from_state: None,
            to_state: None,
            metadata: Value::Null,
        }
    }

    /// Sets the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Records a state transition.
    pub fn with_states(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from_state = Some(from.into());
        self.to_state = Some(to.into());
        self
    }

    /// Attaches structured metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validates required fields before emission.
    pub fn validate(&self) -> Result<()> {
        if self.entity_type.is_empty() {
            return Err(Error::MissingEventField("entity_type"));
        }
        if self.entity_id.is_empty() {
            return Err(Error::MissingEventField("entity_id"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_optional_fields() {
        let event = AuditEvent::new(EventType::TaskStateTransition, "task", "build-api")
            .with_states("pending", "running")
            .with_severity(Severity::Debug)
            .with_metadata(serde_json::json!({"attempt": 1}));

        assert_eq!(event.from_state.as_deref(), Some("pending"));
        assert_eq!(event.to_state.as_deref(), Some("running"));
        assert_eq!(event.severity, Severity::Debug);
        assert!(event.event_id.is_none());
    }

    #[test]
    fn serializes_snake_case_event_type() {
        let event = AuditEvent::new(EventType::MergeConflict, "worktree", "wt-1");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"merge_conflict\""));
        // Unset ID/timestamp are omitted, not serialized as null
        assert!(!json.contains("event_id"));
    }

    #[test]
    fn validate_rejects_empty_entity() {
        let event = AuditEvent::new(EventType::Completed, "", "run-1");
        assert!(matches!(
            event.validate(),
            Err(Error::MissingEventField("entity_type"))
        ));
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let event = AuditEvent::new(EventType::PatchCaptured, "patch", "t1-1")
            .with_metadata(serde_json::json!({"files": ["src/a.rs"]}));
        let json = serde_json::to_string(&event).unwrap();
        let parsed: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::PatchCaptured);
        assert_eq!(parsed.entity_id, "t1-1");
        assert_eq!(parsed.metadata["files"][0], "src/a.rs");
    }
}
