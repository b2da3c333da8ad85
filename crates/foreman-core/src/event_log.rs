//! Append-only JSONL audit log.
//!
//! The log writes each event as one JSON line immediately for crash
//! resilience. Appends are serialized through an internal writer lock so a
//! record is never interleaved across lines under concurrent emitters.
//! Queries scan the file linearly and skip malformed lines, so corruption
//! from a prior crash never blocks later reads.

use chrono::{DateTime, Utc};
use foreman_proto::{AuditEvent, Error, EventType, Result, Severity};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Filter for querying the audit log.
#[derive(Debug, Default, Clone)]
pub struct EventQuery {
    /// Match only this entity type.
    pub entity_type: Option<String>,
    /// Match only this entity ID.
    pub entity_id: Option<String>,
    /// Match only this event type.
    pub event_type: Option<EventType>,
    /// Match only events at or above this severity.
    pub min_severity: Option<Severity>,
    /// Match only events at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Match only events before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Stop after this many matches.
    pub limit: Option<usize>,
}

impl EventQuery {
    /// Matches every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches events for one entity.
    pub fn for_entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    /// Restricts to one event type.
    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Restricts to a severity floor.
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    /// Checks whether an event passes the filter.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref entity_type) = self.entity_type {
            if event.entity_type != *entity_type {
                return false;
            }
        }
        if let Some(ref entity_id) = self.entity_id {
            if event.entity_id != *entity_id {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }
        if let Some(since) = self.since {
            match event.timestamp {
                Some(ts) if ts >= since => {}
                _ => return false,
            }
        }
        if let Some(until) = self.until {
            match event.timestamp {
                Some(ts) if ts < until => {}
                _ => return false,
            }
        }
        true
    }
}

/// Durable, append-only event log backed by a JSONL file.
pub struct EventLog {
    path: PathBuf,
    writer: Mutex<File>,
}

impl EventLog {
    /// Opens (or creates) the log at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one event, assigning ID and timestamp if absent, and returns
    /// the assigned ID. Prior records are never touched.
    pub fn emit(&self, mut event: AuditEvent) -> Result<Uuid> {
        event.validate()?;

        let id = *event.event_id.get_or_insert_with(Uuid::new_v4);
        event.timestamp.get_or_insert_with(Utc::now);

        let json = serde_json::to_string(&event)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::Io(std::io::Error::other("event log writer lock poisoned")))?;
        writeln!(writer, "{json}")?;
        writer.flush()?;

        Ok(id)
    }

    /// Linear scan over the log with the given filter. Malformed lines are
    /// skipped with a warning, never fatal.
    pub fn query(&self, filter: &EventQuery) -> Result<Vec<AuditEvent>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) => {
                    if filter.matches(&event) {
                        events.push(event);
                        if let Some(limit) = filter.limit {
                            if events.len() >= limit {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(line_number = index + 1, error = %e, "skipping malformed audit record");
                }
            }
        }

        Ok(events)
    }

    /// Returns the last `limit` events in emission order.
    pub fn get_recent(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let mut events = self.query(&EventQuery::all())?;
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        Ok(events)
    }
}
