//! Plan and task descriptor types.
//!
//! A plan is the submission contract consumed from collaborators: a JSON
//! file listing task descriptors with their dependencies and declared file
//! scope. The `metadata` map is opaque to the core and passed through
//! unmodified; by convention the `instructions` key carries the text handed
//! to the agent adapter.
//!
//! # Example
//!
//! ```
//! use foreman_core::TaskDescriptor;
//!
//! let task = TaskDescriptor::new("build-api")
//!     .with_kind("implement")
//!     .with_dependency("design-api")
//!     .with_scope_glob("src/api/**/*.rs");
//!
//! assert_eq!(task.id, "build-api");
//! assert_eq!(task.depends_on, vec!["design-api".to_string()]);
//! ```

use foreman_proto::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// A unit of schedulable work as submitted by a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Unique task identifier (alphanumeric, hyphens, underscores).
    pub id: String,

    /// Free-form kind tag ("implement", "review", ...).
    #[serde(default)]
    pub kind: String,

    /// IDs of tasks that must complete before this one may run.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Opaque key-value map, passed through unmodified. The `instructions`
    /// key, when present, is forwarded to the agent adapter.
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,

    /// Glob patterns naming the paths this task may modify. An empty list
    /// permits no modifications at all.
    #[serde(default)]
    pub file_scope: Vec<String>,
}

impl TaskDescriptor {
    /// Creates a descriptor with the given ID and no dependencies.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: String::new(),
            depends_on: Vec::new(),
            metadata: serde_json::Map::new(),
            file_scope: Vec::new(),
        }
    }

    /// Sets the kind tag.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Adds a dependency.
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Adds an allowed file-scope glob.
    pub fn with_scope_glob(mut self, pattern: impl Into<String>) -> Self {
        self.file_scope.push(pattern.into());
        self
    }

    /// Sets a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns the adapter instructions, if the submitter provided any.
    pub fn instructions(&self) -> Option<&str> {
        self.metadata.get("instructions").and_then(Value::as_str)
    }

    /// Validates the descriptor in isolation.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::PlanInvalid("task id must not be empty".to_string()));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::PlanInvalid(format!(
                "task id '{}' contains invalid characters; use alphanumeric, hyphens, or underscores",
                self.id
            )));
        }
        if self.depends_on.iter().any(|d| d == &self.id) {
            return Err(Error::PlanInvalid(format!(
                "task '{}' depends on itself",
                self.id
            )));
        }
        Ok(())
    }
}

/// Plan-level metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMetadata {
    /// Optional plan name.
    pub name: Option<String>,

    /// Optional description.
    pub description: Option<String>,

    /// Plan version.
    pub version: Option<String>,
}

/// A plan of tasks loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Task descriptors.
    pub tasks: Vec<TaskDescriptor>,

    /// Optional plan-level metadata.
    #[serde(default)]
    pub metadata: PlanMetadata,
}

impl Plan {
    /// Loads and validates a plan from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let plan: Self = serde_json::from_str(&content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Validates every descriptor plus cross-task consistency: unique IDs
    /// and dependencies that reference tasks present in the plan.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::PlanInvalid(
                "plan must contain at least one task".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for task in &self.tasks {
            task.validate()?;
            if !ids.insert(task.id.as_str()) {
                return Err(Error::PlanInvalid(format!(
                    "duplicate task id: '{}'",
                    task.id
                )));
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(Error::PlanInvalid(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
            }
        }

        Ok(())
    }

    /// Looks up a descriptor by ID.
    pub fn get(&self, id: &str) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_builder() {
        let task = TaskDescriptor::new("fix-parser")
            .with_kind("bugfix")
            .with_dependency("triage")
            .with_scope_glob("src/parser/*.rs")
            .with_metadata("instructions", Value::String("fix the parser".into()));

        assert_eq!(task.kind, "bugfix");
        assert_eq!(task.instructions(), Some("fix the parser"));
        assert!(task.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_id() {
        let task = TaskDescriptor::new("bad id!");
        assert!(matches!(task.validate(), Err(Error::PlanInvalid(_))));
    }

    #[test]
    fn rejects_self_dependency() {
        let task = TaskDescriptor::new("t1").with_dependency("t1");
        assert!(matches!(task.validate(), Err(Error::PlanInvalid(_))));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let plan = Plan {
            tasks: vec![TaskDescriptor::new("t1"), TaskDescriptor::new("t1")],
            metadata: PlanMetadata::default(),
        };
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate task id"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let plan = Plan {
            tasks: vec![TaskDescriptor::new("t1").with_dependency("ghost")],
            metadata: PlanMetadata::default(),
        };
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("unknown task 'ghost'"));
    }

    #[test]
    fn rejects_empty_plan() {
        let plan = Plan {
            tasks: vec![],
            metadata: PlanMetadata::default(),
        };
        assert!(matches!(plan.validate(), Err(Error::PlanInvalid(_))));
    }

    #[test]
    fn parses_submission_contract() {
        let json = r#"{
            "tasks": [
                {
                    "id": "design-api",
                    "kind": "design",
                    "file_scope": ["docs/api.md"]
                },
                {
                    "id": "build-api",
                    "kind": "implement",
                    "depends_on": ["design-api"],
                    "metadata": {"instructions": "implement the API", "owner": "backend"},
                    "file_scope": ["src/api/**/*.rs", "tests/api/*.rs"]
                }
            ],
            "metadata": {"name": "api-milestone", "version": "1.0.0"}
        }"#;

        let plan: Plan = serde_json::from_str(json).unwrap();
        assert!(plan.validate().is_ok());
        assert_eq!(plan.tasks.len(), 2);

        let build = plan.get("build-api").unwrap();
        assert_eq!(build.depends_on, vec!["design-api".to_string()]);
        assert_eq!(build.metadata["owner"], "backend");
        assert_eq!(plan.metadata.name.as_deref(), Some("api-milestone"));
    }
}
