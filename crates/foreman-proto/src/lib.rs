//! # foreman-proto
//!
//! Shared types, error definitions, and traits for the Foreman execution core.
//!
//! This crate provides the foundational abstractions used across all Foreman
//! crates, including:
//! - The audit event schema (closed event-type enumeration, severity levels)
//! - The common error taxonomy callers branch on by kind
//! - The opaque agent-invocation boundary (`AgentInvoker`)

mod error;
mod event;
mod invoke;

pub use error::{Error, Result};
pub use event::{AuditEvent, EventType, Severity};
pub use invoke::{AgentInvoker, InvokeOutcome};
