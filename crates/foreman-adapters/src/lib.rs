//! # foreman-adapters
//!
//! Agent adapters for the Foreman framework.
//!
//! This crate turns the opaque `AgentInvoker` boundary into real
//! subprocesses:
//! - `CommandBackend` maps a configured backend name to a command line and
//!   a prompt-passing mode; the mapping is closed and config-driven, with
//!   no dynamic name-to-type dispatch.
//! - `ProcessInvoker` runs the backend inside a task's worktree with
//!   concurrent output draining and a SIGTERM-enforced timeout.
//! - `detect_backend` probes the PATH in priority order when the config
//!   says `auto`.

mod command_backend;
mod process_invoker;

pub use command_backend::{
    BackendError, CommandBackend, DEFAULT_PRIORITY, PromptMode, detect_backend,
    is_backend_available,
};
pub use process_invoker::ProcessInvoker;
