//! Command-line backend definitions for agent CLIs.
//!
//! The backend table is closed: a configured name maps to a known command
//! shape, `custom` requires an explicit command, and anything else is an
//! error rather than a silent fallback.

use foreman_core::AgentConfig;
use std::process::Command;
use tracing::debug;

/// Default priority order for backend auto-detection.
pub const DEFAULT_PRIORITY: &[&str] = &["claude", "codex", "gemini"];

/// How the instructions are handed to the CLI tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Appended as a command-line argument.
    Arg,
    /// Written to stdin.
    Stdin,
}

/// Errors selecting or constructing a backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The configured backend name is not in the table.
    #[error("unknown backend '{0}'")]
    Unknown(String),

    /// The custom backend needs a command.
    #[error("custom backend requires a command to be specified")]
    CustomMissingCommand,

    /// Auto-detection found nothing on the PATH.
    #[error("no supported agent backend found in PATH (checked: {})", checked.join(", "))]
    NoBackendAvailable {
        /// Backends that were probed.
        checked: Vec<String>,
    },
}

/// A CLI backend: the command shape used to execute instructions.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    /// The command to execute.
    pub command: String,
    /// Arguments placed before the instructions.
    pub args: Vec<String>,
    /// How the instructions are passed.
    pub prompt_mode: PromptMode,
    /// Flag preceding the instructions argument, if any.
    pub prompt_flag: Option<String>,
}

impl CommandBackend {
    /// Resolves a backend from configuration.
    pub fn from_config(config: &AgentConfig) -> Result<Self, BackendError> {
        match config.backend.as_str() {
            "claude" => Ok(Self::claude()),
            "codex" => Ok(Self::codex()),
            "gemini" => Ok(Self::gemini()),
            "custom" => Self::custom(config),
            "auto" => {
                let name = detect_backend(DEFAULT_PRIORITY)?;
                // detection only returns names from the table above
                Ok(match name.as_str() {
                    "claude" => Self::claude(),
                    "codex" => Self::codex(),
                    _ => Self::gemini(),
                })
            }
            other => Err(BackendError::Unknown(other.to_string())),
        }
    }

    /// Claude CLI in headless print mode.
    pub fn claude() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["--dangerously-skip-permissions".to_string()],
            prompt_mode: PromptMode::Arg,
            prompt_flag: Some("-p".to_string()),
        }
    }

    /// Codex CLI in non-interactive exec mode.
    pub fn codex() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["exec".to_string()],
            prompt_mode: PromptMode::Arg,
            prompt_flag: None,
        }
    }

    /// Gemini CLI reading the prompt from stdin.
    pub fn gemini() -> Self {
        Self {
            command: "gemini".to_string(),
            args: Vec::new(),
            prompt_mode: PromptMode::Stdin,
            prompt_flag: None,
        }
    }

    /// A user-supplied command.
    pub fn custom(config: &AgentConfig) -> Result<Self, BackendError> {
        let command = config
            .command
            .clone()
            .ok_or(BackendError::CustomMissingCommand)?;
        Ok(Self {
            command,
            args: config.args.clone(),
            prompt_mode: PromptMode::Stdin,
            prompt_flag: None,
        })
    }

    /// Builds the concrete command line: `(command, args, stdin_input)`.
    pub fn build_command(&self, instructions: &str) -> (String, Vec<String>, Option<String>) {
        let mut args = self.args.clone();
        let stdin_input = match self.prompt_mode {
            PromptMode::Arg => {
                if let Some(flag) = &self.prompt_flag {
                    args.push(flag.clone());
                }
                args.push(instructions.to_string());
                None
            }
            PromptMode::Stdin => Some(instructions.to_string()),
        };
        (self.command.clone(), args, stdin_input)
    }
}

/// Checks whether a backend responds to `--version` on the PATH.
pub fn is_backend_available(backend: &str) -> bool {
    let available = Command::new(backend)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    debug!(backend, available, "backend availability check");
    available
}

/// Probes the PATH for the first available backend in priority order.
pub fn detect_backend(priority: &[&str]) -> Result<String, BackendError> {
    let mut checked = Vec::new();
    for &backend in priority {
        checked.push(backend.to_string());
        if is_backend_available(backend) {
            debug!(backend, "backend detected");
            return Ok(backend.to_string());
        }
    }
    Err(BackendError::NoBackendAvailable { checked })
}
