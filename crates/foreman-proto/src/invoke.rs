//! The agent invocation boundary.
//!
//! The core treats coding-assistant adapters as black boxes: it hands an
//! adapter a working directory and instructions, then observes the outcome.
//! Adapter-specific flags and protocols never cross this boundary.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Outcome of one opaque agent invocation.
#[derive(Debug, Clone, Default)]
pub struct InvokeOutcome {
    /// Process exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Paths the invocation modified inside the working directory.
    pub files_modified: Vec<String>,
    /// Whether the invocation was terminated for exceeding its budget.
    /// A timeout is reported distinctly from a non-zero exit code.
    pub timed_out: bool,
}

impl InvokeOutcome {
    /// True when the agent exited zero within its budget.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// A black-box agent adapter.
///
/// Implementations run the external coding assistant inside `workdir` and
/// enforce `timeout` themselves so a hung subprocess cannot stall the
/// dispatcher. On timeout they terminate the process and set `timed_out`
/// rather than returning an error.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Executes the instructions inside the working directory.
    async fn invoke(
        &self,
        workdir: &Path,
        instructions: &str,
        timeout: Option<Duration>,
    ) -> std::io::Result<InvokeOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_requires_zero_exit_and_no_timeout() {
        let ok = InvokeOutcome {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.success());

        let nonzero = InvokeOutcome {
            exit_code: Some(2),
            ..Default::default()
        };
        assert!(!nonzero.success());

        let timed_out = InvokeOutcome {
            exit_code: Some(0),
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed_out.success());
    }
}
