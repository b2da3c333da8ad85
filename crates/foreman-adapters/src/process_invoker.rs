//! Process-based agent invoker.
//!
//! Runs the configured backend inside a task's working directory with
//! real-time output capture. Stdout and stderr are drained concurrently so
//! a full pipe buffer on one stream can never deadlock the other. An
//! optional timeout terminates the subprocess with SIGTERM and reports
//! `timed_out` distinctly from a non-zero exit.

use crate::command_backend::CommandBackend;
use async_trait::async_trait;
use foreman_proto::{AgentInvoker, InvokeOutcome};
#[cfg(unix)]
use nix::sys::signal::{Signal, kill};
#[cfg(unix)]
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Executes instructions by spawning the backend as a subprocess.
#[derive(Debug)]
pub struct ProcessInvoker {
    backend: CommandBackend,
}

impl ProcessInvoker {
    /// Creates an invoker for the given backend.
    pub fn new(backend: CommandBackend) -> Self {
        Self { backend }
    }

    /// Terminates the child process with SIGTERM.
    #[cfg(unix)]
    fn terminate_child(child: &mut tokio::process::Child) {
        if let Some(pid) = child.id() {
            #[allow(clippy::cast_possible_wrap)]
            let pid = Pid::from_raw(pid as i32);
            debug!(%pid, "sending SIGTERM to agent process");
            let _ = kill(pid, Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn terminate_child(child: &mut tokio::process::Child) {
        let _ = child.start_kill();
    }
}

#[async_trait]
impl AgentInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        workdir: &Path,
        instructions: &str,
        timeout: Option<Duration>,
    ) -> std::io::Result<InvokeOutcome> {
        let (cmd, args, stdin_input) = self.backend.build_command(instructions);

        let mut command = Command::new(&cmd);
        command.args(&args);
        command.current_dir(workdir);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if stdin_input.is_some() {
            command.stdin(Stdio::piped());
        }

        debug!(command = %cmd, args = ?args, workdir = %workdir.display(), "spawning agent");
        let mut child = command.spawn()?;

        if let Some(input) = stdin_input
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(input.as_bytes()).await?;
            drop(stdin); // close stdin to signal EOF
        }

        // Take both handles upfront and drain concurrently so a filled
        // stderr buffer cannot stall stdout (and vice versa).
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();

        let drain = async {
            let stdout_future = async {
                let mut lines_out = Vec::new();
                if let Some(stdout) = stdout_handle {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Some(line) = lines.next_line().await? {
                        lines_out.push(line);
                    }
                }
                Ok::<_, std::io::Error>(lines_out)
            };
            let stderr_future = async {
                let mut lines_out = Vec::new();
                if let Some(stderr) = stderr_handle {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Some(line) = lines.next_line().await? {
                        lines_out.push(line);
                    }
                }
                Ok::<_, std::io::Error>(lines_out)
            };
            tokio::try_join!(stdout_future, stderr_future)
        };

        let mut timed_out = false;
        let (stdout_lines, stderr_lines) = match timeout {
            Some(duration) => match tokio::time::timeout(duration, drain).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        timeout_secs = duration.as_secs(),
                        "agent exceeded budget, sending SIGTERM"
                    );
                    timed_out = true;
                    Self::terminate_child(&mut child);
                    (Vec::new(), Vec::new())
                }
            },
            None => drain.await?,
        };

        let status = child.wait().await?;

        let files_modified = if timed_out {
            Vec::new()
        } else {
            modified_files(workdir).await
        };

        Ok(InvokeOutcome {
            exit_code: status.code(),
            stdout: join_lines(&stdout_lines),
            stderr: join_lines(&stderr_lines),
            files_modified,
            timed_out,
        })
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Paths the invocation touched, from `git status --porcelain` in the
/// workdir. The adapter is a black box, so modifications are observed
/// rather than trusted from its output. Empty when the workdir is not a
/// repository.
async fn modified_files(workdir: &Path) -> Vec<String> {
    let output = Command::new("git")
        .current_dir(workdir)
        .args(["status", "--porcelain"])
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| {
                let path = &line[3..];
                // renames read "old -> new"; the new path is what changed
                match path.split_once(" -> ") {
                    Some((_, new)) => new.to_string(),
                    None => path.to_string(),
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}
