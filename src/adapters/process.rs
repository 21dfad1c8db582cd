//! Subprocess executor for external analysis tools.
//!
//! Commands are spawned directly (no shell). Stdout is discarded, stderr is
//! drained continuously and its last lines are kept for error reports.
//!
//! Timeout policy: when a [`KillPolicy`] is given and the tool outlives it, the
//! process receives SIGTERM (via `kill -TERM`), gets `grace` to exit, and is
//! then force-killed. The invocation is reported as timed out either way.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{KillPolicy, ToolExecutor, ToolOutcome};
use crate::domain::ToolCommand;

/// Number of stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 5;

/// How long to keep reading stderr after a timed-out tool was killed
const STDERR_DRAIN_AFTER_KILL: Duration = Duration::from_secs(2);

/// Executor that runs tools as local subprocesses
pub struct ProcessExecutor;

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }

    fn spawn(&self, command: &ToolCommand) -> Result<Child> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn()
            .with_context(|| format!("Failed to spawn '{}'. Is it installed and on PATH?", command.program))
    }

    /// Stop a child that outlived its timeout
    async fn terminate(child: &mut Child, policy: KillPolicy) {
        if let Some(pid) = child.id() {
            let term = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await;
            if let Err(e) = term {
                warn!(pid, error = %e, "Failed to send SIGTERM");
            }

            if let Ok(Ok(_)) = timeout(policy.grace, child.wait()).await {
                return;
            }
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill timed-out tool");
        }
    }
}

/// Drain a stream, keeping only the last `keep` lines
async fn read_tail<R: AsyncRead + Unpin>(stream: R, keep: usize) -> String {
    let mut reader = BufReader::new(stream);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(keep);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if tail.len() == keep {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    }

    tail.into_iter().collect::<Vec<_>>().join(" | ")
}

#[async_trait]
impl ToolExecutor for ProcessExecutor {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(&self, command: &ToolCommand, policy: Option<KillPolicy>) -> Result<ToolOutcome> {
        debug!(command = %command.display_line(), "Spawning tool");

        let mut child = self.spawn(command)?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_tail(stderr, STDERR_TAIL_LINES)));

        let (status, timed_out) = match policy {
            Some(policy) => match timeout(policy.timeout, child.wait()).await {
                Ok(status) => (Some(status), false),
                Err(_) => {
                    warn!(
                        program = %command.program,
                        timeout_secs = policy.timeout.as_secs(),
                        "Tool exceeded its timeout, terminating"
                    );
                    Self::terminate(&mut child, policy).await;
                    (None, true)
                }
            },
            None => (Some(child.wait().await), false),
        };

        let exit_code = match status {
            Some(status) => status
                .with_context(|| format!("Failed to wait for '{}'", command.program))?
                .code(),
            None => None,
        };

        // Grandchildren of a killed tool may still hold the pipe open
        let stderr_tail = match stderr_task {
            Some(task) if timed_out => timeout(STDERR_DRAIN_AFTER_KILL, task)
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_default(),
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(ToolOutcome {
            exit_code,
            timed_out,
            stderr_tail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_exit() {
        let executor = ProcessExecutor::new();
        let outcome = executor.execute(&ToolCommand::new("true"), None).await.unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_stderr_tail() {
        let executor = ProcessExecutor::new();
        let cmd = ToolCommand::new("sh").args(["-c", "echo first >&2; echo second >&2; exit 3"]);
        let outcome = executor.execute(&cmd, None).await.unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stderr_tail, "first | second");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let executor = ProcessExecutor::new();
        let result = executor
            .execute(&ToolCommand::new("definitely-not-a-real-tool-xyz"), None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_timeout_kills_tool() {
        let executor = ProcessExecutor::new();
        let policy = KillPolicy {
            timeout: Duration::from_millis(200),
            grace: Duration::from_millis(200),
        };
        let outcome = executor
            .execute(&ToolCommand::new("sleep").arg("30"), Some(policy))
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.is_success());
    }
}
