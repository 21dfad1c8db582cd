//! Adapter interfaces for external systems.
//!
//! Adapters are the seams between the orchestration core and the outside
//! world: external analysis tools run as processes, and remote object storage
//! for log mirroring and result publication.

pub mod process;
pub mod storage;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::domain::ToolCommand;

pub use process::ProcessExecutor;
pub use storage::{open_store, GcsStore, LocalStore, RemoteDestination, StoreSettings};

/// Outcome of one tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Exit code, `None` if the process was killed by a signal
    pub exit_code: Option<i32>,

    /// Whether the timeout policy killed the process
    pub timed_out: bool,

    /// Last lines of stderr, for error reports
    pub stderr_tail: String,
}

impl ToolOutcome {
    /// A clean zero exit
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            timed_out: false,
            stderr_tail: String::new(),
        }
    }

    /// A plain exit with the given code
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::success()
        }
    }

    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Short description of a failure for error messages
    pub fn describe(&self) -> String {
        let mut detail = if self.timed_out {
            "timed out and was killed".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            }
        };
        if !self.stderr_tail.is_empty() {
            detail.push_str(": ");
            detail.push_str(&self.stderr_tail);
        }
        detail
    }
}

/// Timeout policy for one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillPolicy {
    /// Wall-clock limit for the invocation
    pub timeout: Duration,

    /// Time between SIGTERM and the forced kill
    pub grace: Duration,
}

/// Trait for running external tools
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Run a command to completion.
    ///
    /// `Err` means the process could not be started at all; a process that
    /// ran and failed is reported through [`ToolOutcome`].
    async fn execute(&self, command: &ToolCommand, policy: Option<KillPolicy>) -> Result<ToolOutcome>;
}

/// Trait for remote object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Destination description for logs, e.g. `gs://bucket/prefix`
    fn describe(&self) -> String;

    /// Create or replace an object at `key` (relative to the destination)
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;

    /// Upload a local file to `key`.
    ///
    /// The default buffers the whole file; backends that handle large
    /// results stream it instead.
    async fn put_file(&self, key: &str, local: &Path) -> Result<()> {
        let body = tokio::fs::read(local)
            .await
            .with_context(|| format!("Failed to read {}", local.display()))?;
        self.put(key, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_descriptions() {
        assert!(ToolOutcome::success().is_success());
        assert_eq!(ToolOutcome::exited(3).describe(), "exit code 3");

        let killed = ToolOutcome {
            exit_code: None,
            timed_out: true,
            stderr_tail: "still assembling".to_string(),
        };
        assert!(!killed.is_success());
        assert_eq!(killed.describe(), "timed out and was killed: still assembling");
    }
}
