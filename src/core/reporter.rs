//! Progress reporter: the append-only job log.
//!
//! The local log file is the source of truth. When a remote store is
//! configured, the whole log is re-uploaded to the job's remote log object
//! after every line; a failed upload is logged and counted, never returned.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::adapters::ObjectStore;
use crate::config::paths::remote_log_key;
use crate::domain::LogEvent;

use super::error::PipelineError;

/// Appends timestamped status lines to the job log
pub struct ProgressReporter {
    job_id: String,

    /// Path to the local log file
    log_path: PathBuf,

    /// Optional remote mirror
    mirror: Option<Arc<dyn ObjectStore>>,

    /// Number of failed mirror uploads
    mirror_failures: AtomicUsize,
}

impl ProgressReporter {
    /// Open (or create) the log for a job
    pub async fn open(
        job_id: impl Into<String>,
        log_path: impl Into<PathBuf>,
        mirror: Option<Arc<dyn ObjectStore>>,
    ) -> Result<Self> {
        let log_path = log_path.into();

        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }

        Ok(Self {
            job_id: job_id.into(),
            log_path,
            mirror,
            mirror_failures: AtomicUsize::new(0),
        })
    }

    /// Get the path to the log file
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Number of remote mirror uploads that failed so far
    pub fn mirror_failures(&self) -> usize {
        self.mirror_failures.load(Ordering::Relaxed)
    }

    /// Append a message to the log
    pub async fn report(&self, message: impl Into<String>) -> Result<LogEvent, PipelineError> {
        let event = LogEvent::new(self.job_id.clone(), message);
        self.append(&event)
            .await
            .map_err(|e| PipelineError::io(format!("Failed to write log {}", self.log_path.display()), e))?;

        info!(job_id = %self.job_id, "{}", event.message);

        if let Some(ref mirror) = self.mirror {
            if let Err(e) = self.mirror_log(mirror.as_ref()).await {
                self.mirror_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Remote log mirroring failed; continuing with local log");
            }
        }

        Ok(event)
    }

    async fn append(&self, event: &LogEvent) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(format!("{}\n", event.render()).as_bytes()).await?;
        file.flush().await
    }

    /// Upload the whole local log to the job's remote log object
    async fn mirror_log(&self, mirror: &dyn ObjectStore) -> Result<(), PipelineError> {
        let target = format!("{}/{}", mirror.describe(), remote_log_key(&self.job_id));

        let body = fs::read(&self.log_path).await.map_err(|e| PipelineError::Publication {
            target: target.clone(),
            reason: format!("cannot read local log: {}", e),
        })?;

        mirror
            .put(&remote_log_key(&self.job_id), body)
            .await
            .map_err(|e| PipelineError::Publication {
                target,
                reason: format!("{:#}", e),
            })
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<LogEvent>> {
        read_log(&self.job_id, &self.log_path).await
    }
}

/// Read a job log from disk, skipping lines that are not log events
pub async fn read_log(job_id: &str, path: &Path) -> Result<Vec<LogEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;

    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut events = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if let Some(event) = LogEvent::parse_line(job_id, &line) {
            events.push(event);
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct BrokenStore;

    #[async_trait]
    impl ObjectStore for BrokenStore {
        fn describe(&self) -> String {
            "gs://unreachable".to_string()
        }

        async fn put(&self, _key: &str, _body: Vec<u8>) -> Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn test_report_appends_in_order() {
        let temp = TempDir::new().unwrap();
        let reporter = ProgressReporter::open("t1", temp.path().join("logs/t1.log"), None)
            .await
            .unwrap();

        for i in 0..5 {
            reporter.report(format!("message {}", i)).await.unwrap();
        }

        let events = reporter.replay().await.unwrap();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.message, format!("message {}", i));
            assert_eq!(event.job_id, "t1");
        }

        let raw = std::fs::read_to_string(reporter.log_path()).unwrap();
        assert!(raw.lines().all(|l| l.starts_with('[')));
    }

    #[tokio::test]
    async fn test_mirror_failure_is_swallowed() {
        let temp = TempDir::new().unwrap();
        let reporter = ProgressReporter::open(
            "t1",
            temp.path().join("t1.log"),
            Some(Arc::new(BrokenStore)),
        )
        .await
        .unwrap();

        reporter.report("still logged").await.unwrap();
        reporter.report("and again").await.unwrap();

        assert_eq!(reporter.mirror_failures(), 2);
        assert_eq!(reporter.replay().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_missing_log_is_empty() {
        let temp = TempDir::new().unwrap();
        let events = read_log("t1", &temp.path().join("nope.log")).await.unwrap();
        assert!(events.is_empty());
    }
}
