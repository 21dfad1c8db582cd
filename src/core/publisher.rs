//! Result publisher: best-effort upload of the results tree.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::adapters::ObjectStore;
use crate::config::paths::{remote_results_prefix, remote_status_key};
use crate::domain::DONE_MARKER;

use super::artifacts::{to_key, ArtifactManager};
use super::error::PipelineError;

/// Uploads in flight at once
const UPLOAD_CONCURRENCY: usize = 8;

/// Outcome of one publication pass
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Remote keys written
    pub uploaded: Vec<String>,

    /// Failed uploads; never fatal
    pub failed: Vec<PipelineError>,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Pushes results and the completion marker to a remote store
pub struct ResultPublisher {
    store: Arc<dyn ObjectStore>,
    job_id: String,
}

impl ResultPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
        }
    }

    /// Upload every file under the results directory to `results/<job>/<path>`
    pub async fn publish(&self, artifacts: &ArtifactManager) -> PublishReport {
        let mut report = PublishReport::default();

        let files = match artifacts.list_results().await {
            Ok(files) => files,
            Err(e) => {
                report.failed.push(PipelineError::Publication {
                    target: self.store.describe(),
                    reason: e.to_string(),
                });
                return report;
            }
        };

        let prefix = remote_results_prefix(&self.job_id);
        let results_dir = artifacts.results_dir();

        let outcomes: Vec<(String, Result<(), PipelineError>)> = stream::iter(files)
            .map(|relative| {
                let key = format!("{}/{}", prefix, to_key(&relative));
                let local = results_dir.join(&relative);
                async move {
                    let outcome = self.upload_file(&local, &key).await;
                    (key, outcome)
                }
            })
            .buffer_unordered(UPLOAD_CONCURRENCY)
            .collect()
            .await;

        for (key, outcome) in outcomes {
            match outcome {
                Ok(()) => report.uploaded.push(key),
                Err(e) => {
                    warn!(error = %e, "Upload failed");
                    report.failed.push(e);
                }
            }
        }

        report.uploaded.sort();
        info!(
            destination = %self.store.describe(),
            uploaded = report.uploaded.len(),
            failed = report.failed.len(),
            "Published results"
        );
        report
    }

    async fn upload_file(&self, local: &std::path::Path, key: &str) -> Result<(), PipelineError> {
        self.store
            .put_file(key, local)
            .await
            .map_err(|e| PipelineError::Publication {
                target: format!("{}/{}", self.store.describe(), key),
                reason: format!("{:#}", e),
            })
    }

    /// Write the completion marker to `jobs/<job>/status.txt`
    pub async fn mark_done(&self) -> Result<(), PipelineError> {
        let key = remote_status_key(&self.job_id);
        self.store
            .put(&key, format!("{}\n", DONE_MARKER).into_bytes())
            .await
            .map_err(|e| PipelineError::Publication {
                target: format!("{}/{}", self.store.describe(), key),
                reason: format!("{:#}", e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LocalStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct RejectBins;

    #[async_trait]
    impl ObjectStore for RejectBins {
        fn describe(&self) -> String {
            "memory://flaky".to_string()
        }

        async fn put(&self, key: &str, _body: Vec<u8>) -> anyhow::Result<()> {
            if key.contains("/bins/") {
                anyhow::bail!("quota exceeded");
            }
            Ok(())
        }
    }

    fn results(temp: &TempDir) -> ArtifactManager {
        let dir = temp.path().join("results");
        std::fs::create_dir_all(dir.join("bins")).unwrap();
        std::fs::write(dir.join("bins/bin.1.fa"), ">c\nACGT\n").unwrap();
        std::fs::write(dir.join("manifest.json"), "{}").unwrap();
        ArtifactManager::new(dir)
    }

    #[tokio::test]
    async fn test_publish_mirrors_tree_under_job_prefix() {
        let temp = TempDir::new().unwrap();
        let remote = temp.path().join("remote");
        let publisher = ResultPublisher::new(Arc::new(LocalStore::new(&remote)), "t1");

        let report = publisher.publish(&results(&temp)).await;
        assert!(report.is_clean());
        assert_eq!(
            report.uploaded,
            vec!["results/t1/bins/bin.1.fa", "results/t1/manifest.json"]
        );
        assert!(remote.join("results/t1/bins/bin.1.fa").exists());

        publisher.mark_done().await.unwrap();
        let status = std::fs::read_to_string(remote.join("jobs/t1/status.txt")).unwrap();
        assert_eq!(status.trim(), "DONE");
    }

    #[tokio::test]
    async fn test_individual_failures_are_collected() {
        let temp = TempDir::new().unwrap();
        let publisher = ResultPublisher::new(Arc::new(RejectBins), "t1");

        let report = publisher.publish(&results(&temp)).await;
        assert_eq!(report.uploaded, vec!["results/t1/manifest.json"]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.failed[0].is_fatal());
    }
}
