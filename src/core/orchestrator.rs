//! Pipeline controller.
//!
//! Drives the fixed stage list through an explicit state machine:
//! `Init -> Stage(0) -> ... -> Stage(N-1) -> Finalize -> Done`, with an
//! absorbing `Failed` state entered on the first fatal error.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{ObjectStore, ToolExecutor};
use crate::config::PipelineConfig;
use crate::domain::events::messages;
use crate::domain::{
    ControllerState, RunOutcome, RunSummary, StageDescriptor, StageReport, StageResult, Step, DONE_MARKER,
};

use super::artifacts::{prepare_dirs, remove_stale, ArtifactManager};
use super::error::PipelineError;
use super::monitor::estimate_cost;
use super::publisher::ResultPublisher;
use super::reporter::ProgressReporter;
use super::runner::StageRunner;
use super::stages::{
    aggregate_report_command, aggregate_report_path, aggregate_sources, build_stages, external_inputs,
    validate_wiring, TrimSummary,
};

/// Top-level driver for one pipeline run
pub struct PipelineController {
    config: PipelineConfig,
    executor: Arc<dyn ToolExecutor>,
    store: Option<Arc<dyn ObjectStore>>,
    runner: StageRunner,
    artifacts: ArtifactManager,
}

impl PipelineController {
    /// Create a controller; `store` enables log mirroring and publication
    pub fn new(
        config: PipelineConfig,
        executor: Arc<dyn ToolExecutor>,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        let runner = StageRunner::new(executor.clone(), config.kill_policy);
        let artifacts = ArtifactManager::new(config.results_dir());
        Self {
            config,
            executor,
            store,
            runner,
            artifacts,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline to a terminal state.
    ///
    /// Stage failures are reported through the returned summary; `Err` is
    /// only returned when the configuration is rejected or the log cannot be
    /// opened.
    #[instrument(skip(self), fields(job_id = %self.config.job_id))]
    pub async fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;

        let reporter = ProgressReporter::open(&self.config.job_id, self.config.log_file(), self.store.clone())
            .await
            .context("Failed to open job log")?;

        let stages = build_stages(&self.config);
        let mut summary = RunSummary::new(&self.config.job_id);
        let mut state = ControllerState::Init;

        info!(executor = self.executor.name(), stages = stages.len(), "Starting pipeline");

        while !state.is_terminal() {
            debug!(state = %state.label(), "Entering state");
            state = self.advance(state, &stages, &reporter, &mut summary).await;
        }

        summary.finished_at = Some(Utc::now());
        let elapsed = summary.elapsed_secs();
        let closing = format!(
            "Total time: {:.1} min, estimated cost: ${:.2} ({})",
            elapsed / 60.0,
            estimate_cost(&self.config.machine_type, elapsed),
            self.config.machine_type
        );
        self.report_best_effort(&reporter, closing).await;

        match state {
            ControllerState::Done => {
                self.report_best_effort(&reporter, DONE_MARKER).await;
                if let Some(ref store) = self.store {
                    let publisher = ResultPublisher::new(store.clone(), &self.config.job_id);
                    if let Err(e) = publisher.mark_done().await {
                        warn!(error = %e, "Failed to write remote completion marker");
                        summary.publication_failures += 1;
                    }
                }
                info!(elapsed_secs = elapsed, "Pipeline complete");
            }
            ControllerState::Failed { stage, error } => {
                let label = stage.as_deref().unwrap_or("init");
                self.report_best_effort(&reporter, messages::failed(label, &error.to_string()))
                    .await;
                error!(stage = label, kind = error.kind(), "Pipeline failed: {}", error);
                summary.outcome = RunOutcome::Failed { stage, error };
            }
            _ => {}
        }

        summary.publication_failures += reporter.mirror_failures();
        Ok(summary)
    }

    /// One state transition
    async fn advance(
        &self,
        state: ControllerState,
        stages: &[StageDescriptor],
        reporter: &ProgressReporter,
        summary: &mut RunSummary,
    ) -> ControllerState {
        match state {
            ControllerState::Init => match self.init(stages, reporter).await {
                Ok(()) => ControllerState::Stage(0),
                Err(error) => ControllerState::Failed { stage: None, error },
            },

            ControllerState::Stage(k) if k >= stages.len() => ControllerState::Finalize,

            ControllerState::Stage(k) => {
                let stage = &stages[k];

                if !self.config.steps.allows_all(&stage.gates) {
                    let gates: Vec<&str> = stage.gates.iter().map(|s| s.as_str()).collect();
                    let reason = format!("step '{}' not enabled", gates.join("+"));
                    return match reporter.report(messages::skipped(&stage.tool, &stage.id, &reason)).await {
                        Ok(_) => {
                            summary.skipped.push(stage.id.clone());
                            ControllerState::Stage(k + 1)
                        }
                        Err(error) => ControllerState::Failed {
                            stage: Some(stage.id.clone()),
                            error,
                        },
                    };
                }

                match self.execute_stage(stage, reporter).await {
                    Ok(result) => {
                        summary.completed.push(result);
                        ControllerState::Stage(k + 1)
                    }
                    Err(error) => ControllerState::Failed {
                        stage: Some(stage.id.clone()),
                        error,
                    },
                }
            }

            ControllerState::Finalize => match self.finalize(reporter, summary).await {
                Ok(()) => ControllerState::Done,
                Err(error) => ControllerState::Failed {
                    stage: Some("finalize".to_string()),
                    error,
                },
            },

            terminal => terminal,
        }
    }

    async fn init(&self, stages: &[StageDescriptor], reporter: &ProgressReporter) -> Result<(), PipelineError> {
        validate_wiring(stages, &external_inputs(&self.config))
            .map_err(|e| PipelineError::Config(format!("{:#}", e)))?;

        // A rerun under the same job id starts from an empty results tree
        if remove_stale(self.artifacts.results_dir()).await? {
            debug!(results = %self.artifacts.results_dir().display(), "Cleared previous results");
        }
        prepare_dirs(&self.config.layout.base_dirs(&self.config.job_id)).await?;

        reporter
            .report(format!(
                "Pipeline started: job {}, steps {}, threads {}, work dir {}",
                self.config.job_id,
                self.config.steps.to_list(),
                self.config.threads,
                self.config.layout.root().display()
            ))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, stage, reporter), fields(stage = %stage.id))]
    async fn execute_stage(
        &self,
        stage: &StageDescriptor,
        reporter: &ProgressReporter,
    ) -> Result<StageResult, PipelineError> {
        reporter.report(messages::running(&stage.tool, &stage.id)).await?;

        prepare_dirs(&stage.work_dirs).await?;
        let result = self.runner.run(stage).await?;
        let collected = self.artifacts.collect(stage).await?;

        debug!(collected = collected.len(), "Stage artifacts collected");

        if let Some(StageReport::TrimSummary(ref path)) = stage.report {
            self.report_trim_summary(path, reporter).await?;
        }

        reporter
            .report(messages::completed(&stage.tool, &stage.id, result.duration_secs()))
            .await?;
        Ok(result)
    }

    /// Log read survival from the Trimmomatic summary; parse failures only warn
    async fn report_trim_summary(&self, path: &Path, reporter: &ProgressReporter) -> Result<(), PipelineError> {
        let parsed = tokio::fs::read_to_string(path)
            .await
            .ok()
            .and_then(|content| TrimSummary::parse(&content));

        match parsed {
            Some(s) => {
                reporter
                    .report(format!(
                        "Trimming: {} input pairs, {} both surviving ({:.2}%), {} forward only, {} reverse only, {} dropped",
                        s.input_pairs,
                        s.both_surviving,
                        s.survival_rate(),
                        s.forward_only,
                        s.reverse_only,
                        s.dropped
                    ))
                    .await?;
            }
            None => warn!(path = %path.display(), "Could not parse trimming summary"),
        }
        Ok(())
    }

    async fn finalize(&self, reporter: &ProgressReporter, summary: &mut RunSummary) -> Result<(), PipelineError> {
        if self.config.tools.aggregate_report {
            let ran: BTreeSet<Step> = summary.completed.iter().map(|r| r.step).collect();
            self.aggregate_report(&ran, reporter).await?;
        } else {
            reporter.report("Skipping MultiQC: aggregate report disabled").await?;
        }

        let manifest = self.artifacts.write_manifest(&self.config.job_id).await?;
        reporter
            .report(format!("Results manifest written ({} files)", manifest.entries.len()))
            .await?;

        if let Some(ref store) = self.store {
            reporter
                .report(format!("Publishing results to {}", store.describe()))
                .await?;

            let publisher = ResultPublisher::new(store.clone(), &self.config.job_id);
            let published = publisher.publish(&self.artifacts).await;
            summary.publication_failures += published.failed.len();

            reporter
                .report(format!(
                    "Published {} files ({} failed)",
                    published.uploaded.len(),
                    published.failed.len()
                ))
                .await?;
        }

        Ok(())
    }

    /// Run MultiQC over whichever stage directories exist; failure is non-fatal
    async fn aggregate_report(&self, ran: &BTreeSet<Step>, reporter: &ProgressReporter) -> Result<(), PipelineError> {
        let mut sources = Vec::new();
        for dir in aggregate_sources(&self.config.layout, ran) {
            if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                sources.push(dir);
            }
        }
        if sources.is_empty() {
            reporter.report("Skipping MultiQC: no stage outputs to summarize").await?;
            return Ok(());
        }

        let report = aggregate_report_path(&self.config.layout);
        remove_stale(&report).await?;
        prepare_dirs(std::slice::from_ref(&self.config.layout.multiqc())).await?;
        reporter.report("Running MultiQC [report]").await?;

        let cmd = aggregate_report_command(&self.config, &sources);
        let outcome = self.executor.execute(&cmd, self.config.kill_policy).await;

        let failure = match outcome {
            Ok(o) if o.is_success() => None,
            Ok(o) => Some(o.describe()),
            Err(e) => Some(format!("{:#}", e)),
        };

        match failure {
            None if report.exists() => {
                let dest = self.artifacts.results_dir().join("multiqc");
                prepare_dirs(std::slice::from_ref(&dest)).await?;
                let target = dest.join("multiqc_report.html");
                tokio::fs::copy(&report, &target).await.map_err(|e| {
                    PipelineError::io(format!("Failed to copy {}", report.display()), e)
                })?;
                reporter.report("MultiQC report generated").await?;
            }
            None => {
                warn!(path = %report.display(), "MultiQC exited cleanly without a report");
                reporter.report("MultiQC produced no report (continuing)").await?;
            }
            Some(detail) => {
                warn!(%detail, "MultiQC failed");
                reporter
                    .report(format!("MultiQC failed (continuing): {}", detail))
                    .await?;
            }
        }

        Ok(())
    }

    async fn report_best_effort(&self, reporter: &ProgressReporter, message: impl Into<String>) {
        if let Err(e) = reporter.report(message).await {
            error!(error = %e, "Failed to write job log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{KillPolicy, ToolOutcome};
    use crate::core::selector::StepSelector;
    use crate::domain::ToolCommand;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Succeeds for every command and creates its declared writes
    #[derive(Default)]
    struct TouchExecutor {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolExecutor for TouchExecutor {
        fn name(&self) -> &str {
            "touch"
        }

        async fn execute(&self, command: &ToolCommand, _policy: Option<KillPolicy>) -> anyhow::Result<ToolOutcome> {
            self.calls.lock().unwrap().push(command.program.clone());
            for path in &command.writes {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, "ok\n")?;
            }
            Ok(ToolOutcome::success())
        }
    }

    fn qc_only(temp: &TempDir) -> PipelineConfig {
        let mut config = PipelineConfig::new(temp.path());
        config.job_id = "t1".to_string();
        config.steps = StepSelector::parse("qc");
        std::fs::create_dir_all(config.layout.raw()).unwrap();
        std::fs::write(&config.reads1, "@r\nA\n+\nI\n").unwrap();
        std::fs::write(&config.reads2, "@r\nA\n+\nI\n").unwrap();
        config
    }

    #[tokio::test]
    async fn test_skipped_stages_are_logged_in_order() {
        let temp = TempDir::new().unwrap();
        let config = qc_only(&temp);
        let controller = PipelineController::new(config, Arc::new(TouchExecutor::default()), None);

        let summary = controller.run().await.unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.completed.len(), 1);
        assert_eq!(summary.skipped.len(), 7);
        assert_eq!(summary.skipped[0], "trim");
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_init() {
        let temp = TempDir::new().unwrap();
        let mut config = qc_only(&temp);
        config.threads = 0;
        let executor = Arc::new(TouchExecutor::default());
        let controller = PipelineController::new(config, executor.clone(), None);

        assert!(controller.run().await.is_err());
        assert!(executor.calls.lock().unwrap().is_empty());
    }
}
