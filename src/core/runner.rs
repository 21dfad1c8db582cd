//! Stage runner: executes one stage against its contract.
//!
//! Inputs are checked before anything runs, outputs left by an earlier run are
//! removed, invocations run in order with no retry, and declared outputs are
//! verified after a clean exit.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, instrument};

use crate::adapters::{KillPolicy, ToolExecutor};
use crate::domain::{Invocation, StageDescriptor, StageResult};

use super::artifacts::{matching_files, remove_stale};
use super::error::PipelineError;
use super::partition::run_partitioned;

/// Runs stages through a tool executor
pub struct StageRunner {
    executor: Arc<dyn ToolExecutor>,
    kill_policy: Option<KillPolicy>,
}

impl StageRunner {
    pub fn new(executor: Arc<dyn ToolExecutor>, kill_policy: Option<KillPolicy>) -> Self {
        Self {
            executor,
            kill_policy,
        }
    }

    /// Check that every input of a stage exists
    pub async fn check_inputs(stage: &StageDescriptor) -> Result<(), PipelineError> {
        for input in &stage.inputs {
            if !exists(input).await {
                return Err(PipelineError::Precondition {
                    stage: stage.id.clone(),
                    path: input.clone(),
                });
            }
        }
        for pattern in &stage.input_patterns {
            if matching_files(pattern)?.is_empty() {
                return Err(PipelineError::Precondition {
                    stage: stage.id.clone(),
                    path: PathBuf::from(pattern),
                });
            }
        }
        Ok(())
    }

    /// Remove whatever an earlier run left at the paths this stage writes,
    /// so the output check only sees files produced by this run
    pub async fn clear_outputs(stage: &StageDescriptor) -> Result<usize, PipelineError> {
        let mut targets: BTreeSet<PathBuf> = stage.outputs.iter().cloned().collect();
        for invocation in &stage.invocations {
            match invocation {
                Invocation::Single(cmd) => targets.extend(cmd.writes.iter().cloned()),
                Invocation::Partitioned(plan) => {
                    targets.insert(plan.merged_output.clone());
                }
            }
        }
        for pattern in &stage.output_patterns {
            targets.extend(matching_files(pattern)?);
        }

        let mut removed = 0;
        for target in targets.iter().filter(|t| !stage.inputs.contains(*t)) {
            if remove_stale(target).await? {
                debug!(path = %target.display(), "Removed stale output");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Execute a stage; any error is fatal to the run
    #[instrument(skip(self, stage), fields(stage = %stage.id))]
    pub async fn run(&self, stage: &StageDescriptor) -> Result<StageResult, PipelineError> {
        Self::check_inputs(stage).await?;
        Self::clear_outputs(stage).await?;

        let started_at = Utc::now();

        for invocation in &stage.invocations {
            match invocation {
                Invocation::Single(cmd) => {
                    debug!(command = %cmd.display_line(), "Invoking tool");

                    let outcome = self
                        .executor
                        .execute(cmd, self.kill_policy)
                        .await
                        .map_err(|e| PipelineError::ToolExecution {
                            stage: stage.id.clone(),
                            tool: cmd.program.clone(),
                            exit_code: None,
                            detail: format!("{:#}", e),
                        })?;

                    if !outcome.is_success() {
                        error!(tool = %cmd.program, detail = %outcome.describe(), "Tool failed");
                        return Err(PipelineError::ToolExecution {
                            stage: stage.id.clone(),
                            tool: cmd.program.clone(),
                            exit_code: outcome.exit_code,
                            detail: outcome.describe(),
                        });
                    }
                }
                Invocation::Partitioned(plan) => {
                    let records =
                        run_partitioned(self.executor.as_ref(), plan, &stage.id, self.kill_policy).await?;
                    debug!(records, merged = %plan.merged_output.display(), "Merged partition outputs");
                }
            }
        }

        let mut outputs_produced = BTreeSet::new();
        for output in &stage.outputs {
            if !exists(output).await {
                return Err(PipelineError::ContractViolation {
                    stage: stage.id.clone(),
                    path: output.clone(),
                });
            }
            outputs_produced.insert(output.clone());
        }
        for pattern in &stage.output_patterns {
            let matches = matching_files(pattern)?;
            if matches.is_empty() {
                return Err(PipelineError::ContractViolation {
                    stage: stage.id.clone(),
                    path: PathBuf::from(pattern),
                });
            }
            outputs_produced.extend(matches);
        }

        Ok(StageResult {
            stage_id: stage.id.clone(),
            step: stage.step,
            started_at,
            finished_at: Utc::now(),
            exit_status: 0,
            outputs_produced,
        })
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
