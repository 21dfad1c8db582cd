//! Controller state machine and run summaries.

use chrono::{DateTime, Utc};

use super::stage::StageResult;
use crate::core::error::PipelineError;

/// States of the pipeline controller
#[derive(Debug)]
pub enum ControllerState {
    /// Configuration accepted, directories not yet prepared
    Init,

    /// About to enter the stage at this index of the fixed order
    Stage(usize),

    /// All stages done or skipped; aggregate report and publication pending
    Finalize,

    /// Every attempted stage succeeded or was skipped
    Done,

    /// A fatal error halted the run (absorbing)
    Failed {
        stage: Option<String>,
        error: PipelineError,
    },
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::Done | ControllerState::Failed { .. })
    }

    pub fn label(&self) -> String {
        match self {
            ControllerState::Init => "init".to_string(),
            ControllerState::Stage(k) => format!("stage_{}", k + 1),
            ControllerState::Finalize => "finalize".to_string(),
            ControllerState::Done => "done".to_string(),
            ControllerState::Failed { .. } => "failed".to_string(),
        }
    }
}

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Failed {
        stage: Option<String>,
        error: PipelineError,
    },
}

/// Record of one pipeline run, returned by the controller
#[derive(Debug)]
pub struct RunSummary {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Stages executed successfully, in order
    pub completed: Vec<StageResult>,

    /// Ids of stages skipped by the step selector, in order
    pub skipped: Vec<String>,

    /// Upload failures from log mirroring and publication (never fatal)
    pub publication_failures: usize,

    pub outcome: RunOutcome,
}

impl RunSummary {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            completed: Vec::new(),
            skipped: Vec::new(),
            publication_failures: 0,
            outcome: RunOutcome::Completed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed)
    }

    /// Process exit code for this run
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn failed_stage(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Failed { stage, .. } => stage.as_deref(),
            RunOutcome::Completed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_summary_exit_codes() {
        let mut summary = RunSummary::new("t1");
        assert!(summary.is_success());
        assert_eq!(summary.exit_code(), 0);

        summary.outcome = RunOutcome::Failed {
            stage: Some("trim".to_string()),
            error: PipelineError::Precondition {
                stage: "trim".to_string(),
                path: PathBuf::from("/w/raw/CV_1.fq.gz"),
            },
        };
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.failed_stage(), Some("trim"));
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(ControllerState::Stage(0).label(), "stage_1");
        assert!(ControllerState::Done.is_terminal());
        assert!(!ControllerState::Finalize.is_terminal());
    }
}
