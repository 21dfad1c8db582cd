//! Error taxonomy for pipeline execution.
//!
//! Every variant except [`PipelineError::Publication`] is fatal: it halts the
//! pipeline and yields a non-zero exit.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while running the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required input was absent before the stage started
    #[error("stage '{stage}': missing input {}", path.display())]
    Precondition { stage: String, path: PathBuf },

    /// An external tool failed to start, exited non-zero or timed out
    #[error("stage '{stage}': {tool} failed ({detail})")]
    ToolExecution {
        stage: String,
        tool: String,
        exit_code: Option<i32>,
        detail: String,
    },

    /// The tool exited zero but a declared output is missing
    #[error("stage '{stage}': tool reported success but did not produce {}", path.display())]
    ContractViolation { stage: String, path: PathBuf },

    /// Remote log mirroring or result upload failed
    #[error("publication to '{target}' failed: {reason}")]
    Publication { target: String, reason: String },

    /// Local filesystem failure
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration, rejected before the run starts
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether this error halts the pipeline
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::Publication { .. })
    }

    /// Stage responsible for the error, if any
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::Precondition { stage, .. }
            | PipelineError::ToolExecution { stage, .. }
            | PipelineError::ContractViolation { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Short category name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Precondition { .. } => "precondition",
            PipelineError::ToolExecution { .. } => "tool-execution",
            PipelineError::ContractViolation { .. } => "contract-violation",
            PipelineError::Publication { .. } => "publication",
            PipelineError::Io { .. } => "io",
            PipelineError::Config(_) => "config",
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }
}
