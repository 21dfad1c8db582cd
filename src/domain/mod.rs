//! Domain types for the metapipe orchestrator.
//!
//! This module contains the core data structures:
//! - Stage: stage contracts, commands and results
//! - Events: log lines written by the progress reporter
//! - Run: controller state machine and run summaries
//! - Artifact: results-tree classification and manifest

pub mod artifact;
pub mod events;
pub mod run;
pub mod stage;

// Re-export commonly used types
pub use artifact::{Manifest, ManifestEntry, ResultCategory};
pub use events::{LogEvent, DONE_MARKER};
pub use run::{ControllerState, RunOutcome, RunSummary};
pub use stage::{
    CollectRule, Invocation, PartitionPlan, StageDescriptor, StageReport, StageResult, Step, ToolCommand,
    PART_INPUT, PART_OUTPUT,
};
