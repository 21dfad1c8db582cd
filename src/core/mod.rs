//! Core orchestration logic.
//!
//! This module contains:
//! - Selector: enabled-step parsing
//! - Stages: the fixed stage catalog and its wiring check
//! - Runner: single-stage execution against its contract
//! - Partition: fan-out/fan-in for the annotation stage
//! - Reporter: the append-only job log
//! - Artifacts: working directories, results tree and manifest
//! - Publisher: best-effort upload of results
//! - Monitor: job status derived from a log
//! - Orchestrator: the controller state machine

pub mod artifacts;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod partition;
pub mod publisher;
pub mod reporter;
pub mod runner;
pub mod selector;
pub mod stages;

// Re-export commonly used types
pub use artifacts::{prepare_dirs, ArtifactManager, MANIFEST_FILE};
pub use error::PipelineError;
pub use monitor::{estimate_cost, hourly_rate, JobState, JobStatus, StageState};
pub use orchestrator::PipelineController;
pub use publisher::{PublishReport, ResultPublisher};
pub use reporter::{read_log, ProgressReporter};
pub use runner::StageRunner;
pub use selector::StepSelector;
pub use stages::{build_stages, validate_wiring, TrimSummary};
