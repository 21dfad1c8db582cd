//! metapipe - Fault-tolerant metagenomics pipeline orchestrator
//!
//! Runs a fixed sequence of external bioinformatics tools over paired short
//! reads, collects their outputs into a results tree, and optionally
//! publishes the results and the job log to remote object storage.
//!
//! # Architecture
//!
//! The system is built around an explicit controller state machine:
//! - Every stage has a contract: inputs checked before, outputs checked after
//! - Disabled stages are skipped and logged, never invoked
//! - The first fatal error halts the run; remote uploads are best-effort
//! - The append-only job log is the operator record and drives `status`
//!
//! # Modules
//!
//! - `adapters`: External system integrations (processes, object storage)
//! - `core`: Orchestration logic (controller, runner, reporter, artifacts)
//! - `domain`: Data structures (stages, log events, run summaries, manifest)
//! - `config`: Config file, environment and work-directory layout
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run QC and trimming only
//! metapipe run --work-dir ./data --steps qc,trim --job-id sample-01
//!
//! # Check job status
//! metapipe status sample-01
//!
//! # Preview stages and commands
//! metapipe plan --steps assemble,genePredict
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::config::PipelineConfig;
pub use crate::core::{PipelineController, PipelineError, StepSelector};
pub use crate::domain::{LogEvent, RunOutcome, RunSummary, StageDescriptor, Step};
