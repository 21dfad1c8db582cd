//! Command-line interface for metapipe.
//!
//! Provides commands for running the pipeline, checking job status,
//! previewing the stage plan, and showing the resolved configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use crate::adapters::{open_store, KillPolicy, ProcessExecutor};
use crate::config::paths::WorkLayout;
use crate::config::{self, PipelineConfig, DEFAULT_GRACE_SECONDS};
use crate::core::stages::{build_stages, catalog};
use crate::core::{read_log, JobStatus, PipelineController, StepSelector, MANIFEST_FILE};
use crate::domain::{Invocation, Manifest};

/// metapipe - Fault-tolerant metagenomics pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "metapipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline
    Run(RunArgs),

    /// Show the status of a job from its log
    Status {
        /// Job ID
        job_id: String,

        /// Work root holding the job's logs (defaults to config)
        #[arg(long, env = "METAPIPE_WORK_DIR")]
        work_dir: Option<PathBuf>,

        /// Print status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show which stages would run and the commands they would invoke
    Plan(RunArgs),

    /// Show resolved configuration (debug)
    Config,
}

/// Options shared by `run` and `plan`
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Parallelism passed to tools and the annotation worker bound
    #[arg(long, env = "METAPIPE_THREADS")]
    pub threads: Option<usize>,

    /// Minimum contig length for the assembler
    #[arg(long)]
    pub min_contig_len: Option<u32>,

    /// Comma-separated enabled steps, or "all"
    #[arg(long, env = "METAPIPE_STEPS")]
    pub steps: Option<String>,

    /// Job ID (generated if not provided)
    #[arg(long)]
    pub job_id: Option<String>,

    /// Remote destination: gs://bucket/prefix, file:///dir or a directory
    #[arg(long, visible_alias = "bucket", env = "METAPIPE_REMOTE")]
    pub remote: Option<String>,

    /// Work root
    #[arg(long, env = "METAPIPE_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// First raw read file
    #[arg(long)]
    pub reads1: Option<PathBuf>,

    /// Second raw read file
    #[arg(long)]
    pub reads2: Option<PathBuf>,

    /// Adapter FASTA for trimming
    #[arg(long)]
    pub adapters: Option<PathBuf>,

    /// Pfam-A HMM database
    #[arg(long)]
    pub pfam_db: Option<PathBuf>,

    /// Partitions for domain annotation (defaults to threads)
    #[arg(long)]
    pub partitions: Option<usize>,

    /// Kill a tool that runs longer than this
    #[arg(long)]
    pub stage_timeout_secs: Option<u64>,

    /// Seconds between SIGTERM and force-kill on timeout
    #[arg(long)]
    pub grace_secs: Option<u64>,

    /// Skip the MultiQC report at finalize
    #[arg(long)]
    pub no_aggregate_report: bool,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => {
                run_pipeline(&args).await
            }
            Commands::Status { job_id, work_dir, json } => {
                show_status(&job_id, work_dir, json).await
            }
            Commands::Plan(args) => {
                show_plan(&args)
            }
            Commands::Config => {
                show_config().await
            }
        }
    }
}

/// Build the run configuration: flags over env over config file over defaults
pub fn build_config(args: &RunArgs) -> Result<PipelineConfig> {
    let mut resolved = config::config()?.clone();

    if let Some(ref work_dir) = args.work_dir {
        resolved.work_dir = work_dir.clone();
    }
    if let Some(ref remote) = args.remote {
        resolved.remote = Some(remote.clone());
    }

    let mut cfg = PipelineConfig::from_resolved(&resolved)?;

    if let Some(threads) = args.threads {
        cfg.threads = threads;
        if resolved.runtime.partitions.is_none() {
            cfg.tools.partitions = threads;
        }
    }
    if let Some(partitions) = args.partitions {
        cfg.tools.partitions = partitions;
    }
    if let Some(min_len) = args.min_contig_len {
        cfg.min_contig_len = min_len;
    }
    if let Some(ref steps) = args.steps {
        cfg.steps = StepSelector::parse(steps);
    }
    if let Some(ref job_id) = args.job_id {
        cfg.job_id = job_id.clone();
    }
    if let Some(ref reads1) = args.reads1 {
        cfg.reads1 = reads1.clone();
    }
    if let Some(ref reads2) = args.reads2 {
        cfg.reads2 = reads2.clone();
    }
    if let Some(ref adapters) = args.adapters {
        cfg.tools.adapters = adapters.clone();
    }
    if let Some(ref pfam_db) = args.pfam_db {
        cfg.tools.pfam_db = pfam_db.clone();
    }
    if args.no_aggregate_report {
        cfg.tools.aggregate_report = false;
    }

    let grace = args
        .grace_secs
        .map(Duration::from_secs)
        .or(cfg.kill_policy.map(|p| p.grace))
        .unwrap_or(Duration::from_secs(DEFAULT_GRACE_SECONDS));
    if let Some(secs) = args.stage_timeout_secs {
        cfg.kill_policy = Some(KillPolicy {
            timeout: Duration::from_secs(secs),
            grace,
        });
    } else if let Some(ref mut policy) = cfg.kill_policy {
        policy.grace = grace;
    }

    Ok(cfg)
}

/// Run the pipeline and exit non-zero on failure
async fn run_pipeline(args: &RunArgs) -> Result<()> {
    let cfg = build_config(args)?;
    let job_id = cfg.job_id.clone();
    let log_file = cfg.log_file();

    let store = cfg.remote.as_ref().map(|dest| open_store(dest, &cfg.store));
    let controller = PipelineController::new(cfg, Arc::new(ProcessExecutor::new()), store);

    eprintln!("Job {} (log: {})", job_id, log_file.display());
    let summary = controller.run().await?;

    if summary.publication_failures > 0 {
        eprintln!(
            "[Job {}: {} remote upload(s) failed; local results are complete]",
            job_id, summary.publication_failures
        );
    }

    if summary.is_success() {
        println!("DONE");
        eprintln!(
            "\n[Job {} completed: {} stage(s) run, {} skipped, {:.1} min]",
            job_id,
            summary.completed.len(),
            summary.skipped.len(),
            summary.elapsed_secs() / 60.0
        );
        Ok(())
    } else {
        eprintln!(
            "\n[Job {} failed at {}]",
            job_id,
            summary.failed_stage().unwrap_or("init")
        );
        std::process::exit(summary.exit_code());
    }
}

/// Show the status of a job
async fn show_status(job_id: &str, work_dir: Option<PathBuf>, json: bool) -> Result<()> {
    let cfg = config::config()?;
    let work_dir = work_dir.unwrap_or_else(|| cfg.work_dir.clone());
    let layout = WorkLayout::new(&work_dir);
    let log_file = layout.log_file(job_id);

    if !log_file.exists() {
        anyhow::bail!("No log found for job {} at {}", job_id, log_file.display());
    }

    let events = read_log(job_id, &log_file).await?;
    let stages = catalog(&PipelineConfig::new(&work_dir));
    let status = JobStatus::from_events(job_id, &events, &stages, &cfg.machine_type, Utc::now());

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Job ID:   {}", status.job_id);
    println!("State:    {:?}", status.state);
    println!("Progress: {}%", status.progress);
    if let Some(ref current) = status.current_stage {
        println!("Current:  {}", current);
    }
    if let Some(started) = status.started_at {
        println!("Started:  {}", started);
    }
    println!(
        "Elapsed:  {:.1} min (est. ${:.2} on {})",
        status.elapsed_secs / 60.0,
        status.estimated_cost,
        cfg.machine_type
    );
    println!("\nStages:");
    for stage in &status.stages {
        println!("  {:<16} {:<12} {:?}", stage.id, stage.tool, stage.state);
    }

    let manifest_path = layout.results(job_id).join(MANIFEST_FILE);
    if manifest_path.exists() {
        let content = tokio::fs::read_to_string(&manifest_path)
            .await
            .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", manifest_path.display()))?;

        println!("\nResults ({} files):", manifest.entries.len());
        for entry in &manifest.entries {
            println!("  {:<18} {}", format!("{:?}", entry.category), entry.path);
        }
    }

    Ok(())
}

/// Print the stage plan without running anything
fn show_plan(args: &RunArgs) -> Result<()> {
    let cfg = build_config(args)?;
    cfg.validate()?;

    println!("Job:   {}", cfg.job_id);
    println!("Steps: {}", cfg.steps.to_list());
    println!();

    for stage in build_stages(&cfg) {
        let enabled = cfg.steps.allows_all(&stage.gates);
        println!(
            "[{}] {} ({})",
            if enabled { "run " } else { "skip" },
            stage.id,
            stage.tool
        );
        if !enabled {
            continue;
        }
        for invocation in &stage.invocations {
            match invocation {
                Invocation::Single(cmd) => println!("    {}", cmd.display_line()),
                Invocation::Partitioned(plan) => println!(
                    "    {}  (x{} partitions, {} workers)",
                    plan.template.display_line(),
                    plan.partitions,
                    plan.workers
                ),
            }
        }
    }

    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("metapipe configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Work dir: {}", cfg.work_dir.display());
    println!(
        "  Adapters: {}",
        cfg.adapters.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(default)".to_string())
    );
    println!(
        "  Pfam DB:  {}",
        cfg.pfam_db.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(default)".to_string())
    );
    println!();
    println!("Tool overrides:");
    if cfg.tools.is_empty() {
        println!("  (none)");
    } else {
        let mut tools: Vec<_> = cfg.tools.iter().collect();
        tools.sort();
        for (k, v) in tools {
            println!("  {}: {}", k, v);
        }
    }
    println!();
    println!("Runtime:");
    println!("  Steps:      {}", cfg.runtime.steps.as_deref().unwrap_or("all"));
    println!(
        "  Threads:    {}",
        cfg.runtime.threads.unwrap_or(config::DEFAULT_THREADS)
    );
    println!(
        "  Timeout:    {}",
        cfg.runtime
            .stage_timeout_seconds
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "none".to_string())
    );
    println!();
    println!("Cloud:");
    println!("  Remote:       {}", cfg.remote.as_deref().unwrap_or("(none)"));
    println!("  Machine type: {}", cfg.machine_type);
    println!(
        "  Access token: {}",
        if cfg.access_token.is_some() { "set" } else { "not set" }
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "metapipe",
            "run",
            "--threads",
            "8",
            "--steps",
            "qc,trim",
            "--bucket",
            "gs://bucket/runs",
            "--no-aggregate-report",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.threads, Some(8));
        assert_eq!(args.steps.as_deref(), Some("qc,trim"));
        assert_eq!(args.remote.as_deref(), Some("gs://bucket/runs"));
        assert!(args.no_aggregate_report);
    }

    #[test]
    fn test_status_requires_job_id() {
        assert!(Cli::try_parse_from(["metapipe", "status"]).is_err());
        assert!(Cli::try_parse_from(["metapipe", "status", "job-1", "--json"]).is_ok());
    }
}
