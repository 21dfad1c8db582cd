//! Configuration for metapipe runs.
//!
//! Configuration sources (highest priority first):
//! 1. Command-line flags
//! 2. Environment variables (METAPIPE_WORK_DIR, METAPIPE_REMOTE, METAPIPE_GCS_TOKEN)
//! 3. Config file (.metapipe/config.yaml)
//! 4. Defaults (./data, all steps, 16 threads, 1000 bp contigs)
//!
//! Config file discovery:
//! - Searches current directory and parents for .metapipe/config.yaml
//! - Relative paths in the config file are resolved against the directory
//!   containing `.metapipe/`

pub mod paths;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::adapters::{KillPolicy, RemoteDestination, StoreSettings};
use crate::core::error::PipelineError;
use crate::core::selector::StepSelector;

use self::paths::{WorkLayout, DEFAULT_READS_1, DEFAULT_READS_2};

/// Default parallelism hint
pub const DEFAULT_THREADS: usize = 16;

/// Default minimum contig length for the assembler
pub const DEFAULT_MIN_CONTIG_LEN: u32 = 1000;

/// Default machine type used for cost estimates
pub const DEFAULT_MACHINE_TYPE: &str = "n1-standard-16";

/// Default grace period between SIGTERM and force-kill
pub const DEFAULT_GRACE_SECONDS: u64 = 30;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Tool key -> program path overrides
    #[serde(default)]
    pub tools: HashMap<String, String>,
    #[serde(default)]
    pub references: ReferencesConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Work root (relative to the project directory)
    pub work_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReferencesConfig {
    /// Trimmomatic adapter FASTA
    pub adapters: Option<String>,
    /// Pfam-A HMM database (pressed)
    pub pfam_db: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    pub threads: Option<usize>,
    pub min_contig_len: Option<u32>,
    pub steps: Option<String>,
    pub partitions: Option<usize>,
    pub stage_timeout_seconds: Option<u64>,
    pub grace_seconds: Option<u64>,
    pub aggregate_report: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudConfig {
    pub remote: Option<String>,
    pub machine_type: Option<String>,
    pub storage_endpoint: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub work_dir: PathBuf,
    pub tools: HashMap<String, String>,
    pub adapters: Option<PathBuf>,
    pub pfam_db: Option<PathBuf>,
    pub runtime: RuntimeConfig,
    pub remote: Option<String>,
    pub machine_type: String,
    pub storage_endpoint: Option<String>,
    pub access_token: Option<String>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("data"),
            tools: HashMap::new(),
            adapters: None,
            pfam_db: None,
            runtime: RuntimeConfig::default(),
            remote: None,
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
            storage_endpoint: None,
            access_token: None,
            config_file: None,
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".metapipe").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    // Fall back to a per-user config
    dirs::config_dir()
        .map(|dir| dir.join("metapipe").join("config.yaml"))
        .filter(|path| path.exists())
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's project directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

impl ResolvedConfig {
    /// Build from a parsed config file located at `config_path`
    pub fn from_file(config: ConfigFile, config_path: &Path) -> Self {
        // Base directory is the parent of .metapipe/
        let base_dir = config_path
            .parent()
            .and_then(|p| p.parent())
            .unwrap_or(Path::new("."));

        let defaults = Self::default();

        Self {
            work_dir: config
                .paths
                .work_dir
                .as_deref()
                .map(|p| resolve_path(base_dir, p))
                .unwrap_or_else(|| base_dir.join(&defaults.work_dir)),
            tools: config.tools,
            adapters: config.references.adapters.as_deref().map(|p| resolve_path(base_dir, p)),
            pfam_db: config.references.pfam_db.as_deref().map(|p| resolve_path(base_dir, p)),
            runtime: config.runtime,
            remote: config.cloud.remote,
            machine_type: config.cloud.machine_type.unwrap_or(defaults.machine_type),
            storage_endpoint: config.cloud.storage_endpoint,
            access_token: None,
            config_file: Some(config_path.to_path_buf()),
        }
    }

    /// Apply environment variable overrides
    fn apply_env(mut self) -> Self {
        if let Ok(work_dir) = std::env::var("METAPIPE_WORK_DIR") {
            self.work_dir = PathBuf::from(work_dir);
        }
        if let Ok(remote) = std::env::var("METAPIPE_REMOTE") {
            self.remote = Some(remote);
        }
        if let Ok(token) = std::env::var("METAPIPE_GCS_TOKEN") {
            self.access_token = Some(token);
        }
        self
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let resolved = match find_config_file() {
        Some(path) => {
            let file = load_config_file(&path)?;
            ResolvedConfig::from_file(file, &path)
        }
        None => ResolvedConfig::default(),
    };

    Ok(resolved.apply_env())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Generate a time-based job id, e.g. `job-20240131-142501-1a2b3c4d`
pub fn generate_job_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("job-{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// Tool programs and reference data used to build stage commands
#[derive(Debug, Clone)]
pub struct ToolSettings {
    /// Tool key -> program overrides
    pub programs: HashMap<String, String>,

    /// Trimmomatic adapter FASTA
    pub adapters: PathBuf,

    /// Pfam-A HMM database
    pub pfam_db: PathBuf,

    /// Partitions for the domain-annotation fan-out
    pub partitions: usize,

    /// Run MultiQC at finalize
    pub aggregate_report: bool,
}

impl ToolSettings {
    /// Defaults rooted in the layout's `refs/` directory
    pub fn for_layout(layout: &WorkLayout, threads: usize) -> Self {
        Self {
            programs: HashMap::new(),
            adapters: layout.refs().join("TruSeq3-PE.fa"),
            pfam_db: layout.refs().join("Pfam-A.hmm"),
            partitions: threads,
            aggregate_report: true,
        }
    }

    /// Program to run for a tool key, honouring overrides
    pub fn program(&self, key: &str) -> String {
        self.programs
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }
}

/// Immutable parameters of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub threads: usize,
    pub min_contig_len: u32,
    pub steps: StepSelector,
    pub job_id: String,
    pub remote: Option<RemoteDestination>,
    pub store: StoreSettings,
    pub layout: WorkLayout,
    pub reads1: PathBuf,
    pub reads2: PathBuf,
    pub tools: ToolSettings,
    pub kill_policy: Option<KillPolicy>,
    pub machine_type: String,
}

impl PipelineConfig {
    /// Defaults for a work root: all steps, generated job id, no remote
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let layout = WorkLayout::new(work_dir);
        Self {
            threads: DEFAULT_THREADS,
            min_contig_len: DEFAULT_MIN_CONTIG_LEN,
            steps: StepSelector::all(),
            job_id: generate_job_id(),
            remote: None,
            store: StoreSettings::default(),
            reads1: layout.raw().join(DEFAULT_READS_1),
            reads2: layout.raw().join(DEFAULT_READS_2),
            tools: ToolSettings::for_layout(&layout, DEFAULT_THREADS),
            layout,
            kill_policy: None,
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
        }
    }

    /// Seed a run configuration from resolved file/env configuration
    pub fn from_resolved(resolved: &ResolvedConfig) -> Result<Self> {
        let mut config = Self::new(&resolved.work_dir);
        let runtime = &resolved.runtime;

        if let Some(threads) = runtime.threads {
            config.threads = threads;
            config.tools.partitions = threads;
        }
        if let Some(min_len) = runtime.min_contig_len {
            config.min_contig_len = min_len;
        }
        if let Some(ref steps) = runtime.steps {
            config.steps = StepSelector::parse(steps);
        }
        if let Some(partitions) = runtime.partitions {
            config.tools.partitions = partitions;
        }
        if let Some(aggregate) = runtime.aggregate_report {
            config.tools.aggregate_report = aggregate;
        }
        if let Some(secs) = runtime.stage_timeout_seconds {
            config.kill_policy = Some(KillPolicy {
                timeout: Duration::from_secs(secs),
                grace: Duration::from_secs(runtime.grace_seconds.unwrap_or(DEFAULT_GRACE_SECONDS)),
            });
        }
        if let Some(ref adapters) = resolved.adapters {
            config.tools.adapters = adapters.clone();
        }
        if let Some(ref pfam) = resolved.pfam_db {
            config.tools.pfam_db = pfam.clone();
        }
        config.tools.programs = resolved.tools.clone();

        if let Some(ref remote) = resolved.remote {
            config.remote = Some(
                remote
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!("Invalid remote destination: {}", e))?,
            );
        }
        config.store = StoreSettings {
            endpoint: resolved.storage_endpoint.clone(),
            access_token: resolved.access_token.clone(),
        };
        config.machine_type = resolved.machine_type.clone();

        Ok(config)
    }

    /// Reject configurations that cannot produce a meaningful run
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.threads == 0 {
            return Err(PipelineError::Config("thread count must be positive".to_string()));
        }
        if self.min_contig_len == 0 {
            return Err(PipelineError::Config("minimum contig length must be positive".to_string()));
        }
        if self.tools.partitions == 0 {
            return Err(PipelineError::Config("partition count must be positive".to_string()));
        }
        if self.job_id.trim().is_empty() {
            return Err(PipelineError::Config("job id must not be empty".to_string()));
        }
        if self.job_id.contains(['/', '\\']) || self.job_id.contains("..") {
            return Err(PipelineError::Config(format!(
                "job id '{}' must not contain path separators",
                self.job_id
            )));
        }
        Ok(())
    }

    /// Local log file for this job
    pub fn log_file(&self) -> PathBuf {
        self.layout.log_file(&self.job_id)
    }

    /// Results tree for this job
    pub fn results_dir(&self) -> PathBuf {
        self.layout.results(&self.job_id)
    }
}
