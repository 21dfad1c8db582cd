//! Stage contracts for the fixed-order pipeline.
//!
//! A [`StageDescriptor`] says everything the controller needs to know about one
//! step: which selector steps gate it, what must exist before it starts, which
//! external commands it runs, what it promises to leave behind, and which of
//! those files belong in the results tree.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The selectable pipeline steps, in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    Qc,
    Trim,
    Assemble,
    GenePredict,
    DomainAnnotate,
    AlignAndBin,
    QualityAssess,
}

impl Step {
    /// Every step in execution order
    pub const ALL: [Step; 7] = [
        Step::Qc,
        Step::Trim,
        Step::Assemble,
        Step::GenePredict,
        Step::DomainAnnotate,
        Step::AlignAndBin,
        Step::QualityAssess,
    ];

    /// Name used on the command line and in the enabled-steps list
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Qc => "qc",
            Step::Trim => "trim",
            Step::Assemble => "assemble",
            Step::GenePredict => "genePredict",
            Step::DomainAnnotate => "domainAnnotate",
            Step::AlignAndBin => "alignAndBin",
            Step::QualityAssess => "qualityAssess",
        }
    }

    /// Step key used by the original tool-named configuration
    pub fn tool_alias(&self) -> &'static str {
        match self {
            Step::Qc => "fastqc",
            Step::Trim => "trimmomatic",
            Step::Assemble => "megahit",
            Step::GenePredict => "prodigal",
            Step::DomainAnnotate => "hmmscan",
            Step::AlignAndBin => "binning",
            Step::QualityAssess => "checkm",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("unknown step '{}'", s))
    }
}

/// One external process invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    /// Program name or path
    pub program: String,

    /// Arguments, passed verbatim (no shell)
    pub args: Vec<String>,

    /// Files this invocation writes; informational, the stage outputs are the contract
    #[serde(default)]
    pub writes: Vec<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn writes(mut self, path: impl Into<PathBuf>) -> Self {
        self.writes.push(path.into());
        self
    }

    /// Shell-like rendering for logs and dry runs
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(char::is_whitespace) {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Placeholder replaced with a partition's input path
pub const PART_INPUT: &str = "{input}";

/// Placeholder replaced with a partition's output path
pub const PART_OUTPUT: &str = "{output}";

/// Fan-out/fan-in execution of one tool over a partitioned FASTA file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    /// FASTA file to split
    pub input: PathBuf,

    /// Directory receiving the partition inputs and outputs
    pub parts_dir: PathBuf,

    /// Number of partitions to cut the input into
    pub partitions: usize,

    /// Maximum number of partition commands in flight
    pub workers: usize,

    /// Command with `{input}` / `{output}` placeholders
    pub template: ToolCommand,

    /// Extension given to each partition's output file
    pub output_extension: String,

    /// Where the merged output lands
    pub merged_output: PathBuf,
}

impl PartitionPlan {
    pub fn part_input(&self, index: usize) -> PathBuf {
        self.parts_dir.join(format!("part_{:03}.faa", index))
    }

    pub fn part_output(&self, index: usize) -> PathBuf {
        self.parts_dir
            .join(format!("part_{:03}.{}", index, self.output_extension))
    }

    /// Instantiate the template for one partition
    pub fn command_for(&self, index: usize) -> ToolCommand {
        let input = self.part_input(index).to_string_lossy().into_owned();
        let output = self.part_output(index).to_string_lossy().into_owned();
        let args = self
            .template
            .args
            .iter()
            .map(|arg| arg.replace(PART_INPUT, &input).replace(PART_OUTPUT, &output))
            .collect();

        ToolCommand {
            program: self.template.program.clone(),
            args,
            writes: vec![self.part_output(index)],
        }
    }
}

/// How a stage runs its tool(s)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    Single(ToolCommand),
    Partitioned(PartitionPlan),
}

impl Invocation {
    pub fn program(&self) -> &str {
        match self {
            Invocation::Single(cmd) => &cmd.program,
            Invocation::Partitioned(plan) => &plan.template.program,
        }
    }
}

/// Which files of a stage are copied into the results tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectRule {
    /// Copy one file into `dest` (relative to the results directory)
    File { source: PathBuf, dest: PathBuf },

    /// Copy every file matching a glob pattern into `dest`
    Glob { pattern: String, dest: PathBuf },
}

/// Extra log output produced after a stage succeeds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageReport {
    /// Read survival from a Trimmomatic `-summary` file
    TrimSummary(PathBuf),
}

/// Uniform description of one pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Unique id within the pipeline
    pub id: String,

    /// Step this stage belongs to
    pub step: Step,

    /// Steps that must all be enabled for the stage to run
    pub gates: Vec<Step>,

    /// Human-readable tool label used in log lines
    pub tool: String,

    /// Artifacts that must exist before the stage starts
    pub inputs: Vec<PathBuf>,

    /// Glob patterns that must each match at least one file before the stage starts
    pub input_patterns: Vec<String>,

    /// Artifacts the stage promises to leave behind
    pub outputs: Vec<PathBuf>,

    /// Glob patterns the stage promises to match at least one file each
    pub output_patterns: Vec<String>,

    /// Directories created before execution
    pub work_dirs: Vec<PathBuf>,

    /// Tool invocations, run in order
    pub invocations: Vec<Invocation>,

    /// Results-tree collection rules
    pub collect: Vec<CollectRule>,

    /// Reported after the stage completes
    pub report: Option<StageReport>,
}

impl StageDescriptor {
    pub fn new(id: impl Into<String>, step: Step, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step,
            gates: vec![step],
            tool: tool.into(),
            inputs: Vec::new(),
            input_patterns: Vec::new(),
            outputs: Vec::new(),
            output_patterns: Vec::new(),
            work_dirs: Vec::new(),
            invocations: Vec::new(),
            collect: Vec::new(),
            report: None,
        }
    }
}

/// Outcome of one successfully executed stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_id: String,
    pub step: Step,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_status: i32,
    pub outputs_produced: BTreeSet<PathBuf>,
}

impl StageResult {
    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}
