//! The fixed stage catalog.
//!
//! Stages are built from an immutable [`PipelineConfig`] in execution order.
//! Every path comes from the work layout, so a stage's inputs are either raw
//! inputs, reference data, or outputs of an earlier stage.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::paths::WorkLayout;
use crate::config::PipelineConfig;
use crate::domain::{
    CollectRule, Invocation, PartitionPlan, StageDescriptor, StageReport, Step, ToolCommand, PART_INPUT,
    PART_OUTPUT,
};

/// Id of the QC pass over trimmed reads
pub const QC_TRIMMED_ID: &str = "qc-trimmed";

const READ_SUFFIXES: [&str; 4] = [".fastq.gz", ".fq.gz", ".fastq", ".fq"];

/// Basename FastQC gives its reports for a read file
pub fn fastqc_stem(reads: &Path) -> String {
    let name = reads
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    READ_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .map(str::to_string)
        .unwrap_or(name)
}

/// Trimmomatic output files for one run
pub struct TrimmedReads {
    pub r1_paired: PathBuf,
    pub r1_unpaired: PathBuf,
    pub r2_paired: PathBuf,
    pub r2_unpaired: PathBuf,
    pub summary: PathBuf,
}

impl TrimmedReads {
    pub fn in_layout(layout: &WorkLayout) -> Self {
        let dir = layout.trimmed();
        Self {
            r1_paired: dir.join("R1_paired.fq.gz"),
            r1_unpaired: dir.join("R1_unpaired.fq.gz"),
            r2_paired: dir.join("R2_paired.fq.gz"),
            r2_unpaired: dir.join("R2_unpaired.fq.gz"),
            summary: dir.join("trim_summary.txt"),
        }
    }
}

/// Counts from a Trimmomatic `-summary` file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimSummary {
    pub input_pairs: u64,
    pub both_surviving: u64,
    pub forward_only: u64,
    pub reverse_only: u64,
    pub dropped: u64,
}

impl TrimSummary {
    /// Parse `Key: value` lines; `None` unless every count is present
    pub fn parse(content: &str) -> Option<Self> {
        let mut input_pairs = None;
        let mut both_surviving = None;
        let mut forward_only = None;
        let mut reverse_only = None;
        let mut dropped = None;

        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let Ok(value) = value.trim().parse::<u64>() else {
                continue;
            };
            match key.trim() {
                "Input Read Pairs" => input_pairs = Some(value),
                "Both Surviving Reads" => both_surviving = Some(value),
                "Forward Only Surviving Reads" => forward_only = Some(value),
                "Reverse Only Surviving Reads" => reverse_only = Some(value),
                "Dropped Reads" => dropped = Some(value),
                _ => {}
            }
        }

        Some(Self {
            input_pairs: input_pairs?,
            both_surviving: both_surviving?,
            forward_only: forward_only?,
            reverse_only: reverse_only?,
            dropped: dropped?,
        })
    }

    /// Percentage of input pairs where both mates survived
    pub fn survival_rate(&self) -> f64 {
        if self.input_pairs == 0 {
            return 0.0;
        }
        self.both_surviving as f64 * 100.0 / self.input_pairs as f64
    }
}

fn fastqc_stage(
    id: &str,
    gates: Vec<Step>,
    config: &PipelineConfig,
    reads: [&Path; 2],
    out_dir: PathBuf,
    results_dest: &str,
) -> StageDescriptor {
    let mut stage = StageDescriptor::new(id, Step::Qc, "FastQC");
    stage.gates = gates;
    stage.inputs = reads.iter().map(|p| p.to_path_buf()).collect();
    stage.work_dirs = vec![out_dir.clone()];

    let mut cmd = ToolCommand::new(config.tools.program("fastqc"))
        .arg("-t")
        .arg(config.threads.to_string())
        .arg("-o")
        .path_arg(&out_dir);

    for read in reads {
        let stem = fastqc_stem(read);
        let html = out_dir.join(format!("{}_fastqc.html", stem));
        let zip = out_dir.join(format!("{}_fastqc.zip", stem));
        cmd = cmd.path_arg(read).writes(&html).writes(&zip);
        for report in [html, zip] {
            stage.collect.push(CollectRule::File {
                source: report.clone(),
                dest: PathBuf::from(results_dest),
            });
            stage.outputs.push(report);
        }
    }

    stage.invocations = vec![Invocation::Single(cmd)];
    stage
}

fn trim_stage(config: &PipelineConfig) -> StageDescriptor {
    let layout = &config.layout;
    let trimmed = TrimmedReads::in_layout(layout);
    let adapters = &config.tools.adapters;

    let mut stage = StageDescriptor::new("trim", Step::Trim, "Trimmomatic");
    stage.inputs = vec![config.reads1.clone(), config.reads2.clone(), adapters.clone()];
    stage.work_dirs = vec![layout.trimmed()];

    let cmd = ToolCommand::new(config.tools.program("trimmomatic"))
        .arg("PE")
        .arg("-threads")
        .arg(config.threads.to_string())
        .arg("-phred33")
        .arg("-summary")
        .path_arg(&trimmed.summary)
        .path_arg(&config.reads1)
        .path_arg(&config.reads2)
        .path_arg(&trimmed.r1_paired)
        .path_arg(&trimmed.r1_unpaired)
        .path_arg(&trimmed.r2_paired)
        .path_arg(&trimmed.r2_unpaired)
        .arg(format!("ILLUMINACLIP:{}:2:30:10", adapters.display()))
        .args(["LEADING:3", "TRAILING:3", "SLIDINGWINDOW:4:15", "MINLEN:36"])
        .writes(&trimmed.r1_paired)
        .writes(&trimmed.r1_unpaired)
        .writes(&trimmed.r2_paired)
        .writes(&trimmed.r2_unpaired)
        .writes(&trimmed.summary);

    stage.invocations = vec![Invocation::Single(cmd)];
    stage.outputs = vec![
        trimmed.r1_paired,
        trimmed.r2_paired,
        trimmed.summary.clone(),
    ];
    stage.collect = vec![CollectRule::File {
        source: trimmed.summary.clone(),
        dest: PathBuf::from("trim"),
    }];
    stage.report = Some(StageReport::TrimSummary(trimmed.summary));
    stage
}

fn assemble_stage(config: &PipelineConfig) -> StageDescriptor {
    let layout = &config.layout;
    let trimmed = TrimmedReads::in_layout(layout);
    let out_dir = layout.megahit();
    let contigs = contigs_path(layout);

    let mut stage = StageDescriptor::new("assemble", Step::Assemble, "MEGAHIT");
    stage.inputs = vec![trimmed.r1_paired.clone(), trimmed.r2_paired.clone()];
    // MEGAHIT refuses an existing output directory without -f and creates it itself
    stage.work_dirs = vec![layout.assembly()];

    let cmd = ToolCommand::new(config.tools.program("megahit"))
        .arg("-1")
        .path_arg(&trimmed.r1_paired)
        .arg("-2")
        .path_arg(&trimmed.r2_paired)
        .arg("-t")
        .arg(config.threads.to_string())
        .arg("--min-contig-len")
        .arg(config.min_contig_len.to_string())
        .arg("-f")
        .arg("-o")
        .path_arg(&out_dir)
        .writes(&contigs);

    stage.invocations = vec![Invocation::Single(cmd)];
    stage.outputs = vec![contigs.clone()];
    stage.collect = vec![CollectRule::File {
        source: contigs,
        dest: PathBuf::from("assembly"),
    }];
    stage
}

/// Contigs written by the assembler
pub fn contigs_path(layout: &WorkLayout) -> PathBuf {
    layout.megahit().join("final.contigs.fa")
}

/// Protein translations written by the gene predictor
pub fn proteins_path(layout: &WorkLayout) -> PathBuf {
    layout.genes().join("proteins.faa")
}

fn gene_predict_stage(config: &PipelineConfig) -> StageDescriptor {
    let layout = &config.layout;
    let contigs = contigs_path(layout);
    let proteins = proteins_path(layout);
    let genes = layout.genes().join("genes.fna");
    let gff = layout.genes().join("genes.gff");

    let mut stage = StageDescriptor::new("genePredict", Step::GenePredict, "Prodigal");
    stage.inputs = vec![contigs.clone()];
    stage.work_dirs = vec![layout.genes()];

    let cmd = ToolCommand::new(config.tools.program("prodigal"))
        .arg("-i")
        .path_arg(&contigs)
        .arg("-a")
        .path_arg(&proteins)
        .arg("-d")
        .path_arg(&genes)
        .arg("-o")
        .path_arg(&gff)
        .args(["-f", "gff", "-p", "meta"])
        .writes(&proteins)
        .writes(&genes)
        .writes(&gff);

    stage.invocations = vec![Invocation::Single(cmd)];
    stage.outputs = vec![proteins.clone(), genes.clone(), gff.clone()];
    stage.collect = [proteins, genes, gff]
        .into_iter()
        .map(|source| CollectRule::File {
            source,
            dest: PathBuf::from("genes"),
        })
        .collect();
    stage
}

/// Merged Pfam domain table
pub fn pfam_hits_path(layout: &WorkLayout) -> PathBuf {
    layout.annotation().join("pfam_hits.domtblout")
}

fn domain_annotate_stage(config: &PipelineConfig) -> StageDescriptor {
    let layout = &config.layout;
    let proteins = proteins_path(layout);
    let merged = pfam_hits_path(layout);
    let pfam_db = &config.tools.pfam_db;

    let mut stage = StageDescriptor::new("domainAnnotate", Step::DomainAnnotate, "HMMscan");
    stage.inputs = vec![proteins.clone(), pfam_db.clone()];
    stage.work_dirs = vec![layout.annotation()];

    let template = ToolCommand::new(config.tools.program("hmmscan"))
        .args(["--cpu", "1", "--domtblout", PART_OUTPUT, "-o", "/dev/null"])
        .path_arg(pfam_db)
        .arg(PART_INPUT);

    stage.invocations = vec![Invocation::Partitioned(PartitionPlan {
        input: proteins,
        parts_dir: layout.annotation_parts(),
        partitions: config.tools.partitions,
        workers: config.threads,
        template,
        output_extension: "domtblout".to_string(),
        merged_output: merged.clone(),
    })];
    stage.outputs = vec![merged.clone()];
    stage.collect = vec![CollectRule::File {
        source: merged,
        dest: PathBuf::from("annotation"),
    }];
    stage
}

/// Bins written by MetaBAT2
pub fn bins_pattern(layout: &WorkLayout) -> String {
    format!("{}/bin.*.fa", layout.bins().display())
}

fn align_and_bin_stage(config: &PipelineConfig) -> StageDescriptor {
    let layout = &config.layout;
    let trimmed = TrimmedReads::in_layout(layout);
    let contigs = contigs_path(layout);
    let binning = layout.binning();
    let index = binning.join("contigs_idx");
    let sam = binning.join("aln.sam");
    let bam = binning.join("aln.sorted.bam");
    let bai = binning.join("aln.sorted.bam.bai");
    let depth = binning.join("depth.txt");
    let bins = layout.bins();
    let threads = config.threads.to_string();

    let mut stage = StageDescriptor::new("alignAndBin", Step::AlignAndBin, "MetaBAT2");
    stage.inputs = vec![contigs.clone(), trimmed.r1_paired.clone(), trimmed.r2_paired.clone()];
    stage.work_dirs = vec![binning.clone(), bins.clone()];

    let samtools = config.tools.program("samtools");
    stage.invocations = vec![
        ToolCommand::new(config.tools.program("bowtie2-build"))
            .arg("--threads")
            .arg(&threads)
            .path_arg(&contigs)
            .path_arg(&index),
        ToolCommand::new(config.tools.program("bowtie2"))
            .arg("-x")
            .path_arg(&index)
            .arg("-1")
            .path_arg(&trimmed.r1_paired)
            .arg("-2")
            .path_arg(&trimmed.r2_paired)
            .arg("-p")
            .arg(&threads)
            .arg("-S")
            .path_arg(&sam)
            .writes(&sam),
        ToolCommand::new(samtools.clone())
            .arg("sort")
            .arg("-@")
            .arg(&threads)
            .arg("-o")
            .path_arg(&bam)
            .path_arg(&sam)
            .writes(&bam),
        ToolCommand::new(samtools)
            .arg("index")
            .path_arg(&bam)
            .writes(&bai),
        ToolCommand::new(config.tools.program("jgi_summarize_bam_contig_depths"))
            .arg("--outputDepth")
            .path_arg(&depth)
            .path_arg(&bam)
            .writes(&depth),
        ToolCommand::new(config.tools.program("metabat2"))
            .arg("-i")
            .path_arg(&contigs)
            .arg("-a")
            .path_arg(&depth)
            .arg("-o")
            .path_arg(&bins.join("bin"))
            .arg("-t")
            .arg(&threads),
    ]
    .into_iter()
    .map(Invocation::Single)
    .collect();

    // MetaBAT2 may exit cleanly without binning anything
    stage.outputs = vec![bam, bai, depth];
    stage.output_patterns = vec![bins_pattern(layout)];
    stage.collect = vec![CollectRule::Glob {
        pattern: bins_pattern(layout),
        dest: PathBuf::from("bins"),
    }];
    stage
}

fn quality_assess_stage(config: &PipelineConfig) -> StageDescriptor {
    let layout = &config.layout;
    let bins = layout.bins();
    let report = layout.checkm().join("checkm_report.tsv");

    let mut stage = StageDescriptor::new("qualityAssess", Step::QualityAssess, "CheckM");
    stage.input_patterns = vec![bins_pattern(layout)];
    stage.work_dirs = vec![layout.checkm()];

    let cmd = ToolCommand::new(config.tools.program("checkm"))
        .args(["lineage_wf", "-x", "fa", "-t"])
        .arg(config.threads.to_string())
        .arg("--tab_table")
        .arg("-f")
        .path_arg(&report)
        .path_arg(&bins)
        .path_arg(&layout.checkm().join("lineage"))
        .writes(&report);

    stage.invocations = vec![Invocation::Single(cmd)];
    stage.outputs = vec![report.clone()];
    stage.collect = vec![CollectRule::File {
        source: report,
        dest: PathBuf::from("checkm"),
    }];
    stage
}

/// Build every stage in execution order
pub fn build_stages(config: &PipelineConfig) -> Vec<StageDescriptor> {
    let layout = &config.layout;
    let trimmed = TrimmedReads::in_layout(layout);

    vec![
        fastqc_stage(
            "qc",
            vec![Step::Qc],
            config,
            [config.reads1.as_path(), config.reads2.as_path()],
            layout.qc_raw(),
            "qc/raw",
        ),
        trim_stage(config),
        fastqc_stage(
            QC_TRIMMED_ID,
            vec![Step::Qc, Step::Trim],
            config,
            [trimmed.r1_paired.as_path(), trimmed.r2_paired.as_path()],
            layout.qc_trimmed(),
            "qc/trimmed",
        ),
        assemble_stage(config),
        gene_predict_stage(config),
        domain_annotate_stage(config),
        align_and_bin_stage(config),
        quality_assess_stage(config),
    ]
}

/// Paths supplied from outside the pipeline
pub fn external_inputs(config: &PipelineConfig) -> Vec<PathBuf> {
    vec![
        config.reads1.clone(),
        config.reads2.clone(),
        config.tools.adapters.clone(),
        config.tools.pfam_db.clone(),
    ]
}

/// Check that stage ids are unique and every input is external or produced
/// by a strictly earlier stage
pub fn validate_wiring(stages: &[StageDescriptor], external: &[PathBuf]) -> Result<()> {
    let mut available: HashSet<&Path> = external.iter().map(PathBuf::as_path).collect();
    let mut available_patterns: HashSet<&str> = HashSet::new();
    let mut ids = HashSet::new();

    for (i, stage) in stages.iter().enumerate() {
        if stage.id.is_empty() {
            anyhow::bail!("Stage {} has an empty id", i);
        }
        if !ids.insert(stage.id.as_str()) {
            anyhow::bail!("Duplicate stage id '{}'", stage.id);
        }
        if stage.gates.is_empty() {
            anyhow::bail!("Stage '{}' has no gating step", stage.id);
        }

        for input in &stage.inputs {
            if available.contains(input.as_path()) {
                continue;
            }
            match stages[i..].iter().find(|s| s.outputs.contains(input)) {
                Some(later) => anyhow::bail!(
                    "Stage '{}' reads '{}' produced by later stage '{}' (forward references not allowed)",
                    stage.id,
                    input.display(),
                    later.id
                ),
                None => anyhow::bail!(
                    "Stage '{}' reads '{}' which no earlier stage produces",
                    stage.id,
                    input.display()
                ),
            }
        }

        for pattern in &stage.input_patterns {
            if !available_patterns.contains(pattern.as_str()) {
                anyhow::bail!(
                    "Stage '{}' expects files matching '{}' which no earlier stage promises",
                    stage.id,
                    pattern
                );
            }
        }

        available.extend(stage.outputs.iter().map(PathBuf::as_path));
        available_patterns.extend(stage.output_patterns.iter().map(String::as_str));
    }

    Ok(())
}

/// Stage-output directories scanned by the aggregate report, limited to the
/// steps that ran in this job
pub fn aggregate_sources(layout: &WorkLayout, ran: &BTreeSet<Step>) -> Vec<PathBuf> {
    ran.iter()
        .filter_map(|step| match step {
            Step::Qc => Some(layout.root().join("qc")),
            Step::Trim => Some(layout.trimmed()),
            Step::Assemble => Some(layout.assembly()),
            Step::GenePredict => Some(layout.genes()),
            Step::DomainAnnotate => None,
            Step::AlignAndBin => Some(layout.binning()),
            Step::QualityAssess => Some(layout.checkm()),
        })
        .collect()
}

/// MultiQC report path
pub fn aggregate_report_path(layout: &WorkLayout) -> PathBuf {
    layout.multiqc().join("multiqc_report.html")
}

/// MultiQC over the given source directories
pub fn aggregate_report_command(config: &PipelineConfig, sources: &[PathBuf]) -> ToolCommand {
    let report = aggregate_report_path(&config.layout);
    let mut cmd = ToolCommand::new(config.tools.program("multiqc"))
        .arg("-f")
        .arg("-o")
        .path_arg(&config.layout.multiqc());
    for source in sources {
        cmd = cmd.path_arg(source);
    }
    cmd.writes(report)
}

/// (id, tool label) pairs in execution order, for the job monitor
pub fn catalog(config: &PipelineConfig) -> Vec<(String, String)> {
    build_stages(config)
        .into_iter()
        .map(|s| (s.id, s.tool))
        .collect()
}
