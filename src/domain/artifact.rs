//! Artifacts collected into the results tree.

use serde::{Deserialize, Serialize};

/// What kind of result a file in the results tree is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCategory {
    MultiqcReport,
    QcReport,
    TrimSummary,
    Contigs,
    GenePredictions,
    PfamAnnotations,
    Bins,
    CheckmReport,
    Other,
}

impl ResultCategory {
    /// Classify a file by its path relative to the results directory
    pub fn classify(relative_path: &str) -> Self {
        let lower = relative_path.to_lowercase();
        let file_name = lower.rsplit('/').next().unwrap_or(&lower);

        if lower.contains("multiqc") {
            Self::MultiqcReport
        } else if file_name.contains("_fastqc.") {
            Self::QcReport
        } else if file_name.contains("trim") && file_name.ends_with(".txt") {
            Self::TrimSummary
        } else if file_name.contains("contigs") && (file_name.ends_with(".fa") || file_name.ends_with(".fasta")) {
            Self::Contigs
        } else if lower.contains("pfam") || lower.contains("hmmscan") {
            Self::PfamAnnotations
        } else if lower.starts_with("bins/") || lower.contains("metabat") {
            Self::Bins
        } else if lower.contains("checkm") {
            Self::CheckmReport
        } else if lower.starts_with("genes/") {
            Self::GenePredictions
        } else {
            Self::Other
        }
    }
}

/// One file recorded in `results/manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the results directory, `/`-separated
    pub path: String,

    pub category: ResultCategory,

    pub size_bytes: u64,

    /// Hex-encoded SHA-256 of the file content
    pub sha256: String,
}

/// The results manifest written at finalize
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub job_id: String,
    pub entries: Vec<ManifestEntry>,
}
