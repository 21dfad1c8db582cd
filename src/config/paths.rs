//! Canonical work-directory layout.
//!
//! Single source of truth for where each stage reads and writes. Every path
//! hangs off one work root. Stage directories are shared by every job run
//! against the root; results and logs are namespaced by job id.
//!
//! | Directory | Owner |
//! |-----------|-------|
//! | `raw/` | operator (input reads) |
//! | `refs/` | operator (adapters, Pfam database) |
//! | `qc/`, `trimmed/`, `assembly/`, `genes/`, `annotation/`, `binning/`, `checkm/`, `multiqc/` | one stage each |
//! | `results/<job_id>/` | artifact manager |
//! | `logs/` | progress reporter |

use std::path::{Path, PathBuf};

/// Default name of the first raw read file
pub const DEFAULT_READS_1: &str = "CV_1.fq.gz";

/// Default name of the second raw read file
pub const DEFAULT_READS_2: &str = "CV_2.fq.gz";

/// Directory layout under a work root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn refs(&self) -> PathBuf {
        self.root.join("refs")
    }

    pub fn qc_raw(&self) -> PathBuf {
        self.root.join("qc").join("raw")
    }

    pub fn qc_trimmed(&self) -> PathBuf {
        self.root.join("qc").join("trimmed")
    }

    pub fn trimmed(&self) -> PathBuf {
        self.root.join("trimmed")
    }

    pub fn assembly(&self) -> PathBuf {
        self.root.join("assembly")
    }

    /// MEGAHIT output directory; MEGAHIT creates it itself
    pub fn megahit(&self) -> PathBuf {
        self.assembly().join("megahit")
    }

    pub fn genes(&self) -> PathBuf {
        self.root.join("genes")
    }

    pub fn annotation(&self) -> PathBuf {
        self.root.join("annotation")
    }

    pub fn annotation_parts(&self) -> PathBuf {
        self.annotation().join("parts")
    }

    pub fn binning(&self) -> PathBuf {
        self.root.join("binning")
    }

    pub fn bins(&self) -> PathBuf {
        self.binning().join("bins")
    }

    pub fn checkm(&self) -> PathBuf {
        self.root.join("checkm")
    }

    pub fn multiqc(&self) -> PathBuf {
        self.root.join("multiqc")
    }

    /// Results tree of one job
    pub fn results(&self, job_id: &str) -> PathBuf {
        self.root.join("results").join(job_id)
    }

    pub fn results_bins(&self, job_id: &str) -> PathBuf {
        self.results(job_id).join("bins")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Local log file of a job
    pub fn log_file(&self, job_id: &str) -> PathBuf {
        self.logs().join(format!("{}.log", job_id))
    }

    /// Top-level directories created before any stage of a job runs
    pub fn base_dirs(&self, job_id: &str) -> Vec<PathBuf> {
        vec![
            self.raw(),
            self.results(job_id),
            self.results_bins(job_id),
            self.logs(),
        ]
    }
}

/// Remote object key of a job's mirrored log
pub fn remote_log_key(job_id: &str) -> String {
    format!("jobs/{}/pipeline.log", job_id)
}

/// Remote object key of a job's completion marker
pub fn remote_status_key(job_id: &str) -> String {
    format!("jobs/{}/status.txt", job_id)
}

/// Remote key prefix for a job's results
pub fn remote_results_prefix(job_id: &str) -> String {
    format!("results/{}", job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = WorkLayout::new("/data");

        assert_eq!(layout.qc_raw(), PathBuf::from("/data/qc/raw"));
        assert_eq!(layout.megahit(), PathBuf::from("/data/assembly/megahit"));
        assert_eq!(layout.results("t1"), PathBuf::from("/data/results/t1"));
        assert_eq!(layout.results_bins("t1"), PathBuf::from("/data/results/t1/bins"));
        assert_eq!(layout.log_file("t1"), PathBuf::from("/data/logs/t1.log"));
    }

    #[test]
    fn test_remote_keys_are_job_namespaced() {
        assert_eq!(remote_log_key("t1"), "jobs/t1/pipeline.log");
        assert_eq!(remote_status_key("t1"), "jobs/t1/status.txt");
        assert_eq!(remote_results_prefix("t1"), "results/t1");
    }

    #[test]
    fn test_base_dirs_include_job_results() {
        let layout = WorkLayout::new("/data");
        let dirs = layout.base_dirs("t1");
        assert!(dirs.contains(&PathBuf::from("/data/results/t1/bins")));
        assert!(!dirs.contains(&PathBuf::from("/data/results")));
    }
}
