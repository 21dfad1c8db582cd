//! Artifact manager: working directories and the results tree.
//!
//! The results tree is only ever written from here. Entries are added after
//! each successful stage and are never pruned during a run.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

use crate::domain::{CollectRule, Manifest, ManifestEntry, ResultCategory, StageDescriptor};

use super::error::PipelineError;

/// Name of the manifest written at finalize
pub const MANIFEST_FILE: &str = "manifest.json";

/// Create directories (and parents); existing directories are fine
pub async fn prepare_dirs(paths: &[PathBuf]) -> Result<(), PipelineError> {
    for path in paths {
        fs::create_dir_all(path)
            .await
            .map_err(|e| PipelineError::io(format!("Failed to create directory {}", path.display()), e))?;
    }
    Ok(())
}

/// Remove a stale file or directory tree; a missing path is fine.
///
/// Returns whether anything was removed.
pub async fn remove_stale(path: &Path) -> Result<bool, PipelineError> {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(PipelineError::io(format!("Failed to inspect {}", path.display()), e)),
    };

    let removed = if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    removed.map_err(|e| PipelineError::io(format!("Failed to remove stale {}", path.display()), e))?;
    Ok(true)
}

/// Regular files matching a glob pattern, sorted
pub fn matching_files(pattern: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let entries = glob::glob(pattern)
        .map_err(|e| PipelineError::Config(format!("invalid file pattern '{}': {}", pattern, e)))?;

    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => warn!(pattern = %pattern, error = %e, "Unreadable path while matching"),
        }
    }
    files.sort();
    Ok(files)
}

/// Concatenate partition outputs into `dest`.
///
/// Comment lines (`#`) are dropped and data lines are written part by part in
/// the order given. Callers pass parts in completion order, so record order
/// across parts is unspecified; only the union of records is guaranteed.
/// Returns the number of records written.
pub async fn merge_parts(parts: &[PathBuf], dest: &Path) -> Result<usize, PipelineError> {
    let out = File::create(dest)
        .await
        .map_err(|e| PipelineError::io(format!("Failed to create {}", dest.display()), e))?;
    let mut writer = BufWriter::new(out);
    let mut records = 0;

    for part in parts {
        let file = File::open(part)
            .await
            .map_err(|e| PipelineError::io(format!("Failed to open partition {}", part.display()), e))?;
        let mut lines = BufReader::new(file).lines();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| PipelineError::io(format!("Failed to read partition {}", part.display()), e))?
        {
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            writer
                .write_all(format!("{}\n", line).as_bytes())
                .await
                .map_err(|e| PipelineError::io(format!("Failed to write {}", dest.display()), e))?;
            records += 1;
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| PipelineError::io(format!("Failed to flush {}", dest.display()), e))?;

    Ok(records)
}

/// Owner of the canonical results directory
pub struct ArtifactManager {
    results_dir: PathBuf,
}

impl ArtifactManager {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Copy a stage's designated outputs into the results tree
    pub async fn collect(&self, stage: &StageDescriptor) -> Result<Vec<PathBuf>, PipelineError> {
        let mut collected = Vec::new();

        for rule in &stage.collect {
            match rule {
                CollectRule::File { source, dest } => {
                    collected.push(self.copy_into(source, dest).await?);
                }
                CollectRule::Glob { pattern, dest } => {
                    let matches = matching_files(pattern)?;
                    if matches.is_empty() {
                        warn!(stage = %stage.id, pattern = %pattern, "Collect pattern matched no files");
                    }
                    for path in matches {
                        collected.push(self.copy_into(&path, dest).await?);
                    }
                }
            }
        }

        debug!(stage = %stage.id, files = collected.len(), "Collected artifacts");
        Ok(collected)
    }

    /// Copy one file into a results subdirectory, keeping its file name
    async fn copy_into(&self, source: &Path, dest_subdir: &Path) -> Result<PathBuf, PipelineError> {
        let dest_dir = self.results_dir.join(dest_subdir);
        prepare_dirs(std::slice::from_ref(&dest_dir)).await?;

        let file_name = source.file_name().ok_or_else(|| {
            PipelineError::io(
                format!("Cannot collect {}", source.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;
        let target = dest_dir.join(file_name);

        fs::copy(source, &target).await.map_err(|e| {
            PipelineError::io(
                format!("Failed to copy {} to {}", source.display(), target.display()),
                e,
            )
        })?;

        Ok(target)
    }

    /// All files under the results directory, relative and sorted
    pub async fn list_results(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let mut files = Vec::new();
        let mut pending = vec![self.results_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(PipelineError::io(format!("Failed to list {}", dir.display()), e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| PipelineError::io(format!("Failed to list {}", dir.display()), e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| PipelineError::io(format!("Failed to stat {}", path.display()), e))?;

                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.results_dir) {
                    files.push(relative.to_path_buf());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Record every result file with size, checksum and category
    pub async fn write_manifest(&self, job_id: &str) -> Result<Manifest, PipelineError> {
        let mut entries = Vec::new();

        for relative in self.list_results().await? {
            let key = to_key(&relative);
            if key == MANIFEST_FILE {
                continue;
            }
            let (size_bytes, sha256) = checksum(&self.results_dir.join(&relative)).await?;
            entries.push(ManifestEntry {
                category: ResultCategory::classify(&key),
                path: key,
                size_bytes,
                sha256,
            });
        }

        let manifest = Manifest {
            job_id: job_id.to_string(),
            entries,
        };

        let path = self.results_dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest).map_err(|e| {
            PipelineError::io(
                "Failed to serialize manifest",
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        fs::write(&path, json)
            .await
            .map_err(|e| PipelineError::io(format!("Failed to write {}", path.display()), e))?;

        Ok(manifest)
    }
}

/// `/`-separated key for a relative path
pub fn to_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Size and hex SHA-256 of a file, streamed
async fn checksum(path: &Path) -> Result<(u64, String), PipelineError> {
    let mut file = File::open(path)
        .await
        .map_err(|e| PipelineError::io(format!("Failed to open {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| PipelineError::io(format!("Failed to read {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((size, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Step;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_prepare_dirs_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let dirs = vec![temp.path().join("a/b"), temp.path().join("c")];

        prepare_dirs(&dirs).await.unwrap();
        prepare_dirs(&dirs).await.unwrap();

        let mut entries: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        entries.sort();
        assert_eq!(entries, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_merge_keeps_union_of_records() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.tbl");
        let b = temp.path().join("b.tbl");
        std::fs::write(&a, "# header\nrec1\nrec2\n# footer\n").unwrap();
        std::fs::write(&b, "# header\nrec3\n").unwrap();

        let dest = temp.path().join("merged.tbl");
        let n = merge_parts(&[b.clone(), a.clone()], &dest).await.unwrap();
        assert_eq!(n, 3);

        let mut lines: Vec<String> = std::fs::read_to_string(&dest)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        lines.sort();
        assert_eq!(lines, vec!["rec1", "rec2", "rec3"]);
    }

    #[tokio::test]
    async fn test_collect_file_and_glob_rules() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        std::fs::create_dir_all(work.join("bins")).unwrap();
        std::fs::write(work.join("report.tsv"), "x").unwrap();
        std::fs::write(work.join("bins/bin.1.fa"), ">c1\nACGT\n").unwrap();
        std::fs::write(work.join("bins/bin.2.fa"), ">c2\nACGT\n").unwrap();
        std::fs::write(work.join("bins/notes.txt"), "skip me").unwrap();

        let mut stage = StageDescriptor::new("alignAndBin", Step::AlignAndBin, "MetaBAT2");
        stage.collect = vec![
            CollectRule::File {
                source: work.join("report.tsv"),
                dest: PathBuf::from("binning"),
            },
            CollectRule::Glob {
                pattern: format!("{}/bin.*.fa", work.join("bins").display()),
                dest: PathBuf::from("bins"),
            },
        ];

        let manager = ArtifactManager::new(temp.path().join("results"));
        let collected = manager.collect(&stage).await.unwrap();
        assert_eq!(collected.len(), 3);

        let listed = manager.list_results().await.unwrap();
        assert_eq!(
            listed,
            vec![
                PathBuf::from("binning/report.tsv"),
                PathBuf::from("bins/bin.1.fa"),
                PathBuf::from("bins/bin.2.fa"),
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_stale_handles_files_dirs_and_missing_paths() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("old.txt");
        let dir = temp.path().join("parts");
        std::fs::write(&file, "old").unwrap();
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("nested/part_000.faa"), ">p\nM\n").unwrap();

        assert!(remove_stale(&file).await.unwrap());
        assert!(remove_stale(&dir).await.unwrap());
        assert!(!remove_stale(&file).await.unwrap());
        assert!(!file.exists());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_manifest_lists_results_with_checksums() {
        let temp = TempDir::new().unwrap();
        let results = temp.path().join("results");
        std::fs::create_dir_all(results.join("assembly")).unwrap();
        std::fs::write(results.join("assembly/final.contigs.fa"), ">k1\nACGT\n").unwrap();

        let manager = ArtifactManager::new(&results);
        let manifest = manager.write_manifest("t1").await.unwrap();
        assert_eq!(manifest.entries.len(), 1);

        let entry = &manifest.entries[0];
        assert_eq!(entry.path, "assembly/final.contigs.fa");
        assert_eq!(entry.category, ResultCategory::Contigs);
        assert_eq!(entry.size_bytes, 10);
        assert_eq!(entry.sha256.len(), 64);

        // Rewriting does not list the manifest itself
        let again = manager.write_manifest("t1").await.unwrap();
        assert_eq!(again.entries.len(), 1);
        assert!(results.join(MANIFEST_FILE).exists());
    }
}
