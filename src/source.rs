//! Raw file acquisition.
//!
//! Fetching is a collaborator behind `SourceFiles`; the pipeline only needs
//! to know whether the expected CSVs are available and where they live.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::utils::{file_size, format_size};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub success: bool,
    /// Directory holding the CSVs, when one was found.
    pub path: Option<PathBuf>,
    pub files: Vec<PathBuf>,
    pub missing: Vec<String>,
}

pub trait SourceFiles {
    fn fetch(&self) -> Result<FetchOutcome>;
}

/// CSVs already present on disk, either directly under `raw_dir` or in one
/// of its subdirectories (an extracted archive).
#[derive(Debug, Clone)]
pub struct LocalDirectory {
    raw_dir: PathBuf,
    stems: Vec<String>,
}

impl LocalDirectory {
    pub fn new(raw_dir: impl Into<PathBuf>, stems: Vec<String>) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            stems,
        }
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    fn present_in(&self, dir: &Path) -> usize {
        self.stems
            .iter()
            .filter(|stem| dir.join(format!("{}.csv", stem)).is_file())
            .count()
    }

    /// Candidate holding the most expected CSVs; `raw_dir` wins ties, then
    /// subdirectories in name order.
    fn locate(&self) -> Result<Option<PathBuf>> {
        let mut candidates = vec![self.raw_dir.clone()];
        let mut subdirs = Vec::new();
        for entry in std::fs::read_dir(&self.raw_dir)
            .with_context(|| format!("list {}", self.raw_dir.display()))?
        {
            let entry = entry?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if entry.file_type()?.is_dir() && !hidden {
                subdirs.push(entry.path());
            }
        }
        subdirs.sort();
        candidates.extend(subdirs);

        let mut best: Option<(PathBuf, usize)> = None;
        for dir in candidates {
            let found = self.present_in(&dir);
            if found > 0 && best.as_ref().map_or(true, |(_, n)| found > *n) {
                best = Some((dir, found));
            }
        }
        Ok(best.map(|(dir, _)| dir))
    }
}

impl SourceFiles for LocalDirectory {
    fn fetch(&self) -> Result<FetchOutcome> {
        if !self.raw_dir.is_dir() {
            warn!(dir = %self.raw_dir.display(), "raw data directory does not exist");
            return Ok(FetchOutcome {
                success: false,
                path: None,
                files: Vec::new(),
                missing: self.stems.clone(),
            });
        }

        let Some(dir) = self.locate()? else {
            warn!(dir = %self.raw_dir.display(), "no expected csv files found");
            return Ok(FetchOutcome {
                success: false,
                path: None,
                files: Vec::new(),
                missing: self.stems.clone(),
            });
        };

        let mut files = Vec::new();
        let mut missing = Vec::new();
        for stem in &self.stems {
            let path = dir.join(format!("{}.csv", stem));
            if path.is_file() {
                info!(file = %path.display(), size = %format_size(file_size(&path)), "found raw file");
                files.push(path);
            } else {
                warn!(file = %path.display(), "expected raw file missing");
                missing.push(stem.clone());
            }
        }
        Ok(FetchOutcome {
            success: missing.is_empty(),
            path: Some(dir),
            files,
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{LocalDirectory, SourceFiles};

    fn stems() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn finds_files_directly_in_raw_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.csv"), "x").expect("write");
        std::fs::write(dir.path().join("b.csv"), "x").expect("write");

        let outcome = LocalDirectory::new(dir.path(), stems()).fetch().expect("fetch");
        assert!(outcome.success);
        assert_eq!(outcome.path.as_deref(), Some(dir.path()));
        assert_eq!(outcome.files.len(), 2);
    }

    #[test]
    fn finds_extracted_subdirectory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let extracted = dir.path().join("challenge");
        std::fs::create_dir_all(&extracted).expect("mkdir");
        std::fs::create_dir_all(dir.path().join(".cache")).expect("mkdir");
        std::fs::write(extracted.join("a.csv"), "x").expect("write");

        let outcome = LocalDirectory::new(dir.path(), stems()).fetch().expect("fetch");
        assert!(!outcome.success);
        assert_eq!(outcome.path, Some(extracted));
        assert_eq!(outcome.missing, vec!["b".to_string()]);
    }

    #[test]
    fn missing_raw_dir_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = LocalDirectory::new(dir.path().join("nope"), stems())
            .fetch()
            .expect("fetch");
        assert!(!outcome.success);
        assert!(outcome.path.is_none());
        assert_eq!(outcome.missing.len(), 2);
    }
}
