//! Pipeline configuration.
//!
//! Built once (TOML file or defaults, then command-line overrides) and handed
//! to each component's constructor.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_COMPARE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub enable_statistics_persistence: bool,
    pub exclude_late_file: bool,
    pub raw_dir: PathBuf,
    pub bronze_dir: PathBuf,
    pub database_path: PathBuf,
    pub statistics_path: PathBuf,
    pub primary_stems: Vec<String>,
    pub late_stem: String,
    pub compare_tolerance: f64,
    pub bronze_compression_level: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            enable_statistics_persistence: true,
            exclude_late_file: false,
            raw_dir: PathBuf::from("data/raw"),
            bronze_dir: PathBuf::from("data/processed/bronze"),
            database_path: PathBuf::from("data/pipeline.db"),
            statistics_path: PathBuf::from("data/processed/pipeline_statistics.json"),
            primary_stems: (1..=5).map(|month| format!("2012-{}", month)).collect(),
            late_stem: "validation".to_string(),
            compare_tolerance: DEFAULT_COMPARE_TOLERANCE,
            bronze_compression_level: 3,
        }
    }
}

impl PipelineConfig {
    /// Reads `path` as TOML when given; otherwise starts from defaults.
    /// Missing keys fall back to their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_data_dir(mut self, dir: &Path) -> Self {
        self.raw_dir = dir.join("raw");
        self.bronze_dir = dir.join("processed").join("bronze");
        self.database_path = dir.join("pipeline.db");
        self.statistics_path = dir.join("processed").join("pipeline_statistics.json");
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch_size must be a positive integer".to_string(),
            ));
        }
        if !self.compare_tolerance.is_finite() || self.compare_tolerance < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "compare_tolerance must be a finite non-negative number, got {}",
                self.compare_tolerance
            )));
        }
        if self.primary_stems.is_empty() {
            return Err(ConfigError::Invalid(
                "primary_stems must name at least one file".to_string(),
            ));
        }
        if self.primary_stems.iter().any(|stem| stem == &self.late_stem) {
            return Err(ConfigError::Invalid(format!(
                "late file {} is also listed as a primary file",
                self.late_stem
            )));
        }
        if !(1..=22).contains(&self.bronze_compression_level) {
            return Err(ConfigError::Invalid(format!(
                "bronze_compression_level must be within 1..=22, got {}",
                self.bronze_compression_level
            )));
        }
        Ok(())
    }

    pub fn all_stems(&self) -> Vec<String> {
        let mut stems = self.primary_stems.clone();
        stems.push(self.late_stem.clone());
        stems
    }

    pub fn bronze_path(&self, stem: &str) -> PathBuf {
        self.bronze_dir.join(format!("{}.parquet", stem))
    }

    pub fn primary_bronze_files(&self) -> Vec<PathBuf> {
        self.primary_stems
            .iter()
            .map(|stem| self.bronze_path(stem))
            .collect()
    }

    pub fn late_bronze_file(&self) -> Option<PathBuf> {
        if self.exclude_late_file {
            None
        } else {
            Some(self.bronze_path(&self.late_stem))
        }
    }

    pub fn statistics_path_if_enabled(&self) -> Option<&Path> {
        if self.enable_statistics_persistence {
            Some(self.statistics_path.as_path())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;

    use super::PipelineConfig;
    use crate::error::ConfigError;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::load(None).expect("defaults");
        assert_eq!(config.batch_size, 1000);
        assert!(config.enable_statistics_persistence);
        assert!(!config.exclude_late_file);
        assert_eq!(config.primary_stems.len(), 5);
        assert_eq!(config.primary_stems[0], "2012-1");
        assert_eq!(config.late_stem, "validation");
        assert_eq!(config.all_stems().last().map(String::as_str), Some("validation"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pipeline.toml");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "batch_size = 250\nexclude_late_file = true").expect("write");

        let config = PipelineConfig::load(Some(&path)).expect("load");
        assert_eq!(config.batch_size, 250);
        assert!(config.exclude_late_file);
        assert_eq!(config.late_bronze_file(), None);
        assert_eq!(config.late_stem, "validation");
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "batch_size = 0\n").expect("write");

        let err = PipelineConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_reports_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "batch_size = \"many\"\n").expect("write");

        let err = PipelineConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn data_dir_reroots_paths() {
        let config = PipelineConfig::default().with_data_dir(Path::new("/tmp/run"));
        assert_eq!(
            config.bronze_path("2012-3"),
            Path::new("/tmp/run/processed/bronze/2012-3.parquet")
        );
        assert_eq!(config.database_path, Path::new("/tmp/run/pipeline.db"));
    }
}
