// engine/config.rs

//! Engine settings, read from an optional TOML file. Every field has a
//! default, so an empty file (or no file) is a valid configuration.

use crate::model::{DEFAULT_SIZE_CEILING, ModelStore, TrainingSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base path `P` of the persisted model; `.gz` and `.ultra.gz` are
    /// appended for the compressed tiers.
    pub model_path: PathBuf,
    pub size_ceiling_bytes: u64,
    /// Directory searched for training datasets when none is given.
    pub data_dir: PathBuf,
    pub corpus_prefix: String,
    pub training: TrainingSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("personalized_model.toml"),
            size_ceiling_bytes: DEFAULT_SIZE_CEILING,
            data_dir: PathBuf::from("data"),
            corpus_prefix: "ml_training_dataset_".to_string(),
            training: TrainingSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        log::debug!("Loaded configuration from '{}'", path.display());
        Ok(config)
    }

    /// The file's settings, or the defaults when no file is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    pub fn store(&self) -> ModelStore {
        ModelStore::new(&self.model_path, self.size_ceiling_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regressor::ForestParams;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_yields_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.training.test_fraction, 0.2);
        assert_eq!(config.training.standard, ForestParams::default());
        assert_eq!(config.training.optimized.n_trees, 50);
        assert_eq!(config.size_ceiling_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn partial_files_override_only_what_they_name() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "model_path = \"models/risk.toml\"\n\n[training]\nseed = 7").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.model_path, PathBuf::from("models/risk.toml"));
        assert_eq!(config.training.seed, 7);
        assert_eq!(config.training.test_fraction, 0.2);
        assert_eq!(config.corpus_prefix, "ml_training_dataset_");
        assert_eq!(
            config.store().tier_path(crate::model::PersistenceTier::Ultra),
            PathBuf::from("models/risk.toml.ultra.gz")
        );
    }

    #[test]
    fn bad_files_are_reported() {
        assert!(matches!(
            EngineConfig::from_toml("size_ceiling_bytes = \"big\""),
            Err(ConfigError::Parse(_))
        ));
        let missing = EngineConfig::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
        assert_eq!(
            EngineConfig::load_or_default(None).unwrap(),
            EngineConfig::default()
        );
    }
}
