//! # Pipeline Configuration and Artifact Layout
//!
//! All paths and tunables live in a single TOML-deserialisable
//! [`PipelineConfig`] whose defaults reproduce the reference study setup
//! (seed 42, 80/20 split, 128-dim embeddings, 6x6 patches on a 4-qubit
//! circuit, 5 folds). [`ArtifactLayout`] maps the configured output
//! directory to every artifact the pipeline reads or writes, so path
//! conventions are defined in exactly one place.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub learning_rate: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 300,
            learning_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Clinical table, one row per patient.
    pub clinical_data: PathBuf,
    /// Directory of per-patient PNG tiles.
    pub image_dir: PathBuf,
    /// Root directory for every persisted artifact.
    pub output_dir: PathBuf,
    pub id_column: String,
    pub target_column: String,
    pub seed: u64,
    pub test_fraction: f64,
    pub embedding_dim: usize,
    pub patch_size: usize,
    pub n_atoms: usize,
    pub folds: usize,
    pub trainer: TrainerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            clinical_data: PathBuf::from("data/clinical_data/clinical_Data.csv"),
            image_dir: PathBuf::from("data/image_data/png"),
            output_dir: PathBuf::from("data"),
            id_column: "TCIA_ID".to_string(),
            target_column: "Censored_0_progressed_1".to_string(),
            seed: 42,
            test_fraction: 0.2,
            embedding_dim: 128,
            patch_size: 6,
            n_atoms: 4,
            folds: 5,
            trainer: TrainerConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "test_fraction must lie strictly between 0 and 1, got {}",
                self.test_fraction
            )));
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid(
                "embedding_dim must be positive".to_string(),
            ));
        }
        if self.patch_size == 0 {
            return Err(ConfigError::Invalid(
                "patch_size must be positive".to_string(),
            ));
        }
        if self.n_atoms == 0 || self.n_atoms > 10 {
            return Err(ConfigError::Invalid(format!(
                "n_atoms must lie between 1 and 10, got {}",
                self.n_atoms
            )));
        }
        if self.patch_size * self.patch_size < self.n_atoms {
            return Err(ConfigError::Invalid(format!(
                "a {0}x{0} patch has too few pixels to encode {1} qubits",
                self.patch_size, self.n_atoms
            )));
        }
        if self.folds < 2 {
            return Err(ConfigError::Invalid(format!(
                "folds must be at least 2, got {}",
                self.folds
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(&self.output_dir)
    }
}

/// Every artifact path, derived from the configured output directory.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn train_data(&self) -> PathBuf {
        self.root.join("train_data.csv")
    }

    pub fn test_data(&self) -> PathBuf {
        self.root.join("test_data.csv")
    }

    pub fn train_labels(&self) -> PathBuf {
        self.root.join("labels").join("train_labels.csv")
    }

    pub fn test_labels(&self) -> PathBuf {
        self.root.join("labels").join("test_labels.csv")
    }

    pub fn train_clinical_embeddings(&self) -> PathBuf {
        self.root
            .join("embeddings")
            .join("train_clinical_embeddings.npy")
    }

    pub fn test_clinical_embeddings(&self) -> PathBuf {
        self.root
            .join("embeddings")
            .join("test_clinical_embeddings.npy")
    }

    pub fn train_image_embeddings(&self) -> PathBuf {
        self.root
            .join("embeddings")
            .join("train_image_embeddings.npy")
    }

    pub fn test_image_embeddings(&self) -> PathBuf {
        self.root
            .join("embeddings")
            .join("test_image_embeddings.npy")
    }

    pub fn train_image_labels(&self) -> PathBuf {
        self.root.join("labels").join("train_image_labels.csv")
    }

    pub fn test_image_labels(&self) -> PathBuf {
        self.root.join("labels").join("test_image_labels.csv")
    }

    pub fn fold_train_embeddings(&self, fold: usize) -> PathBuf {
        self.root
            .join("embeddings")
            .join(format!("fold_{fold}_train_embeddings.npy"))
    }

    pub fn fold_val_embeddings(&self, fold: usize) -> PathBuf {
        self.root
            .join("embeddings")
            .join(format!("fold_{fold}_val_embeddings.npy"))
    }

    pub fn fold_train_labels(&self, fold: usize) -> PathBuf {
        self.root
            .join("labels")
            .join(format!("fold_{fold}_train_labels.csv"))
    }

    pub fn fold_val_labels(&self, fold: usize) -> PathBuf {
        self.root
            .join("labels")
            .join(format!("fold_{fold}_val_labels.csv"))
    }

    pub fn model(&self) -> PathBuf {
        self.root.join("model.toml")
    }
}
