//! # Downstream Trainer / Evaluator Boundary
//!
//! The pipeline never owns a predictive model; it hands persisted artifacts
//! to whatever implements [`Trainer`] and [`Evaluator`], forwarding the
//! caller's config path and resume epoch opaquely through [`TrainContext`].
//! Cross-validation scores folds through the [`FoldScorer`] boundary so
//! orchestration tests can plug in a stub.
//!
//! [`LogisticReadout`] is the reference collaborator shipped with the crate:
//! it mean-pools a clinical embedding tensor over the sequence axis, fits a
//! logistic regression by gradient descent, and persists itself as TOML.

use crate::config::ArtifactLayout;
use crate::metrics::FoldMetrics;
use crate::persist::{self, PersistError};
use log::info;
use ndarray::{Array1, Array2, ArrayView1, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("persisted artifact error: {0}")]
    Persist(#[from] PersistError),
    #[error("trainer failed: {0}")]
    Fit(String),
    #[error("failed to serialise model: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to parse model file: {0}")]
    Deserialize(#[from] toml::de::Error),
    #[error("IO error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Opaque caller context forwarded to the downstream trainer/evaluator.
#[derive(Debug, Clone, Default)]
pub struct TrainContext {
    pub config_path: Option<PathBuf>,
    pub resume_epoch: Option<usize>,
}

/// Fits a predictive model from persisted train-split artifacts.
pub trait Trainer {
    fn train(&mut self, layout: &ArtifactLayout, ctx: &TrainContext) -> Result<(), TrainError>;
}

/// Scores a previously trained model against persisted test-split artifacts.
pub trait Evaluator {
    fn evaluate(
        &self,
        layout: &ArtifactLayout,
        ctx: &TrainContext,
    ) -> Result<FoldMetrics, TrainError>;
}

/// Scores one cross-validation fold from in-memory embedding tensors.
pub trait FoldScorer {
    fn score_fold(
        &self,
        fold: usize,
        train_embeddings: ArrayView3<f64>,
        train_labels: ArrayView1<u8>,
        val_embeddings: ArrayView3<f64>,
        val_labels: ArrayView1<u8>,
    ) -> Result<FoldMetrics, TrainError>;
}

/// Serialised form of the fitted readout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadoutModel {
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl ReadoutModel {
    pub fn save(&self, path: &Path) -> Result<(), TrainError> {
        let text = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, text).map_err(|source| TrainError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| TrainError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, TrainError> {
        let text = fs::read_to_string(path).map_err(|source| TrainError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

/// Logistic-regression readout over mean-pooled clinical embeddings.
#[derive(Debug, Clone)]
pub struct LogisticReadout {
    epochs: usize,
    learning_rate: f64,
}

impl LogisticReadout {
    pub fn new(epochs: usize, learning_rate: f64) -> Self {
        Self {
            epochs,
            learning_rate,
        }
    }

    /// Collapses `[rows, seq_len, dim]` to `[rows, dim]` by averaging over
    /// the sequence axis.
    fn pool(embeddings: ArrayView3<f64>) -> Result<Array2<f64>, TrainError> {
        embeddings
            .mean_axis(Axis(1))
            .ok_or_else(|| TrainError::Fit("embedding tensor has an empty sequence axis".into()))
    }

    fn fit(&self, pooled: &Array2<f64>, labels: ArrayView1<u8>) -> Result<ReadoutModel, TrainError> {
        let n = pooled.nrows();
        if n == 0 || n != labels.len() {
            return Err(TrainError::Fit(format!(
                "{} pooled rows but {} labels",
                n,
                labels.len()
            )));
        }

        let y: Array1<f64> = labels.iter().map(|&l| f64::from(l)).collect();
        let mut weights = Array1::<f64>::zeros(pooled.ncols());
        let mut bias = 0.0_f64;
        for epoch in 0..self.epochs {
            let p = predict(pooled, &weights, bias);
            let residual = &p - &y;
            if residual.iter().any(|v| !v.is_finite()) {
                return Err(TrainError::Fit(format!(
                    "non-finite residual at epoch {epoch}"
                )));
            }
            let grad_w = pooled.t().dot(&residual) / n as f64;
            let grad_b = residual.sum() / n as f64;
            weights = weights - self.learning_rate * &grad_w;
            bias -= self.learning_rate * grad_b;
        }

        Ok(ReadoutModel {
            weights: weights.to_vec(),
            bias,
        })
    }

    fn metrics(
        fold: usize,
        probabilities: &Array1<f64>,
        labels: ArrayView1<u8>,
    ) -> FoldMetrics {
        let n = labels.len() as f64;
        let correct = probabilities
            .iter()
            .zip(labels.iter())
            .filter(|(&p, &y)| u8::from(p >= 0.5) == y)
            .count() as f64;
        let log_loss = -probabilities
            .iter()
            .zip(labels.iter())
            .map(|(&p, &y)| {
                let p = p.clamp(1e-12, 1.0 - 1e-12);
                f64::from(y) * p.ln() + (1.0 - f64::from(y)) * (1.0 - p).ln()
            })
            .sum::<f64>()
            / n;

        let mut metrics = FoldMetrics::new(fold);
        metrics.insert("accuracy", correct / n);
        metrics.insert("log_loss", log_loss);
        metrics
    }
}

fn predict(pooled: &Array2<f64>, weights: &Array1<f64>, bias: f64) -> Array1<f64> {
    let z = pooled.dot(weights) + bias;
    z.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

impl Trainer for LogisticReadout {
    fn train(&mut self, layout: &ArtifactLayout, ctx: &TrainContext) -> Result<(), TrainError> {
        if let Some(epoch) = ctx.resume_epoch {
            info!("resume epoch {epoch} requested; readout refits from scratch");
        }
        if let Some(path) = &ctx.config_path {
            info!("trainer invoked with config {}", path.display());
        }

        let embeddings_path = layout.train_clinical_embeddings();
        let embeddings = persist::read_embeddings3(&embeddings_path)?;
        let table = persist::read_label_table(&layout.train_labels())?;
        persist::check_aligned(&embeddings_path, embeddings.shape()[0], &table)?;

        let pooled = Self::pool(embeddings.view())?;
        let labels = Array1::from_vec(table.labels);
        let model = self.fit(&pooled, labels.view())?;
        model.save(&layout.model())?;
        info!("readout model saved to {}", layout.model().display());
        Ok(())
    }
}

impl Evaluator for LogisticReadout {
    fn evaluate(
        &self,
        layout: &ArtifactLayout,
        _ctx: &TrainContext,
    ) -> Result<FoldMetrics, TrainError> {
        let model = ReadoutModel::load(&layout.model())?;
        let embeddings_path = layout.test_clinical_embeddings();
        let embeddings = persist::read_embeddings3(&embeddings_path)?;
        let table = persist::read_label_table(&layout.test_labels())?;
        persist::check_aligned(&embeddings_path, embeddings.shape()[0], &table)?;

        let pooled = Self::pool(embeddings.view())?;
        let probabilities = predict(&pooled, &Array1::from_vec(model.weights), model.bias);
        let labels = Array1::from_vec(table.labels);
        Ok(Self::metrics(0, &probabilities, labels.view()))
    }
}

impl FoldScorer for LogisticReadout {
    fn score_fold(
        &self,
        fold: usize,
        train_embeddings: ArrayView3<f64>,
        train_labels: ArrayView1<u8>,
        val_embeddings: ArrayView3<f64>,
        val_labels: ArrayView1<u8>,
    ) -> Result<FoldMetrics, TrainError> {
        let train_pooled = Self::pool(train_embeddings)?;
        let model = self.fit(&train_pooled, train_labels)?;

        let val_pooled = Self::pool(val_embeddings)?;
        let probabilities = predict(&val_pooled, &Array1::from_vec(model.weights), model.bias);
        Ok(Self::metrics(fold, &probabilities, val_labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;
    use tempfile::TempDir;

    /// Embeddings whose pooled dim-0 value carries the label sign.
    fn separable(n: usize) -> (Array3<f64>, Array1<u8>) {
        let labels = Array1::from_shape_fn(n, |i| u8::from(i % 2 == 0));
        let embeddings = Array3::from_shape_fn((n, 3, 2), |(i, j, k)| {
            let signal = if i % 2 == 0 { 1.0 } else { -1.0 };
            if k == 0 {
                signal + (j as f64) * 0.01
            } else {
                0.2
            }
        });
        (embeddings, labels)
    }

    #[test]
    fn readout_separates_linearly_separable_folds() {
        let (train_e, train_y) = separable(40);
        let (val_e, val_y) = separable(20);
        let scorer = LogisticReadout::new(500, 0.5);
        let metrics = scorer
            .score_fold(2, train_e.view(), train_y.view(), val_e.view(), val_y.view())
            .unwrap();

        assert_eq!(metrics.fold, 2);
        assert_abs_diff_eq!(metrics.values["accuracy"], 1.0, epsilon = 1e-12);
        assert!(metrics.values["log_loss"] < 0.5);
    }

    #[test]
    fn model_round_trips_through_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.toml");
        let model = ReadoutModel {
            weights: vec![0.5, -1.25],
            bias: 0.125,
        };
        model.save(&path).unwrap();
        let loaded = ReadoutModel::load(&path).unwrap();
        assert_eq!(loaded.weights, model.weights);
        assert_abs_diff_eq!(loaded.bias, model.bias, epsilon = 1e-12);
    }

    #[test]
    fn mismatched_labels_fail_the_fit() {
        let (train_e, _) = separable(10);
        let short = Array1::from_vec(vec![1u8, 0]);
        let scorer = LogisticReadout::new(10, 0.1);
        let err = scorer
            .score_fold(0, train_e.view(), short.view(), train_e.view(), short.view())
            .unwrap_err();
        assert!(matches!(err, TrainError::Fit(_)));
    }
}
