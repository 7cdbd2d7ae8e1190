//! # Embedding Model Boundary and Clinical Embedder
//!
//! The orchestrator talks to embedding models through the [`Embedder`] trait:
//! fit on a batch of raw rows with labels, then map raw rows to fixed-shape
//! embedding tensors. `embed` takes no labels, so test labels cannot leak
//! into inference by construction.
//!
//! [`ClinicalEmbedder`] is the concrete clinical-modality model: a seeded
//! per-feature projection table modulated by a relevance vector fitted with
//! logistic-regression gradient descent on the train subset. Output shape is
//! `[rows, n_features, embedding_dim]`.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("embedding model failed to fit: {0}")]
    ModelFit(String),
    #[error("generated embedding has shape {actual:?}, expected {expected:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("embed was called before the model was fitted")]
    NotFitted,
    #[error("feature count mismatch: model was fitted on {fitted} features, embed received {got}")]
    FeatureMismatch { fitted: usize, got: usize },
    #[error("patient id '{0}' is not present in the image dataset")]
    UnknownPatient(String),
    #[error("a {patch}x{patch} patch has too few pixels to encode {n_atoms} qubits")]
    PatchTooSmall { patch: usize, n_atoms: usize },
    #[error(
        "image for patient '{id}' is {height}x{width}, which does not tile into {patch}x{patch} patches"
    )]
    PatchMismatch {
        id: String,
        height: usize,
        width: usize,
        patch: usize,
    },
    #[error(
        "image for patient '{id}' yields a {rows}x{cols} patch grid, expected {expected_rows}x{expected_cols}"
    )]
    GridMismatch {
        id: String,
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
    #[error("no patient ids supplied for image embedding")]
    EmptyBatch,
}

/// A batch embedding model: fit once on train data, then map raw feature
/// rows to fixed-shape embedding tensors.
pub trait Embedder {
    fn fit(&mut self, features: ArrayView2<f64>, labels: ArrayView1<u8>) -> Result<(), EmbedError>;

    /// Maps raw rows to `[rows, seq_len, embedding_dim]`. Labels are not an
    /// input here; inference must work from the fitted state alone.
    fn embed(&self, features: ArrayView2<f64>) -> Result<Array3<f64>, EmbedError>;
}

/// Builds a fresh embedding model per fit. Cross-validation fits one model
/// per fold, so the orchestrator holds a factory rather than a single model.
pub trait EmbedderFactory {
    fn build(&self) -> Box<dyn Embedder>;
}

impl EmbedderFactory for ClinicalEmbedderConfig {
    fn build(&self) -> Box<dyn Embedder> {
        Box::new(ClinicalEmbedder::new(self.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct ClinicalEmbedderConfig {
    pub embedding_dim: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for ClinicalEmbedderConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 128,
            epochs: 200,
            learning_rate: 0.1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
struct FittedState {
    /// Learned per-feature relevance weights, length `n_features`.
    relevance: Array1<f64>,
    /// Fixed seeded projection table, shape `[n_features, embedding_dim]`.
    projection: Array2<f64>,
}

/// Clinical feature-projection embedder. Deterministic given its config and
/// the training data.
#[derive(Debug, Clone)]
pub struct ClinicalEmbedder {
    config: ClinicalEmbedderConfig,
    fitted: Option<FittedState>,
}

impl ClinicalEmbedder {
    pub fn new(config: ClinicalEmbedderConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    /// Logistic-regression relevance fit, full-batch gradient descent.
    fn fit_relevance(
        &self,
        features: ArrayView2<f64>,
        labels: ArrayView1<u8>,
    ) -> Result<Array1<f64>, EmbedError> {
        let n = features.nrows();
        let d = features.ncols();
        let y: Array1<f64> = labels.iter().map(|&l| f64::from(l)).collect();

        let mut weights = Array1::<f64>::zeros(d);
        let mut bias = 0.0_f64;
        for epoch in 0..self.config.epochs {
            let z = features.dot(&weights) + bias;
            let p = z.mapv(|v| 1.0 / (1.0 + (-v).exp()));
            let residual = &p - &y;

            let loss = -(y
                .iter()
                .zip(p.iter())
                .map(|(&yi, &pi)| {
                    let pi = pi.clamp(1e-12, 1.0 - 1e-12);
                    yi * pi.ln() + (1.0 - yi) * (1.0 - pi).ln()
                })
                .sum::<f64>())
                / n as f64;
            if !loss.is_finite() {
                return Err(EmbedError::ModelFit(format!(
                    "non-finite loss at epoch {epoch}"
                )));
            }

            let grad_w = features.t().dot(&residual) / n as f64;
            let grad_b = residual.sum() / n as f64;
            weights = weights - self.config.learning_rate * &grad_w;
            bias -= self.config.learning_rate * grad_b;
        }

        if weights.iter().any(|w| !w.is_finite()) {
            return Err(EmbedError::ModelFit(
                "non-finite weights after fitting".to_string(),
            ));
        }
        Ok(weights)
    }
}

impl Embedder for ClinicalEmbedder {
    fn fit(&mut self, features: ArrayView2<f64>, labels: ArrayView1<u8>) -> Result<(), EmbedError> {
        if features.nrows() == 0 || features.ncols() == 0 {
            return Err(EmbedError::ModelFit(
                "cannot fit on an empty training set".to_string(),
            ));
        }
        if features.nrows() != labels.len() {
            return Err(EmbedError::ModelFit(format!(
                "{} feature rows but {} labels",
                features.nrows(),
                labels.len()
            )));
        }

        let relevance = self.fit_relevance(features, labels)?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let scale = 1.0 / (self.config.embedding_dim as f64).sqrt();
        let projection = Array2::from_shape_fn((features.ncols(), self.config.embedding_dim), |_| {
            rng.gen_range(-1.0..1.0) * scale
        });

        self.fitted = Some(FittedState {
            relevance,
            projection,
        });
        Ok(())
    }

    fn embed(&self, features: ArrayView2<f64>) -> Result<Array3<f64>, EmbedError> {
        let state = self.fitted.as_ref().ok_or(EmbedError::NotFitted)?;
        let d = state.relevance.len();
        if features.ncols() != d {
            return Err(EmbedError::FeatureMismatch {
                fitted: d,
                got: features.ncols(),
            });
        }

        let n = features.nrows();
        let dim = self.config.embedding_dim;
        let mut out = Array3::zeros((n, d, dim));
        for i in 0..n {
            for j in 0..d {
                let modulated = features[[i, j]] * (1.0 + state.relevance[j].tanh());
                for k in 0..dim {
                    out[[i, j, k]] = modulated * state.projection[[j, k]];
                }
            }
        }

        let expected = [n, d, dim];
        if out.shape() != expected {
            return Err(EmbedError::Shape {
                expected: expected.to_vec(),
                actual: out.shape().to_vec(),
            });
        }
        Ok(out)
    }
}
