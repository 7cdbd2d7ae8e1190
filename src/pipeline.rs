//! # Pipeline Orchestration
//!
//! The four entry points the binary exposes, in the order a study runs them:
//! `generate_data` (load, split, embed, persist), `cross_validate` (k-fold
//! embedding + scoring over the full clinical population), `train` and `test`
//! (delegated to the configured [`Trainer`] / [`Evaluator`]).
//!
//! Randomness is confined to a single `StdRng` seeded from the config, so a
//! given config file reproduces the same artifacts byte for byte.

use crate::config::{ConfigError, PipelineConfig};
use crate::data::{self, ClinicalData, DataError};
use crate::embed::{ClinicalEmbedderConfig, EmbedError, Embedder, EmbedderFactory};
use crate::metrics::{aggregate_folds, AggregationError, FoldMetrics};
use crate::persist::{self, PersistError};
use crate::quanv::{PngDataset, QuanvCircuit, QuanvEmbedder};
use crate::split::{self, SplitError, SplitStrategy, Subset};
use crate::trainer::{Evaluator, FoldScorer, TrainContext, TrainError, Trainer};
use log::info;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use thiserror::Error;

/// Which embedding modalities `generate_data` produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Clinical,
    Image,
    Both,
}

impl Modality {
    fn includes_clinical(self) -> bool {
        matches!(self, Modality::Clinical | Modality::Both)
    }

    fn includes_image(self) -> bool {
        matches!(self, Modality::Image | Modality::Both)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub modality: Modality,
    /// Skip generation entirely and reuse artifacts already on disk.
    pub use_pregen: bool,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error("clinical embedding failed: {0}")]
    ClinicalEmbedding(#[source] EmbedError),
    #[error("image embedding failed: {0}")]
    ImageEmbedding(#[source] EmbedError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("fold {fold} failed: {source}")]
    Fold {
        fold: usize,
        #[source]
        source: Box<PipelineError>,
    },
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Train(#[from] TrainError),
}

pub struct Pipeline {
    config: PipelineConfig,
    embedder_factory: Box<dyn EmbedderFactory>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let factory = ClinicalEmbedderConfig {
            embedding_dim: config.embedding_dim,
            seed: config.seed,
            ..ClinicalEmbedderConfig::default()
        };
        Self::with_embedder_factory(config, Box::new(factory))
    }

    /// Builds a pipeline around a caller-supplied embedding model. Tests use
    /// this to drive the orchestrator with a deterministic stub.
    pub fn with_embedder_factory(
        config: PipelineConfig,
        embedder_factory: Box<dyn EmbedderFactory>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            embedder_factory,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Loads raw inputs, splits them, embeds each modality, and persists all
    /// artifacts under the configured output directory.
    pub fn generate_data(&self, options: GenerateOptions) -> Result<(), PipelineError> {
        if options.use_pregen {
            info!(
                "reusing pre-generated artifacts under {}",
                self.config.output_dir.display()
            );
            return Ok(());
        }

        let clinical = data::load_clinical_data(
            &self.config.clinical_data,
            &self.config.id_column,
            &self.config.target_column,
        )?;
        info!(
            "loaded {} patients with {} clinical features",
            clinical.ids.len(),
            clinical.feature_names.len()
        );

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        info!(
            "splitting the clinical population ({})",
            SplitStrategy::StratifiedRandom
        );
        let sets = split::stratified_split(
            &clinical.features,
            &clinical.labels,
            &clinical.ids,
            self.config.test_fraction,
            &mut rng,
        )?;

        let layout = self.config.layout();
        persist::write_matrix_csv(&layout.train_data(), sets.train.features.view())?;
        persist::write_matrix_csv(&layout.test_data(), sets.test.features.view())?;
        self.write_labels(&layout.train_labels(), &sets.train)?;
        self.write_labels(&layout.test_labels(), &sets.test)?;
        info!(
            "persisted {} train and {} test rows",
            sets.train.ids.len(),
            sets.test.ids.len()
        );

        if options.modality.includes_clinical() {
            self.generate_clinical(&sets.train, &sets.test)?;
        }
        if options.modality.includes_image() {
            self.generate_image(&clinical)?;
        }
        Ok(())
    }

    fn write_labels(&self, path: &std::path::Path, subset: &Subset) -> Result<(), PersistError> {
        persist::write_label_table(
            path,
            &subset.ids,
            subset.labels.view(),
            &self.config.id_column,
            &self.config.target_column,
        )
    }

    /// Fits the clinical embedder on the train subset only, then embeds both
    /// subsets and persists the tensors next to their label tables.
    fn generate_clinical(&self, train: &Subset, test: &Subset) -> Result<(), PipelineError> {
        let mut embedder = self.embedder_factory.build();
        embedder
            .fit(train.features.view(), train.labels.view())
            .map_err(PipelineError::ClinicalEmbedding)?;

        let train_embeddings = embedder
            .embed(train.features.view())
            .map_err(PipelineError::ClinicalEmbedding)?;
        let test_embeddings = embedder
            .embed(test.features.view())
            .map_err(PipelineError::ClinicalEmbedding)?;

        let layout = self.config.layout();
        persist::write_npy_atomic(&layout.train_clinical_embeddings(), &train_embeddings)?;
        persist::write_npy_atomic(&layout.test_clinical_embeddings(), &test_embeddings)?;
        info!(
            "clinical embeddings persisted: train {:?}, test {:?}",
            train_embeddings.shape(),
            test_embeddings.shape()
        );
        Ok(())
    }

    /// Image-modality generation. Patient ids are sorted ascending and the
    /// first half goes to train ([`SplitStrategy::SortedHalf`]); labels come
    /// from the clinical table, and an image without a clinical row fails the
    /// run rather than receiving a silent default.
    fn generate_image(&self, clinical: &ClinicalData) -> Result<(), PipelineError> {
        let dataset = PngDataset::load(&self.config.image_dir)?;
        let ids = dataset.patient_ids();
        info!(
            "loaded {} image tiles, splitting them ({})",
            ids.len(),
            SplitStrategy::SortedHalf
        );
        let (train_ids, test_ids) = ids.split_at(ids.len() / 2);

        let label_map: BTreeMap<&str, u8> = clinical
            .ids
            .iter()
            .zip(clinical.labels.iter())
            .map(|(id, &label)| (id.as_str(), label))
            .collect();
        let lookup = |ids: &[String]| -> Result<Array1<u8>, DataError> {
            ids.iter()
                .map(|id| {
                    label_map
                        .get(id.as_str())
                        .copied()
                        .ok_or_else(|| DataError::UnknownPatient(id.clone()))
                })
                .collect()
        };
        let train_labels = lookup(train_ids)?;
        let test_labels = lookup(test_ids)?;

        let circuit = QuanvCircuit::new(self.config.n_atoms, self.config.seed);
        let embedder = QuanvEmbedder::new(
            circuit,
            self.config.patch_size,
            self.config.embedding_dim,
            self.config.seed,
        )
        .map_err(PipelineError::ImageEmbedding)?;
        let train_embeddings = embedder
            .embed_patients(&dataset, train_ids)
            .map_err(PipelineError::ImageEmbedding)?;
        let test_embeddings = embedder
            .embed_patients(&dataset, test_ids)
            .map_err(PipelineError::ImageEmbedding)?;

        let layout = self.config.layout();
        persist::write_npy_atomic(&layout.train_image_embeddings(), &train_embeddings)?;
        persist::write_npy_atomic(&layout.test_image_embeddings(), &test_embeddings)?;
        persist::write_label_table(
            &layout.train_image_labels(),
            train_ids,
            train_labels.view(),
            &self.config.id_column,
            &self.config.target_column,
        )?;
        persist::write_label_table(
            &layout.test_image_labels(),
            test_ids,
            test_labels.view(),
            &self.config.id_column,
            &self.config.target_column,
        )?;
        info!(
            "image embeddings persisted: train {:?}, test {:?}",
            train_embeddings.shape(),
            test_embeddings.shape()
        );
        Ok(())
    }

    /// K-fold cross-validation over the full clinical population.
    ///
    /// Each fold fits a fresh clinical embedder on its train rows, embeds
    /// both sides, persists the fold artifacts, and hands the tensors to the
    /// scorer. Metric values are averaged across folds at the end; a run that
    /// produced no folds is an error, not an average over nothing.
    pub fn cross_validate(
        &self,
        scorer: &dyn FoldScorer,
        k: usize,
    ) -> Result<BTreeMap<String, f64>, PipelineError> {
        let clinical = data::load_clinical_data(
            &self.config.clinical_data,
            &self.config.id_column,
            &self.config.target_column,
        )?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let folds = split::kfold_indices(clinical.ids.len(), k, &mut rng)?;
        info!("cross-validating over {k} folds of {} patients", clinical.ids.len());

        let layout = self.config.layout();
        let mut fold_metrics = Vec::with_capacity(folds.len());
        for (fold, indices) in folds.iter().enumerate() {
            let run = || -> Result<FoldMetrics, PipelineError> {
                let train = split::take_subset(
                    &clinical.features,
                    &clinical.labels,
                    &clinical.ids,
                    &indices.train,
                );
                let val = split::take_subset(
                    &clinical.features,
                    &clinical.labels,
                    &clinical.ids,
                    &indices.validation,
                );

                let mut embedder = self.embedder_factory.build();
                embedder
                    .fit(train.features.view(), train.labels.view())
                    .map_err(PipelineError::ClinicalEmbedding)?;
                let train_embeddings = embedder
                    .embed(train.features.view())
                    .map_err(PipelineError::ClinicalEmbedding)?;
                let val_embeddings = embedder
                    .embed(val.features.view())
                    .map_err(PipelineError::ClinicalEmbedding)?;

                persist::write_npy_atomic(&layout.fold_train_embeddings(fold), &train_embeddings)?;
                persist::write_npy_atomic(&layout.fold_val_embeddings(fold), &val_embeddings)?;
                self.write_labels(&layout.fold_train_labels(fold), &train)?;
                self.write_labels(&layout.fold_val_labels(fold), &val)?;

                let metrics = scorer.score_fold(
                    fold,
                    train_embeddings.view(),
                    train.labels.view(),
                    val_embeddings.view(),
                    val.labels.view(),
                )?;
                for (name, value) in &metrics.values {
                    info!("fold {fold} {name}: {value:.4}");
                }
                Ok(metrics)
            };
            let metrics = run().map_err(|source| PipelineError::Fold {
                fold,
                source: Box::new(source),
            })?;
            fold_metrics.push(metrics);
        }

        let averaged = aggregate_folds(&fold_metrics)?;
        for (name, value) in &averaged {
            info!("average {name}: {value:.4}");
        }
        Ok(averaged)
    }

    pub fn train(
        &self,
        trainer: &mut dyn Trainer,
        ctx: &TrainContext,
    ) -> Result<(), PipelineError> {
        let layout = self.config.layout();
        trainer.train(&layout, ctx)?;
        Ok(())
    }

    pub fn test(
        &self,
        evaluator: &dyn Evaluator,
        ctx: &TrainContext,
    ) -> Result<FoldMetrics, PipelineError> {
        let layout = self.config.layout();
        let metrics = evaluator.evaluate(&layout, ctx)?;
        for (name, value) in &metrics.values {
            info!("test {name}: {value:.4}");
        }
        Ok(metrics)
    }
}
