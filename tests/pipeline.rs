//! End-to-end pipeline tests over synthetic clinical tables and PNG tiles.

use image::{GrayImage, Luma};
use ndarray::{Array3, ArrayView1, ArrayView2, ArrayView3};
use oncoembed::config::PipelineConfig;
use oncoembed::data::DataError;
use oncoembed::embed::{EmbedError, Embedder, EmbedderFactory};
use oncoembed::metrics::FoldMetrics;
use oncoembed::persist;
use oncoembed::pipeline::{GenerateOptions, Modality, Pipeline, PipelineError};
use oncoembed::trainer::{FoldScorer, TrainError};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const N_PATIENTS: usize = 20;

fn patient_id(i: usize) -> String {
    format!("HCC_{i:03}")
}

/// Writes a clinical table with one numeric, one categorical, and one
/// correlated feature per patient. 8 of 20 patients are progressors.
fn write_clinical_csv(path: &Path) {
    let mut file = fs::File::create(path).unwrap();
    writeln!(file, "TCIA_ID,Censored_0_progressed_1,age,child_pugh,afp").unwrap();
    for i in 0..N_PATIENTS {
        let label = u8::from(i % 5 < 2);
        let age = 45 + (i * 2) % 30;
        let grade = ["A", "B", "C"][i % 3];
        let afp = if label == 1 { 400.0 + i as f64 } else { 12.0 + i as f64 };
        writeln!(file, "{},{},{},{},{}", patient_id(i), label, age, grade, afp).unwrap();
    }
}

/// One 12x12 grayscale tile per patient, with per-patient intensity so
/// embeddings differ across rows.
fn write_png_tiles(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    for i in 0..N_PATIENTS {
        let tile = GrayImage::from_fn(12, 12, |x, y| {
            Luma([((x * 7 + y * 11 + i as u32 * 13) % 256) as u8])
        });
        tile.save(dir.join(format!("{}.png", patient_id(i)))).unwrap();
    }
}

fn fixture_config(root: &Path) -> PipelineConfig {
    let clinical_data = root.join("clinical_Data.csv");
    let image_dir = root.join("png");
    write_clinical_csv(&clinical_data);
    write_png_tiles(&image_dir);

    PipelineConfig {
        clinical_data,
        image_dir,
        output_dir: root.join("out"),
        test_fraction: 0.25,
        embedding_dim: 8,
        patch_size: 6,
        n_atoms: 4,
        folds: 4,
        ..PipelineConfig::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmbedderCall {
    Fit(usize),
    Embed(usize),
}

/// Records every call so tests can assert the fit-before-embed ordering the
/// orchestrator must uphold.
struct RecordingEmbedder {
    calls: Arc<Mutex<Vec<EmbedderCall>>>,
    fitted: bool,
}

impl Embedder for RecordingEmbedder {
    fn fit(&mut self, features: ArrayView2<f64>, labels: ArrayView1<u8>) -> Result<(), EmbedError> {
        assert_eq!(features.nrows(), labels.len());
        self.calls
            .lock()
            .unwrap()
            .push(EmbedderCall::Fit(features.nrows()));
        self.fitted = true;
        Ok(())
    }

    fn embed(&self, features: ArrayView2<f64>) -> Result<Array3<f64>, EmbedError> {
        if !self.fitted {
            return Err(EmbedError::NotFitted);
        }
        self.calls
            .lock()
            .unwrap()
            .push(EmbedderCall::Embed(features.nrows()));
        Ok(Array3::zeros((features.nrows(), features.ncols(), 4)))
    }
}

struct RecordingFactory {
    calls: Arc<Mutex<Vec<EmbedderCall>>>,
}

impl EmbedderFactory for RecordingFactory {
    fn build(&self) -> Box<dyn Embedder> {
        Box::new(RecordingEmbedder {
            calls: Arc::clone(&self.calls),
            fitted: false,
        })
    }
}

struct StubScorer;

impl FoldScorer for StubScorer {
    fn score_fold(
        &self,
        fold: usize,
        train_embeddings: ArrayView3<f64>,
        train_labels: ArrayView1<u8>,
        val_embeddings: ArrayView3<f64>,
        val_labels: ArrayView1<u8>,
    ) -> Result<FoldMetrics, TrainError> {
        assert_eq!(train_embeddings.shape()[0], train_labels.len());
        assert_eq!(val_embeddings.shape()[0], val_labels.len());
        let mut metrics = FoldMetrics::new(fold);
        metrics.insert("accuracy", 0.5 + fold as f64 * 0.1);
        Ok(metrics)
    }
}

struct FailingScorer;

impl FoldScorer for FailingScorer {
    fn score_fold(
        &self,
        _fold: usize,
        _train_embeddings: ArrayView3<f64>,
        _train_labels: ArrayView1<u8>,
        _val_embeddings: ArrayView3<f64>,
        _val_labels: ArrayView1<u8>,
    ) -> Result<FoldMetrics, TrainError> {
        Err(TrainError::Fit("synthetic failure".to_string()))
    }
}

#[test]
fn generate_data_persists_aligned_artifacts_for_both_modalities() {
    let dir = TempDir::new().unwrap();
    let config = fixture_config(dir.path());
    let layout = config.layout();
    let pipeline = Pipeline::new(config).unwrap();

    pipeline
        .generate_data(GenerateOptions {
            modality: Modality::Both,
            use_pregen: false,
        })
        .unwrap();

    // Clinical modality: embedding rows match label-table rows on each side.
    let train = persist::read_embeddings3(&layout.train_clinical_embeddings()).unwrap();
    let test = persist::read_embeddings3(&layout.test_clinical_embeddings()).unwrap();
    let train_table = persist::read_label_table(&layout.train_labels()).unwrap();
    let test_table = persist::read_label_table(&layout.test_labels()).unwrap();
    assert_eq!(train.shape()[0], train_table.ids.len());
    assert_eq!(test.shape()[0], test_table.ids.len());
    assert_eq!(train.shape()[0] + test.shape()[0], N_PATIENTS);
    assert_eq!(train.shape()[2], 8);
    assert!(layout.train_data().exists());
    assert!(layout.test_data().exists());

    // Train/test patient sets are disjoint.
    let train_ids: HashSet<_> = train_table.ids.iter().collect();
    assert!(test_table.ids.iter().all(|id| !train_ids.contains(id)));

    // Image modality: first half of the sorted ids is the train side.
    let image_train = persist::read_embeddings4(&layout.train_image_embeddings()).unwrap();
    let image_table = persist::read_label_table(&layout.train_image_labels()).unwrap();
    assert_eq!(image_train.shape(), &[10, 2, 2, 8]);
    let expected: Vec<String> = (0..10).map(patient_id).collect();
    assert_eq!(image_table.ids, expected);
}

#[test]
fn clinical_only_generation_skips_image_artifacts() {
    let dir = TempDir::new().unwrap();
    let config = fixture_config(dir.path());
    let layout = config.layout();
    let pipeline = Pipeline::new(config).unwrap();

    pipeline
        .generate_data(GenerateOptions {
            modality: Modality::Clinical,
            use_pregen: false,
        })
        .unwrap();

    assert!(layout.train_clinical_embeddings().exists());
    assert!(!layout.train_image_embeddings().exists());
    assert!(!layout.train_image_labels().exists());
}

#[test]
fn use_pregen_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let config = fixture_config(dir.path());
    let layout = config.layout();
    let pipeline = Pipeline::new(config).unwrap();

    pipeline
        .generate_data(GenerateOptions {
            modality: Modality::Both,
            use_pregen: true,
        })
        .unwrap();

    assert!(!layout.root().exists());
}

#[test]
fn generation_is_deterministic_across_runs() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    for dir in [&dir_a, &dir_b] {
        let pipeline = Pipeline::new(fixture_config(dir.path())).unwrap();
        pipeline
            .generate_data(GenerateOptions {
                modality: Modality::Clinical,
                use_pregen: false,
            })
            .unwrap();
    }

    let labels_a = fs::read(fixture_layout(dir_a.path()).train_labels()).unwrap();
    let labels_b = fs::read(fixture_layout(dir_b.path()).train_labels()).unwrap();
    assert_eq!(labels_a, labels_b);

    let emb_a = fs::read(fixture_layout(dir_a.path()).train_clinical_embeddings()).unwrap();
    let emb_b = fs::read(fixture_layout(dir_b.path()).train_clinical_embeddings()).unwrap();
    assert_eq!(emb_a, emb_b);
}

fn fixture_layout(root: &Path) -> oncoembed::config::ArtifactLayout {
    oncoembed::config::ArtifactLayout::new(&root.join("out"))
}

#[test]
fn image_without_a_clinical_row_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let config = fixture_config(dir.path());
    let orphan = GrayImage::from_fn(12, 12, |_, _| Luma([128]));
    orphan.save(config.image_dir.join("HCC_999.png")).unwrap();
    let pipeline = Pipeline::new(config).unwrap();

    let err = pipeline
        .generate_data(GenerateOptions {
            modality: Modality::Image,
            use_pregen: false,
        })
        .unwrap_err();
    match err {
        PipelineError::Data(DataError::UnknownPatient(id)) => assert_eq!(id, "HCC_999"),
        other => panic!("expected UnknownPatient, got {other}"),
    }
}

#[test]
fn embedder_fits_on_train_rows_before_any_test_row_is_embedded() {
    let dir = TempDir::new().unwrap();
    let config = fixture_config(dir.path());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::with_embedder_factory(
        config,
        Box::new(RecordingFactory {
            calls: Arc::clone(&calls),
        }),
    )
    .unwrap();

    pipeline
        .generate_data(GenerateOptions {
            modality: Modality::Clinical,
            use_pregen: false,
        })
        .unwrap();

    // 20 patients at fraction 0.25: one fit on the 15 train rows, then the
    // train embed, then the 5 test rows. Test rows never reach fit.
    let calls = calls.lock().unwrap();
    assert_eq!(
        *calls,
        vec![
            EmbedderCall::Fit(15),
            EmbedderCall::Embed(15),
            EmbedderCall::Embed(5),
        ]
    );
}

#[test]
fn cross_validation_fits_a_fresh_embedder_per_fold() {
    let dir = TempDir::new().unwrap();
    let config = fixture_config(dir.path());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::with_embedder_factory(
        config,
        Box::new(RecordingFactory {
            calls: Arc::clone(&calls),
        }),
    )
    .unwrap();

    pipeline.cross_validate(&StubScorer, 4).unwrap();

    // 20 patients in 4 folds: each fold fits on its 15 train rows, embeds
    // them, then embeds its 5 validation rows.
    let calls = calls.lock().unwrap();
    let per_fold = [
        EmbedderCall::Fit(15),
        EmbedderCall::Embed(15),
        EmbedderCall::Embed(5),
    ];
    let expected: Vec<EmbedderCall> = (0..4).flat_map(|_| per_fold).collect();
    assert_eq!(*calls, expected);
}

#[test]
fn cross_validation_aggregates_and_persists_fold_artifacts() {
    let dir = TempDir::new().unwrap();
    let config = fixture_config(dir.path());
    let layout = config.layout();
    let pipeline = Pipeline::new(config).unwrap();

    let averaged = pipeline.cross_validate(&StubScorer, 4).unwrap();
    // StubScorer reports 0.5, 0.6, 0.7, 0.8 across the four folds.
    assert!((averaged["accuracy"] - 0.65).abs() < 1e-12);

    let mut seen = HashSet::new();
    for fold in 0..4 {
        let embeddings = persist::read_embeddings3(&layout.fold_val_embeddings(fold)).unwrap();
        let table = persist::read_label_table(&layout.fold_val_labels(fold)).unwrap();
        assert_eq!(embeddings.shape()[0], table.ids.len());
        assert!(layout.fold_train_embeddings(fold).exists());
        assert!(layout.fold_train_labels(fold).exists());
        for id in table.ids {
            assert!(seen.insert(id), "validation sets must be disjoint");
        }
    }
    assert_eq!(seen.len(), N_PATIENTS);
}

#[test]
fn a_failing_scorer_reports_its_fold() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new(fixture_config(dir.path())).unwrap();

    let err = pipeline.cross_validate(&FailingScorer, 4).unwrap_err();
    match err {
        PipelineError::Fold { fold, .. } => assert_eq!(fold, 0),
        other => panic!("expected a fold error, got {other}"),
    }
}
