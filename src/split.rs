//! # Deterministic Splitting
//!
//! Train/test partitioning and k-fold index generation. Every function takes
//! the random source as an explicit `&mut StdRng` parameter, so the same seed
//! and the same input ordering always reproduce the same partition, and unit
//! tests never depend on hidden process-wide state.
//!
//! Two strategies exist because the two modalities split differently: the
//! clinical modality uses stratified random sampling, the image modality uses
//! a sorted positional half-split. The asymmetry is deliberate and named.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// The named split strategies used across the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    /// Label-stratified random sampling (clinical modality).
    StratifiedRandom,
    /// Ascending id sort, first half train, second half test (image modality).
    SortedHalf,
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitStrategy::StratifiedRandom => write!(f, "stratified-random"),
            SplitStrategy::SortedHalf => write!(f, "sorted-half"),
        }
    }
}

/// One side of a train/test partition, with row correspondence preserved
/// across all three fields.
#[derive(Debug, Clone)]
pub struct Subset {
    pub features: Array2<f64>,
    pub labels: Array1<u8>,
    pub ids: Vec<String>,
}

/// A complete train/test partition of the clinical population.
#[derive(Debug, Clone)]
pub struct SplitSets {
    pub train: Subset,
    pub test: Subset,
}

/// Index sets for one cross-validation fold.
#[derive(Debug, Clone)]
pub struct FoldIndices {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("split fraction must lie strictly between 0 and 1, got {0}")]
    InvalidFraction(f64),
    #[error(
        "label class {label} has only {count} samples, too few to place at least one in both the train and test subsets"
    )]
    InsufficientSamples { label: u8, count: usize },
    #[error("cannot build {k} folds from {n} samples")]
    TooFewSamplesForFolds { n: usize, k: usize },
    #[error("cross-validation requires at least 2 folds, got {0}")]
    TooFewFolds(usize),
}

/// Stratified random train/test split.
///
/// Rows are grouped by label, each group is shuffled with the provided rng,
/// and `round(test_fraction * group_len)` rows of each group go to the test
/// subset. Every class must land at least one row in each subset, otherwise
/// the split fails with [`SplitError::InsufficientSamples`] rather than
/// silently producing an empty class bucket.
pub fn stratified_split(
    features: &Array2<f64>,
    labels: &Array1<u8>,
    ids: &[String],
    test_fraction: f64,
    rng: &mut StdRng,
) -> Result<SplitSets, SplitError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(SplitError::InvalidFraction(test_fraction));
    }

    // BTreeMap keeps class iteration order stable across runs.
    let mut groups: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        groups.entry(label).or_default().push(i);
    }

    let mut train_idx = Vec::new();
    let mut test_idx = Vec::new();
    for (label, mut indices) in groups {
        let count = indices.len();
        let n_test = (test_fraction * count as f64).round() as usize;
        if n_test == 0 || n_test >= count {
            return Err(SplitError::InsufficientSamples { label, count });
        }
        indices.shuffle(rng);
        test_idx.extend_from_slice(&indices[..n_test]);
        train_idx.extend_from_slice(&indices[n_test..]);
    }

    Ok(SplitSets {
        train: take_subset(features, labels, ids, &train_idx),
        test: take_subset(features, labels, ids, &test_idx),
    })
}

/// Gathers a row subset, keeping feature/label/id correspondence.
pub fn take_subset(
    features: &Array2<f64>,
    labels: &Array1<u8>,
    ids: &[String],
    indices: &[usize],
) -> Subset {
    Subset {
        features: features.select(Axis(0), indices),
        labels: labels.select(Axis(0), indices),
        ids: indices.iter().map(|&i| ids[i].clone()).collect(),
    }
}

/// Shuffled, unstratified k-fold index generation.
///
/// A single shuffle of `0..n` is chunked into `k` folds whose sizes differ by
/// at most one (the first `n % k` folds take the extra row). Each fold's
/// validation set is the chunk; its train set is the complement. Validation
/// sets are pairwise disjoint and together cover the population.
pub fn kfold_indices(n: usize, k: usize, rng: &mut StdRng) -> Result<Vec<FoldIndices>, SplitError> {
    if k < 2 {
        return Err(SplitError::TooFewFolds(k));
    }
    if n < k {
        return Err(SplitError::TooFewSamplesForFolds { n, k });
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);

    let base = n / k;
    let remainder = n % k;
    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let size = base + usize::from(fold < remainder);
        let validation: Vec<usize> = order[start..start + size].to_vec();
        let train: Vec<usize> = order[..start]
            .iter()
            .chain(order[start + size..].iter())
            .copied()
            .collect();
        folds.push(FoldIndices { train, validation });
        start += size;
    }
    Ok(folds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn population(n: usize, n_positive: usize) -> (Array2<f64>, Array1<u8>, Vec<String>) {
        let features = Array2::from_shape_fn((n, 3), |(i, j)| (i * 3 + j) as f64);
        let labels = Array1::from_shape_fn(n, |i| u8::from(i < n_positive));
        let ids = (0..n).map(|i| format!("P{i:03}")).collect();
        (features, labels, ids)
    }

    #[test]
    fn same_seed_reproduces_the_same_partition() {
        let (features, labels, ids) = population(60, 18);
        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);
        let a = stratified_split(&features, &labels, &ids, 0.2, &mut rng_a).unwrap();
        let b = stratified_split(&features, &labels, &ids, 0.2, &mut rng_b).unwrap();
        assert_eq!(a.train.ids, b.train.ids);
        assert_eq!(a.test.ids, b.test.ids);
        assert_eq!(a.train.features, b.train.features);
    }

    #[test]
    fn split_is_disjoint_and_complete() {
        let (features, labels, ids) = population(60, 18);
        let mut rng = StdRng::seed_from_u64(7);
        let sets = stratified_split(&features, &labels, &ids, 0.25, &mut rng).unwrap();

        assert_eq!(sets.train.ids.len() + sets.test.ids.len(), 60);
        let train: HashSet<_> = sets.train.ids.iter().collect();
        let test: HashSet<_> = sets.test.ids.iter().collect();
        assert!(train.is_disjoint(&test));
    }

    #[test]
    fn stratification_preserves_class_ratios() {
        // 100 patients, 20 positive, fraction 0.2 => train 80 (16 positive),
        // test 20 (4 positive).
        let (features, labels, ids) = population(100, 20);
        let mut rng = StdRng::seed_from_u64(42);
        let sets = stratified_split(&features, &labels, &ids, 0.2, &mut rng).unwrap();

        assert_eq!(sets.train.ids.len(), 80);
        assert_eq!(sets.test.ids.len(), 20);
        let train_pos = sets.train.labels.iter().filter(|&&l| l == 1).count();
        let test_pos = sets.test.labels.iter().filter(|&&l| l == 1).count();
        assert_eq!(train_pos, 16);
        assert_eq!(test_pos, 4);
    }

    #[test]
    fn rows_keep_their_ids_after_the_split() {
        let (features, labels, ids) = population(40, 10);
        let mut rng = StdRng::seed_from_u64(3);
        let sets = stratified_split(&features, &labels, &ids, 0.2, &mut rng).unwrap();

        // Column 0 of the fixture encodes 3 * original row index.
        for (row, id) in sets.test.ids.iter().enumerate() {
            let original: usize = id[1..].parse().unwrap();
            assert_eq!(sets.test.features[[row, 0]], (original * 3) as f64);
            assert_eq!(sets.test.labels[row], labels[original]);
        }
    }

    #[test]
    fn tiny_class_fails_loudly() {
        let (features, _, ids) = population(20, 0);
        let mut labels = Array1::zeros(20);
        labels[0] = 1; // a single positive sample cannot be stratified
        let mut rng = StdRng::seed_from_u64(1);
        let err = stratified_split(&features, &labels, &ids, 0.2, &mut rng).unwrap_err();
        match err {
            SplitError::InsufficientSamples { label, count } => {
                assert_eq!(label, 1);
                assert_eq!(count, 1);
            }
            other => panic!("expected InsufficientSamples, got {other:?}"),
        }
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        let (features, labels, ids) = population(10, 5);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            stratified_split(&features, &labels, &ids, 0.0, &mut rng),
            Err(SplitError::InvalidFraction(_))
        ));
        assert!(matches!(
            stratified_split(&features, &labels, &ids, 1.0, &mut rng),
            Err(SplitError::InvalidFraction(_))
        ));
    }

    #[test]
    fn five_folds_over_fifty_samples_partition_the_population() {
        let mut rng = StdRng::seed_from_u64(42);
        let folds = kfold_indices(50, 5, &mut rng).unwrap();
        assert_eq!(folds.len(), 5);

        let mut seen = HashSet::new();
        for fold in &folds {
            assert_eq!(fold.validation.len(), 10);
            assert_eq!(fold.train.len(), 40);
            for &i in &fold.validation {
                assert!(seen.insert(i), "validation sets must be disjoint");
            }
            let train: HashSet<_> = fold.train.iter().collect();
            assert!(fold.validation.iter().all(|i| !train.contains(i)));
        }
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn uneven_folds_differ_by_at_most_one() {
        let mut rng = StdRng::seed_from_u64(9);
        let folds = kfold_indices(13, 4, &mut rng).unwrap();
        let sizes: Vec<usize> = folds.iter().map(|f| f.validation.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3, 3]);
    }

    #[test]
    fn kfold_rejects_degenerate_parameters() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            kfold_indices(10, 1, &mut rng),
            Err(SplitError::TooFewFolds(1))
        ));
        assert!(matches!(
            kfold_indices(3, 5, &mut rng),
            Err(SplitError::TooFewSamplesForFolds { n: 3, k: 5 })
        ));
    }
}
