//! Per-fold metric records and cross-validation aggregation.

use std::collections::BTreeMap;
use thiserror::Error;

/// Metrics reported for a single cross-validation fold (or a single test
/// run, with `fold` 0).
#[derive(Debug, Clone, PartialEq)]
pub struct FoldMetrics {
    pub fold: usize,
    pub values: BTreeMap<String, f64>,
}

impl FoldMetrics {
    pub fn new(fold: usize) -> Self {
        Self {
            fold,
            values: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }
}

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("cross-validation produced no fold metrics to aggregate")]
    NoFolds,
}

/// Averages each metric across folds. An empty collection is an error, never
/// a silent division over nothing.
pub fn aggregate_folds(
    folds: &[FoldMetrics],
) -> Result<BTreeMap<String, f64>, AggregationError> {
    if folds.is_empty() {
        return Err(AggregationError::NoFolds);
    }

    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for fold in folds {
        for (name, value) in &fold.values {
            let entry = sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    Ok(sums
        .into_iter()
        .map(|(name, (sum, count))| (name, sum / count as f64))
        .collect())
}
