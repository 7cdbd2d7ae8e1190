//! # Clinical Data Loading and Preprocessing
//!
//! This module is the exclusive entry point for the clinical modality. It
//! reads the tabular clinical file (CSV), validates it against the configured
//! schema (a unique id column, a binary target column, and feature columns),
//! and transforms it into the aligned `ndarray` structures the rest of the
//! pipeline consumes.
//!
//! - Aligned output: row `i` of `features`, `labels`, and `ids` always refers
//!   to the same patient. Every later artifact inherits this correspondence.
//! - User-centric errors: failures are assumed to be input errors, and the
//!   `DataError` enum is designed to give actionable feedback.
//! - Deterministic encoding: non-numeric feature columns are label-encoded by
//!   sorted unique value, so the same file always produces the same matrix.

use itertools::Itertools;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Validated clinical data, ready for splitting and embedding.
#[derive(Debug, Clone)]
pub struct ClinicalData {
    /// Standardised feature matrix, shape `[n_patients, n_features]`.
    pub features: Array2<f64>,
    /// Binary progression labels, one per patient.
    pub labels: Array1<u8>,
    /// Patient identifiers, one per row of `features`.
    pub ids: Vec<String>,
    /// Feature column names in matrix column order.
    pub feature_names: Vec<String>,
}

/// A comprehensive error type for all data loading and validation failures,
/// covering both the clinical table and the image directory.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error(
        "the required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "missing or null values were found in column '{0}'. This pipeline requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error("non-finite values (NaN or Infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error(
        "column '{column_name}' could not be converted to the expected type '{expected_type}' (found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("the target column '{column}' must contain only 0 and 1, found {value}")]
    NonBinaryTarget { column: String, value: f64 },
    #[error("duplicate patient id '{0}' in the id column")]
    DuplicateId(String),
    #[error("input file '{0}' contains no data rows")]
    EmptyTable(PathBuf),
    #[error("input file has no feature columns beyond the id and target columns")]
    NoFeatureColumns,
    #[error("image directory '{0}' contains no .png files")]
    EmptyImageDirectory(PathBuf),
    #[error("failed to decode image '{path}': {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("image file '{0}' has a non-UTF-8 name and cannot be used as a patient id")]
    BadImageName(PathBuf),
    #[error("patient id '{0}' has image data but no clinical label")]
    UnknownPatient(String),
}

/// Loads and validates the clinical table, returning aligned
/// (features, labels, ids) with all feature columns numeric and standardised.
pub fn load_clinical_data(
    path: &Path,
    id_column: &str,
    target_column: &str,
) -> Result<ClinicalData, DataError> {
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let df = CsvReader::new(file)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::EmptyTable(path.to_path_buf()));
    }

    let column_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for required in [id_column, target_column] {
        if !column_names.iter().any(|c| c == required) {
            return Err(DataError::ColumnNotFound(required.to_string()));
        }
    }

    let ids = extract_id_column(&df, id_column)?;
    let labels = extract_target_column(&df, target_column)?;

    let feature_names: Vec<String> = column_names
        .into_iter()
        .filter(|c| c != id_column && c != target_column)
        .collect();
    if feature_names.is_empty() {
        return Err(DataError::NoFeatureColumns);
    }

    let n = df.height();
    let mut features = Array2::zeros((n, feature_names.len()));
    for (j, name) in feature_names.iter().enumerate() {
        let column = extract_feature_column(&df, name)?;
        let column = standardise(column);
        for (i, value) in column.into_iter().enumerate() {
            features[[i, j]] = value;
        }
    }

    Ok(ClinicalData {
        features,
        labels: Array1::from_vec(labels),
        ids,
        feature_names,
    })
}

/// Plain-text rendering of a cell, without the surrounding quotes polars
/// adds when displaying string values.
fn cell_text(value: AnyValue) -> String {
    match value {
        AnyValue::String(s) => s.to_string(),
        AnyValue::StringOwned(s) => s.to_string(),
        other => other.to_string(),
    }
}

fn extract_id_column(df: &DataFrame, id_column: &str) -> Result<Vec<String>, DataError> {
    let series = df.column(id_column)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(id_column.to_string()));
    }

    let mut seen = HashSet::with_capacity(df.height());
    let mut ids = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let value = series.get(i).unwrap_or(AnyValue::Null);
        let text = cell_text(value);
        if text.is_empty() {
            return Err(DataError::MissingValuesFound(id_column.to_string()));
        }
        if !seen.insert(text.clone()) {
            return Err(DataError::DuplicateId(text));
        }
        ids.push(text);
    }
    Ok(ids)
}

fn extract_target_column(df: &DataFrame, target_column: &str) -> Result<Vec<u8>, DataError> {
    let values = extract_numeric_column(df, target_column)?;
    let mut labels = Vec::with_capacity(values.len());
    for value in values {
        if value == 0.0 {
            labels.push(0);
        } else if value == 1.0 {
            labels.push(1);
        } else {
            return Err(DataError::NonBinaryTarget {
                column: target_column.to_string(),
                value,
            });
        }
    }
    Ok(labels)
}

/// Extracts a feature column as `f64` values. Numeric columns are cast
/// directly; columns that cannot be represented numerically are label-encoded
/// by sorted unique value.
fn extract_feature_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    if let Ok(casted) = series.cast(&DataType::Float64) {
        // A cast that introduces nulls means the column held non-numeric text.
        if casted.null_count() == 0 {
            let chunked = casted.f64()?.rechunk();
            let values: Vec<f64> = chunked.into_no_null_iter().collect();
            if values.iter().any(|v| !v.is_finite()) {
                return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
            }
            return Ok(values);
        }
    }

    label_encode(series, df.height())
}

fn label_encode(series: &Column, n: usize) -> Result<Vec<f64>, DataError> {
    let mut raw = Vec::with_capacity(n);
    for i in 0..n {
        let value = series.get(i).unwrap_or(AnyValue::Null);
        raw.push(cell_text(value));
    }

    let codes: Vec<String> = raw.iter().cloned().sorted().dedup().collect();
    Ok(raw
        .iter()
        .map(|v| {
            codes
                .iter()
                .position(|c| c == v)
                .map(|p| p as f64)
                .unwrap_or(0.0)
        })
        .collect())
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    let casted = match series.cast(&DataType::Float64) {
        Ok(casted) => casted,
        Err(_) => {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
    };
    if casted.null_count() > 0 {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        });
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

/// Z-score standardisation. Constant columns map to all zeros so they carry
/// no signal instead of blowing up the scale.
fn standardise(values: Vec<f64>) -> Vec<f64> {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std <= 0.0 || !std.is_finite() {
        return vec![0.0; values.len()];
    }
    values.into_iter().map(|v| (v - mean) / std).collect()
}
