//! # Artifact Persistence
//!
//! Writers and readers for every on-disk artifact the pipeline produces:
//! binary `.npy` embedding arrays, id/label CSV tables, and feature-matrix
//! CSVs.
//!
//! The central invariant lives here: every embedding array is persisted with
//! an id/label table of the same length and the same row order, and
//! [`check_aligned`] verifies the pairing on the way back in. All writes are
//! atomic (write to a `.tmp` sibling, then rename), so a downstream consumer
//! never observes a partially written artifact and a failed stage never
//! leaves output under a success filename.

use ndarray::{Array2, Array3, Array4, ArrayView1, ArrayView2};
use ndarray_npy::{ReadNpyError, ReadNpyExt, WriteNpyError, WriteNpyExt};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode '{path}' as .npy: {source}")]
    NpyWrite {
        path: PathBuf,
        #[source]
        source: WriteNpyError,
    },
    #[error("failed to read '{path}' as .npy: {source}")]
    NpyRead {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },
    #[error("CSV error for '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("label table '{path}' row {row} does not hold a binary label")]
    BadLabel { path: PathBuf, row: usize },
    #[error("matrix CSV '{path}' row {row} holds a non-numeric cell")]
    BadCell { path: PathBuf, row: usize },
    #[error("cannot write label table '{path}': {ids} ids but {labels} labels")]
    WriteMismatch {
        path: PathBuf,
        ids: usize,
        labels: usize,
    },
    #[error(
        "embedding array at '{path}' has {rows} rows but its label table has {labels} rows"
    )]
    RowMismatch {
        path: PathBuf,
        rows: usize,
        labels: usize,
    },
}

/// An id/label table read back from disk; row `i` corresponds to row `i` of
/// the embedding array persisted alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
    pub ids: Vec<String>,
    pub labels: Vec<u8>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> PersistError + '_ {
    move |source| PersistError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn ensure_parent(path: &Path) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(path))?;
    }
    Ok(())
}

/// Atomically writes any `.npy`-encodable array.
pub fn write_npy_atomic<A: WriteNpyExt>(path: &Path, array: &A) -> Result<(), PersistError> {
    ensure_parent(path)?;
    let tmp = tmp_sibling(path);
    let file = File::create(&tmp).map_err(io_err(&tmp))?;
    array
        .write_npy(BufWriter::new(file))
        .map_err(|source| PersistError::NpyWrite {
            path: path.to_path_buf(),
            source,
        })?;
    fs::rename(&tmp, path).map_err(io_err(path))
}

pub fn read_embeddings3(path: &Path) -> Result<Array3<f64>, PersistError> {
    let file = File::open(path).map_err(io_err(path))?;
    Array3::read_npy(file).map_err(|source| PersistError::NpyRead {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_embeddings4(path: &Path) -> Result<Array4<f64>, PersistError> {
    let file = File::open(path).map_err(io_err(path))?;
    Array4::read_npy(file).map_err(|source| PersistError::NpyRead {
        path: path.to_path_buf(),
        source,
    })
}

/// Atomically writes a two-column id/label table whose row order matches the
/// embedding array it accompanies.
pub fn write_label_table(
    path: &Path,
    ids: &[String],
    labels: ArrayView1<u8>,
    id_column: &str,
    target_column: &str,
) -> Result<(), PersistError> {
    if ids.len() != labels.len() {
        return Err(PersistError::WriteMismatch {
            path: path.to_path_buf(),
            ids: ids.len(),
            labels: labels.len(),
        });
    }
    ensure_parent(path)?;
    let tmp = tmp_sibling(path);
    {
        let mut writer = csv::Writer::from_path(&tmp).map_err(csv_err(&tmp))?;
        writer
            .write_record([id_column, target_column])
            .map_err(csv_err(path))?;
        for (id, label) in ids.iter().zip(labels.iter()) {
            writer
                .write_record([id.as_str(), &label.to_string()])
                .map_err(csv_err(path))?;
        }
        writer.flush().map_err(io_err(path))?;
    }
    fs::rename(&tmp, path).map_err(io_err(path))
}

pub fn read_label_table(path: &Path) -> Result<LabelTable, PersistError> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_err(path))?;
    let mut ids = Vec::new();
    let mut labels = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err(path))?;
        let id = record.get(0).unwrap_or("").to_string();
        let label: u8 = record
            .get(1)
            .and_then(|v| v.parse().ok())
            .filter(|v| *v <= 1)
            .ok_or_else(|| PersistError::BadLabel {
                path: path.to_path_buf(),
                row,
            })?;
        ids.push(id);
        labels.push(label);
    }
    Ok(LabelTable { ids, labels })
}

/// Atomically writes a numeric feature matrix with `f0..fN` headers.
pub fn write_matrix_csv(path: &Path, matrix: ArrayView2<f64>) -> Result<(), PersistError> {
    ensure_parent(path)?;
    let tmp = tmp_sibling(path);
    {
        let mut writer = csv::Writer::from_path(&tmp).map_err(csv_err(&tmp))?;
        let header: Vec<String> = (0..matrix.ncols()).map(|j| format!("f{j}")).collect();
        writer.write_record(&header).map_err(csv_err(path))?;
        for row in matrix.rows() {
            let record: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writer.write_record(&record).map_err(csv_err(path))?;
        }
        writer.flush().map_err(io_err(path))?;
    }
    fs::rename(&tmp, path).map_err(io_err(path))
}

pub fn read_matrix_csv(path: &Path) -> Result<Array2<f64>, PersistError> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_err(path))?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (row_index, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err(path))?;
        let mut row = Vec::with_capacity(record.len());
        for cell in record.iter() {
            let value: f64 = cell.parse().map_err(|_| PersistError::BadCell {
                path: path.to_path_buf(),
                row: row_index,
            })?;
            row.push(value);
        }
        rows.push(row);
    }
    let ncols = rows.first().map_or(0, Vec::len);
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    let nrows = if ncols == 0 { 0 } else { flat.len() / ncols };
    Array2::from_shape_vec((nrows, ncols), flat).map_err(|_| PersistError::RowMismatch {
        path: path.to_path_buf(),
        rows: nrows,
        labels: ncols,
    })
}

/// Verifies the row-order alignment invariant between an embedding array and
/// its label table.
pub fn check_aligned(path: &Path, rows: usize, table: &LabelTable) -> Result<(), PersistError> {
    if rows != table.ids.len() {
        return Err(PersistError::RowMismatch {
            path: path.to_path_buf(),
            rows,
            labels: table.ids.len(),
        });
    }
    Ok(())
}
