//! # Image Dataset and Quantum-Convolution Embedding
//!
//! The image modality loads per-patient PNG tiles into an id-keyed map, then
//! embeds each patient by partitioning the image into fixed-size square
//! patches (row-major tile order) and running every patch through a small
//! parameterized quantum circuit.
//!
//! The circuit uses only RY rotations and a CZ entangling ring. Both gates
//! are real-valued matrices, so the statevector is simulated directly in
//! `f64` without a complex-number representation. The `2^n_atoms` measurement
//! probabilities of each patch are expanded to the configured embedding
//! dimension through a fixed seeded readout matrix.

use crate::data::DataError;
use crate::embed::EmbedError;
use ndarray::{s, Array1, Array2, Array4, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

/// An id-keyed collection of grayscale patient images with pixel values
/// normalised to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct PngDataset {
    images: BTreeMap<String, Array2<f64>>,
}

impl PngDataset {
    /// Loads every `*.png` file under `dir`. The file stem is the patient id.
    pub fn load(dir: &Path) -> Result<Self, DataError> {
        let entries = std::fs::read_dir(dir).map_err(|source| DataError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| DataError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let is_png = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("png"));
            if is_png {
                paths.push(path);
            }
        }
        paths.sort();

        let mut images = BTreeMap::new();
        for path in paths {
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| DataError::BadImageName(path.clone()))?
                .to_string();
            let decoded = image::open(&path).map_err(|source| DataError::ImageDecode {
                path: path.clone(),
                source,
            })?;
            let gray = decoded.to_luma8();
            let (width, height) = gray.dimensions();
            let pixels = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
                f64::from(gray.get_pixel(x as u32, y as u32).0[0]) / 255.0
            });
            images.insert(id, pixels);
        }

        if images.is_empty() {
            return Err(DataError::EmptyImageDirectory(dir.to_path_buf()));
        }
        Ok(Self { images })
    }

    /// Builds a dataset from in-memory images. Used by tests and callers that
    /// synthesise tiles.
    pub fn from_images(images: BTreeMap<String, Array2<f64>>) -> Self {
        Self { images }
    }

    /// Patient ids in ascending order; the positional half-split depends on
    /// this ordering.
    pub fn patient_ids(&self) -> Vec<String> {
        self.images.keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Array2<f64>> {
        self.images.get(id)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// A parameterized circuit over `n_atoms` qubits: RY angle encoding of the
/// patch, a CZ entangling ring, then a fixed seeded RY variational layer.
#[derive(Debug, Clone)]
pub struct QuanvCircuit {
    n_atoms: usize,
    thetas: Array1<f64>,
}

impl QuanvCircuit {
    pub fn new(n_atoms: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let thetas = Array1::from_shape_fn(n_atoms, |_| rng.gen_range(0.0..(2.0 * PI)));
        Self { n_atoms, thetas }
    }

    pub fn n_atoms(&self) -> usize {
        self.n_atoms
    }

    /// Number of computational basis states, `2^n_atoms`.
    pub fn n_states(&self) -> usize {
        1 << self.n_atoms
    }

    /// Encodes a patch as one RY angle per qubit: the patch pixels are
    /// chunked into `n_atoms` nearly-equal groups and each group's mean maps
    /// to an angle in `[0, pi]`.
    fn encode_angles(&self, patch: ArrayView2<f64>) -> Array1<f64> {
        let pixels: Vec<f64> = patch.iter().copied().collect();
        let n = pixels.len();
        let base = n / self.n_atoms;
        let remainder = n % self.n_atoms;

        let mut angles = Array1::zeros(self.n_atoms);
        let mut start = 0;
        for q in 0..self.n_atoms {
            let size = base + usize::from(q < remainder);
            let chunk = &pixels[start..start + size];
            let mean = chunk.iter().sum::<f64>() / size as f64;
            angles[q] = PI * mean;
            start += size;
        }
        angles
    }

    /// Runs the circuit on a patch and returns the `2^n_atoms` measurement
    /// probabilities. Deterministic for a given patch and circuit.
    pub fn evaluate(&self, patch: ArrayView2<f64>) -> Array1<f64> {
        let dim = self.n_states();
        let mut state = Array1::<f64>::zeros(dim);
        state[0] = 1.0;

        let angles = self.encode_angles(patch);
        for q in 0..self.n_atoms {
            apply_ry(&mut state, q, angles[q]);
        }

        // CZ ring: (0,1), (1,2), ..., closing (n-1,0) when the ring has
        // more than two qubits.
        for q in 0..self.n_atoms.saturating_sub(1) {
            apply_cz(&mut state, q, q + 1);
        }
        if self.n_atoms > 2 {
            apply_cz(&mut state, self.n_atoms - 1, 0);
        }

        for q in 0..self.n_atoms {
            apply_ry(&mut state, q, self.thetas[q]);
        }

        state.mapv(|amplitude| amplitude * amplitude)
    }
}

/// RY(theta) on `qubit`, applied in place to a real statevector.
fn apply_ry(state: &mut Array1<f64>, qubit: usize, theta: f64) {
    let (sin, cos) = (theta / 2.0).sin_cos();
    let bit = 1 << qubit;
    for i in 0..state.len() {
        if i & bit == 0 {
            let j = i | bit;
            let a = state[i];
            let b = state[j];
            state[i] = cos * a - sin * b;
            state[j] = sin * a + cos * b;
        }
    }
}

/// CZ between `qubit_a` and `qubit_b`: negates amplitudes where both bits
/// are set.
fn apply_cz(state: &mut Array1<f64>, qubit_a: usize, qubit_b: usize) {
    let mask = (1 << qubit_a) | (1 << qubit_b);
    for i in 0..state.len() {
        if i & mask == mask {
            state[i] = -state[i];
        }
    }
}

/// Patch-wise quantum embedding of patient images. Output shape is
/// `[patients, grid_h, grid_w, embedding_dim]`.
#[derive(Debug, Clone)]
pub struct QuanvEmbedder {
    circuit: QuanvCircuit,
    patch_size: usize,
    embedding_dim: usize,
    /// Fixed seeded expansion from `2^n_atoms` probabilities to the
    /// embedding dimension, shape `[n_states, embedding_dim]`.
    readout: Array2<f64>,
}

impl QuanvEmbedder {
    /// Fails when a patch holds fewer pixels than the circuit has qubits;
    /// angle encoding needs at least one pixel per qubit.
    pub fn new(
        circuit: QuanvCircuit,
        patch_size: usize,
        embedding_dim: usize,
        seed: u64,
    ) -> Result<Self, EmbedError> {
        if patch_size * patch_size < circuit.n_atoms() {
            return Err(EmbedError::PatchTooSmall {
                patch: patch_size,
                n_atoms: circuit.n_atoms(),
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (circuit.n_states() as f64).sqrt();
        let readout = Array2::from_shape_fn((circuit.n_states(), embedding_dim), |_| {
            rng.gen_range(-1.0..1.0) * scale
        });
        Ok(Self {
            circuit,
            patch_size,
            embedding_dim,
            readout,
        })
    }

    fn grid_for(&self, id: &str, image: &Array2<f64>) -> Result<(usize, usize), EmbedError> {
        let (height, width) = (image.nrows(), image.ncols());
        if height == 0
            || width == 0
            || height % self.patch_size != 0
            || width % self.patch_size != 0
        {
            return Err(EmbedError::PatchMismatch {
                id: id.to_string(),
                height,
                width,
                patch: self.patch_size,
            });
        }
        Ok((height / self.patch_size, width / self.patch_size))
    }

    /// Embeds the listed patients in the given order. Patches are visited in
    /// row-major tile order, so positional semantics are stable across runs.
    pub fn embed_patients(
        &self,
        dataset: &PngDataset,
        ids: &[String],
    ) -> Result<Array4<f64>, EmbedError> {
        let first_id = ids.first().ok_or(EmbedError::EmptyBatch)?;
        let first = dataset
            .get(first_id)
            .ok_or_else(|| EmbedError::UnknownPatient(first_id.clone()))?;
        let (grid_h, grid_w) = self.grid_for(first_id, first)?;

        let mut out = Array4::zeros((ids.len(), grid_h, grid_w, self.embedding_dim));
        for (row, id) in ids.iter().enumerate() {
            let image = dataset
                .get(id)
                .ok_or_else(|| EmbedError::UnknownPatient(id.clone()))?;
            let (rows, cols) = self.grid_for(id, image)?;
            if (rows, cols) != (grid_h, grid_w) {
                return Err(EmbedError::GridMismatch {
                    id: id.clone(),
                    rows,
                    cols,
                    expected_rows: grid_h,
                    expected_cols: grid_w,
                });
            }

            for gy in 0..grid_h {
                for gx in 0..grid_w {
                    let patch = image.slice(s![
                        gy * self.patch_size..(gy + 1) * self.patch_size,
                        gx * self.patch_size..(gx + 1) * self.patch_size
                    ]);
                    let probabilities = self.circuit.evaluate(patch);
                    let features = probabilities.dot(&self.readout);
                    out.slice_mut(s![row, gy, gx, ..]).assign(&features);
                }
            }
        }
        Ok(out)
    }
}
