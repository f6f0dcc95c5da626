// ========================================================================================
//
//                          The design matrix capability
//
// ========================================================================================
//
// The fitting engine and the cross-validation orchestrator never look at how a design
// matrix is stored. They only ask for matrix-vector products and for dense copies of a
// handful of columns (the active support). Everything else (in-memory dense arrays,
// memory-mapped fold views, packed 2-bit genotypes) lives behind this trait.

use crate::plink::PlinkIoError;
use memmap2::Mmap;
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1};
use rayon::prelude::*;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Below this many columns a transpose product is not worth splitting across threads.
pub const PARALLEL_COLUMN_THRESHOLD: usize = 256;

const F64_BYTES: usize = core::mem::size_of::<f64>();

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid matrix dimensions: {0}")]
    InvalidDimensions(String),
    #[error("row index {index} is out of range for a matrix with {n_rows} rows")]
    RowOutOfRange { index: usize, n_rows: usize },
    #[error(transparent)]
    Plink(#[from] PlinkIoError),
}

impl MatrixError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        MatrixError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Inner kernels only fan out when they are not already running on a rayon worker.
/// Work units scheduled by the cross-validation pool therefore stay single-threaded.
pub fn inner_parallelism_allowed(n_cols: usize) -> bool {
    n_cols >= PARALLEL_COLUMN_THRESHOLD && rayon::current_thread_index().is_none()
}

/// An `n_rows x n_cols` matrix that supports the products required by IHT.
pub trait DesignMatrix: Sync {
    fn n_rows(&self) -> usize;
    fn n_cols(&self) -> usize;

    /// Writes column `j` into `out` (length `n_rows`).
    fn column_into(&self, j: usize, out: ArrayViewMut1<'_, f64>);

    /// Inner product of column `j` with `v`.
    fn column_dot(&self, j: usize, v: ArrayView1<'_, f64>) -> f64 {
        let mut column = Array1::zeros(self.n_rows());
        self.column_into(j, column.view_mut());
        column.dot(&v)
    }

    /// `out = X v`
    fn matvec(&self, v: ArrayView1<'_, f64>, mut out: ArrayViewMut1<'_, f64>) {
        debug_assert_eq!(v.len(), self.n_cols());
        debug_assert_eq!(out.len(), self.n_rows());
        out.fill(0.0);
        let mut column = Array1::zeros(self.n_rows());
        for (j, &coef) in v.iter().enumerate() {
            if coef == 0.0 {
                continue;
            }
            self.column_into(j, column.view_mut());
            out.scaled_add(coef, &column);
        }
    }

    /// `out = X^T v`
    fn matvec_transpose(&self, v: ArrayView1<'_, f64>, mut out: ArrayViewMut1<'_, f64>) {
        debug_assert_eq!(v.len(), self.n_rows());
        debug_assert_eq!(out.len(), self.n_cols());
        if inner_parallelism_allowed(self.n_cols()) {
            let values: Vec<f64> = (0..self.n_cols())
                .into_par_iter()
                .map(|j| self.column_dot(j, v))
                .collect();
            out.assign(&ArrayView1::from(values.as_slice()));
        } else {
            for (j, slot) in out.iter_mut().enumerate() {
                *slot = self.column_dot(j, v);
            }
        }
    }

    /// Dense copy of the listed columns, in the given order.
    fn columns(&self, cols: &[usize]) -> Array2<f64> {
        let mut block = Array2::zeros((self.n_rows(), cols.len()));
        for (slot, &j) in cols.iter().enumerate() {
            self.column_into(j, block.column_mut(slot));
        }
        block
    }

    /// Dense copy of every column whose mask entry is set.
    fn subset_columns(&self, mask: &[bool]) -> Array2<f64> {
        debug_assert_eq!(mask.len(), self.n_cols());
        let cols: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(j, &keep)| keep.then_some(j))
            .collect();
        self.columns(&cols)
    }
}

/// A design matrix that can write a subset of its rows to disk and reopen it.
///
/// The reopened matrix must be mathematically identical to the parent restricted to
/// those rows, including any implicit standardization.
pub trait RowSubset: DesignMatrix {
    type Persisted: DesignMatrix + Send;

    fn persist_rows(&self, rows: &[usize], path: &Path) -> Result<(), MatrixError>;

    fn open_persisted(&self, path: &Path, n_rows: usize) -> Result<Self::Persisted, MatrixError>;
}

pub(crate) fn check_rows(rows: &[usize], n_rows: usize) -> Result<(), MatrixError> {
    if rows.is_empty() {
        return Err(MatrixError::InvalidDimensions(
            "cannot persist an empty row subset".to_string(),
        ));
    }
    match rows.iter().find(|&&index| index >= n_rows) {
        Some(&index) => Err(MatrixError::RowOutOfRange { index, n_rows }),
        None => Ok(()),
    }
}

// ========================================================================================
//                                  In-memory dense
// ========================================================================================

#[derive(Clone, Debug)]
pub struct DenseDesign {
    data: Array2<f64>,
}

impl DenseDesign {
    pub fn new(data: Array2<f64>) -> Result<Self, MatrixError> {
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(MatrixError::InvalidDimensions(format!(
                "dense design must be non-empty, got {}x{}",
                data.nrows(),
                data.ncols()
            )));
        }
        Ok(Self { data })
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }
}

impl DesignMatrix for DenseDesign {
    fn n_rows(&self) -> usize {
        self.data.nrows()
    }

    fn n_cols(&self) -> usize {
        self.data.ncols()
    }

    fn column_into(&self, j: usize, mut out: ArrayViewMut1<'_, f64>) {
        out.assign(&self.data.column(j));
    }

    fn column_dot(&self, j: usize, v: ArrayView1<'_, f64>) -> f64 {
        self.data.column(j).dot(&v)
    }

    fn matvec(&self, v: ArrayView1<'_, f64>, mut out: ArrayViewMut1<'_, f64>) {
        ndarray::linalg::general_mat_vec_mul(1.0, &self.data, &v, 0.0, &mut out);
    }

    fn matvec_transpose(&self, v: ArrayView1<'_, f64>, mut out: ArrayViewMut1<'_, f64>) {
        ndarray::linalg::general_mat_vec_mul(1.0, &self.data.t(), &v, 0.0, &mut out);
    }

    fn columns(&self, cols: &[usize]) -> Array2<f64> {
        self.data.select(ndarray::Axis(1), cols)
    }
}

impl RowSubset for DenseDesign {
    type Persisted = MappedDense;

    fn persist_rows(&self, rows: &[usize], path: &Path) -> Result<(), MatrixError> {
        check_rows(rows, self.n_rows())?;
        let file = File::create(path).map_err(|e| MatrixError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        for column in self.data.columns() {
            for &row in rows {
                writer
                    .write_all(&column[row].to_le_bytes())
                    .map_err(|e| MatrixError::io(path, e))?;
            }
        }
        writer.flush().map_err(|e| MatrixError::io(path, e))
    }

    fn open_persisted(&self, path: &Path, n_rows: usize) -> Result<MappedDense, MatrixError> {
        MappedDense::open(path, n_rows, self.n_cols())
    }
}

// ========================================================================================
//                                Memory-mapped dense
// ========================================================================================

/// A column-major little-endian `f64` matrix paged in from disk on demand.
#[derive(Debug)]
pub struct MappedDense {
    mmap: Mmap,
    n_rows: usize,
    n_cols: usize,
}

impl MappedDense {
    pub fn open(path: &Path, n_rows: usize, n_cols: usize) -> Result<Self, MatrixError> {
        let expected = n_rows
            .checked_mul(n_cols)
            .and_then(|cells| cells.checked_mul(F64_BYTES))
            .ok_or_else(|| MatrixError::InvalidDimensions("dimension overflow".to_string()))?;
        if expected == 0 {
            return Err(MatrixError::InvalidDimensions(format!(
                "mapped matrix must be non-empty, got {n_rows}x{n_cols}"
            )));
        }
        let file = File::open(path).map_err(|e| MatrixError::io(path, e))?;
        // SAFETY: the file is created and exclusively owned by the fold store for the
        // lifetime of this mapping; nothing truncates or rewrites it while mapped.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| MatrixError::io(path, e))?;
        if mmap.len() != expected {
            return Err(MatrixError::InvalidDimensions(format!(
                "'{}' holds {} bytes, expected {expected} for a {n_rows}x{n_cols} matrix",
                path.display(),
                mmap.len()
            )));
        }
        Ok(Self {
            mmap,
            n_rows,
            n_cols,
        })
    }

    #[inline]
    fn column_bytes(&self, j: usize) -> &[u8] {
        let stride = self.n_rows * F64_BYTES;
        &self.mmap[j * stride..(j + 1) * stride]
    }
}

#[inline]
fn decode_f64(chunk: &[u8]) -> f64 {
    let mut raw = [0u8; F64_BYTES];
    raw.copy_from_slice(chunk);
    f64::from_le_bytes(raw)
}

impl DesignMatrix for MappedDense {
    fn n_rows(&self) -> usize {
        self.n_rows
    }

    fn n_cols(&self) -> usize {
        self.n_cols
    }

    fn column_into(&self, j: usize, mut out: ArrayViewMut1<'_, f64>) {
        for (slot, chunk) in out
            .iter_mut()
            .zip(self.column_bytes(j).chunks_exact(F64_BYTES))
        {
            *slot = decode_f64(chunk);
        }
    }

    fn column_dot(&self, j: usize, v: ArrayView1<'_, f64>) -> f64 {
        self.column_bytes(j)
            .chunks_exact(F64_BYTES)
            .zip(v.iter())
            .map(|(chunk, &x)| decode_f64(chunk) * x)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sample() -> DenseDesign {
        DenseDesign::new(array![[1.0, 2.0, 0.0], [0.5, -1.0, 3.0], [2.0, 0.0, 1.0]]).unwrap()
    }

    #[test]
    fn default_products_agree_with_dense_overrides() {
        struct Columns(DenseDesign);
        impl DesignMatrix for Columns {
            fn n_rows(&self) -> usize {
                self.0.n_rows()
            }
            fn n_cols(&self) -> usize {
                self.0.n_cols()
            }
            fn column_into(&self, j: usize, out: ArrayViewMut1<'_, f64>) {
                self.0.column_into(j, out);
            }
        }

        let dense = sample();
        let generic = Columns(dense.clone());
        let v = array![0.5, 0.0, -2.0];
        let mut expected = Array1::zeros(3);
        let mut actual = Array1::zeros(3);
        dense.matvec(v.view(), expected.view_mut());
        generic.matvec(v.view(), actual.view_mut());
        assert_abs_diff_eq!(expected, actual, epsilon = 1e-12);

        dense.matvec_transpose(v.view(), expected.view_mut());
        generic.matvec_transpose(v.view(), actual.view_mut());
        assert_abs_diff_eq!(expected, actual, epsilon = 1e-12);

        assert_eq!(
            generic.subset_columns(&[true, false, true]),
            dense.columns(&[0, 2])
        );
    }

    #[test]
    fn persisted_rows_reopen_as_the_row_subset() {
        let dense = sample();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.bin");
        dense.persist_rows(&[2, 0], &path).unwrap();
        let mapped = dense.open_persisted(&path, 2).unwrap();

        assert_eq!(mapped.n_rows(), 2);
        assert_eq!(mapped.columns(&[0, 1, 2]), array![[2.0, 0.0, 1.0], [1.0, 2.0, 0.0]]);
        let v = array![1.0, -1.0];
        let mut out = Array1::zeros(3);
        mapped.matvec_transpose(v.view(), out.view_mut());
        assert_abs_diff_eq!(out, array![1.0, -2.0, 1.0], epsilon = 1e-12);
    }

    #[test]
    fn persisting_rejects_out_of_range_rows() {
        let dense = sample();
        let dir = tempfile::tempdir().unwrap();
        let err = dense
            .persist_rows(&[0, 7], &dir.path().join("bad.bin"))
            .unwrap_err();
        assert!(matches!(err, MatrixError::RowOutOfRange { index: 7, n_rows: 3 }));
    }
}
