//! Bridge between `ndarray` and the dense Cholesky solver in `faer`.

use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("linear system has a non-finite solution")]
    NonFiniteSolution,
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl FaerStorage<'_> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy view of a contiguous array, or an owned copy when the layout is strided.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => {
                FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, rows, cols))
            }
            Some(slice) if array.t().is_standard_layout() => {
                FaerStorage::Borrowed(MatRef::from_column_major_slice(slice, rows, cols))
            }
            _ => FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub struct FaerColView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerColView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let storage = match array.as_slice() {
            Some(slice) => FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, len, 1)),
            None => FaerStorage::Owned(Mat::from_fn(len, 1, |i, _| array[i])),
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl CholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let rhs_view = FaerColView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, LinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, LinalgError> {
        let view = FaerArrayView::new(self);
        let factor = view.as_ref().llt(side).map_err(LinalgError::Cholesky)?;
        Ok(CholeskyFactor { factor })
    }
}

/// Solves the weighted normal equations `D^T W D beta = D^T W t`.
pub fn weighted_least_squares(
    design: ArrayView2<'_, f64>,
    weights: ArrayView1<'_, f64>,
    target: ArrayView1<'_, f64>,
) -> Result<Array1<f64>, LinalgError> {
    let weighted: Array2<f64> = &design * &weights.insert_axis(ndarray::Axis(1));
    let gram = weighted.t().dot(&design);
    let rhs = weighted.t().dot(&target);
    let beta = gram.cholesky(Side::Lower)?.solve_vec(&rhs);
    if beta.iter().all(|v| v.is_finite()) {
        Ok(beta)
    } else {
        Err(LinalgError::NonFiniteSolution)
    }
}
