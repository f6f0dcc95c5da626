//! The mutable working set of one IHT fit.

use crate::project::GroupSpec;
use ndarray::{Array1, Array2};

/// Buffers for fitting `n` samples, `p` genetic predictors and `q` covariates.
///
/// A state is sized once for a data set and reused across model sizes through
/// [`IhtState::reset`]. Reset keeps:
/// - every buffer allocation (sized by `n`, `p` and `q`),
/// - the per-sample cross-validation weights and group labels,
/// - the cached dense copy of the support columns (`xk`) together with the support it was
///   extracted for, so a fit whose support does not change never re-extracts columns,
/// - the covariate-only starting fit, which does not depend on `k`.
///
/// Reset always clears coefficients, linear predictors, residuals, gradients and both
/// support masks.
#[derive(Clone, Debug)]
pub struct IhtState {
    pub(crate) k: usize,
    pub(crate) kept: usize,
    /// Genetic coefficients and their previous iterate.
    pub(crate) b: Array1<f64>,
    pub(crate) b0: Array1<f64>,
    /// Covariate coefficients and their previous iterate.
    pub(crate) c: Array1<f64>,
    pub(crate) c0: Array1<f64>,
    pub(crate) xb: Array1<f64>,
    pub(crate) zc: Array1<f64>,
    pub(crate) eta: Array1<f64>,
    pub(crate) mu: Array1<f64>,
    /// Score residuals `w (y - mu) mu' / V(mu)`.
    pub(crate) r: Array1<f64>,
    /// Fisher weights at the current point.
    pub(crate) w: Array1<f64>,
    pub(crate) df: Array1<f64>,
    pub(crate) dc: Array1<f64>,
    /// Gradient restricted to the genetic support, in support order.
    pub(crate) gk: Array1<f64>,
    pub(crate) idx: Vec<bool>,
    pub(crate) idx0: Vec<bool>,
    pub(crate) idc: Vec<bool>,
    pub(crate) idc0: Vec<bool>,
    pub(crate) cv_wts: Array1<f64>,
    pub(crate) groups: Option<GroupSpec>,
    pub(crate) xk: Array2<f64>,
    pub(crate) support: Vec<usize>,
    pub(crate) initial_covariates: Option<Array1<f64>>,
    /// Scratch for projecting genetic and competing covariate coefficients together.
    pub(crate) combined: Array1<f64>,
    pub(crate) combined_mask: Vec<bool>,
}

impl IhtState {
    pub fn new(
        n: usize,
        p: usize,
        q: usize,
        kept: usize,
        cv_wts: Array1<f64>,
        groups: Option<GroupSpec>,
    ) -> Self {
        debug_assert_eq!(cv_wts.len(), n);
        let free = q - kept;
        Self {
            k: 0,
            kept,
            b: Array1::zeros(p),
            b0: Array1::zeros(p),
            c: Array1::zeros(q),
            c0: Array1::zeros(q),
            xb: Array1::zeros(n),
            zc: Array1::zeros(n),
            eta: Array1::zeros(n),
            mu: Array1::zeros(n),
            r: Array1::zeros(n),
            w: Array1::zeros(n),
            df: Array1::zeros(p),
            dc: Array1::zeros(q),
            gk: Array1::zeros(0),
            idx: vec![false; p],
            idx0: vec![false; p],
            idc: kept_mask(q, kept),
            idc0: kept_mask(q, kept),
            cv_wts,
            groups,
            xk: Array2::zeros((n, 0)),
            support: Vec::new(),
            initial_covariates: None,
            combined: Array1::zeros(p + free),
            combined_mask: vec![false; p + free],
        }
    }

    /// Prepares the state for a fit at sparsity level `k`.
    pub fn reset(&mut self, k: usize) {
        self.k = k;
        for buffer in [
            &mut self.b,
            &mut self.b0,
            &mut self.c,
            &mut self.c0,
            &mut self.xb,
            &mut self.zc,
            &mut self.eta,
            &mut self.mu,
            &mut self.r,
            &mut self.w,
            &mut self.df,
            &mut self.dc,
            &mut self.combined,
        ] {
            buffer.fill(0.0);
        }
        self.gk = Array1::zeros(0);
        self.idx.fill(false);
        self.idx0.fill(false);
        self.combined_mask.fill(false);
        let q = self.c.len();
        self.idc = kept_mask(q, self.kept);
        self.idc0 = kept_mask(q, self.kept);
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n_samples(&self) -> usize {
        self.cv_wts.len()
    }

    pub fn n_predictors(&self) -> usize {
        self.b.len()
    }

    pub fn n_covariates(&self) -> usize {
        self.c.len()
    }

    /// Number of leading covariates that are always active.
    pub fn kept_covariates(&self) -> usize {
        self.kept
    }

    pub fn coefficients(&self) -> &Array1<f64> {
        &self.b
    }

    pub fn covariate_coefficients(&self) -> &Array1<f64> {
        &self.c
    }

    pub fn support_mask(&self) -> &[bool] {
        &self.idx
    }

    pub fn covariate_mask(&self) -> &[bool] {
        &self.idc
    }

    pub fn cv_weights(&self) -> &Array1<f64> {
        &self.cv_wts
    }

    /// Support the cached columns were extracted for.
    pub fn cached_support(&self) -> &[usize] {
        &self.support
    }

    pub(crate) fn n_free(&self) -> usize {
        self.c.len() - self.kept
    }

    /// Copies the current iterate into the previous-iterate buffers.
    pub(crate) fn snapshot(&mut self) {
        self.b0.assign(&self.b);
        self.c0.assign(&self.c);
        self.idx0.clone_from(&self.idx);
        self.idc0.clone_from(&self.idc);
    }

    /// Indices of the active genetic predictors, ascending.
    pub(crate) fn active_predictors(&self) -> Vec<usize> {
        self.idx
            .iter()
            .enumerate()
            .filter_map(|(j, &on)| on.then_some(j))
            .collect()
    }

    pub(crate) fn active_covariates(&self) -> Vec<usize> {
        self.idc
            .iter()
            .enumerate()
            .filter_map(|(j, &on)| on.then_some(j))
            .collect()
    }
}

fn kept_mask(q: usize, kept: usize) -> Vec<bool> {
    (0..q).map(|j| j < kept).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn reset_clears_iterates_but_keeps_cached_columns() {
        let mut state = IhtState::new(3, 4, 2, 1, array![1.0, 0.0, 1.0], None);
        state.b[2] = 1.5;
        state.c[1] = -0.5;
        state.idx[2] = true;
        state.idc[1] = true;
        state.xk = Array2::ones((3, 1));
        state.support = vec![2];
        state.initial_covariates = Some(array![0.25]);

        state.reset(3);

        assert_eq!(state.k(), 3);
        assert!(state.coefficients().iter().all(|&v| v == 0.0));
        assert!(state.covariate_coefficients().iter().all(|&v| v == 0.0));
        assert_eq!(state.support_mask(), &[false; 4]);
        assert_eq!(state.covariate_mask(), &[true, false]);
        assert_eq!(state.cached_support(), &[2]);
        assert_eq!(state.xk.dim(), (3, 1));
        assert_eq!(state.cv_weights(), &array![1.0, 0.0, 1.0]);
        assert_eq!(state.initial_covariates, Some(array![0.25]));
    }
}
