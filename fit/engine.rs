// ========================================================================================
//
//                           Iterative hard thresholding
//
// ========================================================================================
//
// One fit moves through INIT, then ITERATE until either the relative coefficient change
// drops below `tol` (converged) or the iteration budget runs out. Every iteration takes a
// full gradient step with a Barzilai-Borwein style step size computed on the current
// support, projects back onto k-sparse vectors, and halves the step while the objective
// fails to decrease. Numerical degeneracy and descent failures abort the fit; running
// out of iterations does not.

use crate::config::{DebiasMode, IhtConfig};
use crate::debias;
use crate::family::Glm;
use crate::matrix::DesignMatrix;
use crate::project::{GroupSpec, Projection};
use crate::state::IhtState;
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IhtError {
    #[error("invalid value for `{parameter}`: {message}")]
    InvalidConfig {
        parameter: &'static str,
        message: String,
    },
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error(
        "step size denominator is zero at iteration {iteration}: the active set has no image under the design matrix"
    )]
    DegenerateStepSize { iteration: usize },
    #[error("step size {value} at iteration {iteration} is not finite")]
    NonFiniteStepSize { iteration: usize, value: f64 },
    #[error("objective increased from {previous} to {current} at iteration {iteration}")]
    DescentFailure {
        iteration: usize,
        previous: f64,
        current: f64,
    },
    #[error("objective became non-finite at iteration {iteration}")]
    NonFiniteObjective { iteration: usize },
}

impl IhtError {
    pub(crate) fn invalid(parameter: &'static str, message: String) -> Self {
        IhtError::InvalidConfig { parameter, message }
    }

    /// Numerical failures of a fit, as opposed to rejected inputs.
    pub fn is_numerical(&self) -> bool {
        !matches!(
            self,
            IhtError::InvalidConfig { .. } | IhtError::DimensionMismatch(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Converged,
    MaxIterationsReached,
}

impl FitStatus {
    pub fn is_converged(self) -> bool {
        self == FitStatus::Converged
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IhtResult {
    pub k: usize,
    /// Genetic coefficients, zero outside the support.
    pub beta: Array1<f64>,
    pub covariates: Array1<f64>,
    /// Genetic predictors with a non-zero coefficient, ascending. Coefficients smaller
    /// than `tol` in magnitude are zeroed, so this may hold fewer than `k` entries.
    pub support: Vec<usize>,
    pub status: FitStatus,
    pub iterations: usize,
    pub objective: f64,
    pub elapsed: Duration,
}

impl IhtResult {
    /// `X beta + Z c` for another matrix pair with the same columns.
    pub fn linear_predictor<X: DesignMatrix + ?Sized>(
        &self,
        x: &X,
        z: ArrayView2<'_, f64>,
    ) -> Array1<f64> {
        let mut eta = Array1::zeros(x.n_rows());
        x.matvec(self.beta.view(), eta.view_mut());
        if z.ncols() > 0 {
            eta += &z.dot(&self.covariates);
        }
        eta
    }
}

/// Data handed to a fit besides the design matrix.
#[derive(Clone, Debug)]
pub struct FitInputs<'a> {
    pub y: ArrayView1<'a, f64>,
    /// `n x q` covariates; may have no columns.
    pub z: ArrayView2<'a, f64>,
    /// Leading covariates that are always active. All of them when `None`.
    pub keep_covariates: Option<usize>,
    pub priors: Option<ArrayView1<'a, f64>>,
    pub groups: Option<&'a GroupSpec>,
    /// Per-sample weights; zero removes a sample from the fit.
    pub sample_weights: Option<ArrayView1<'a, f64>>,
}

impl<'a> FitInputs<'a> {
    pub fn new(y: ArrayView1<'a, f64>, z: ArrayView2<'a, f64>) -> Self {
        Self {
            y,
            z,
            keep_covariates: None,
            priors: None,
            groups: None,
            sample_weights: None,
        }
    }

    pub fn keep_leading(mut self, kept: usize) -> Self {
        self.keep_covariates = Some(kept);
        self
    }

    pub fn with_priors(mut self, priors: ArrayView1<'a, f64>) -> Self {
        self.priors = Some(priors);
        self
    }

    pub fn with_groups(mut self, groups: &'a GroupSpec) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_sample_weights(mut self, weights: ArrayView1<'a, f64>) -> Self {
        self.sample_weights = Some(weights);
        self
    }

    /// The same inputs borrowed for a shorter lifetime, so that views with a shorter
    /// lifetime (fold weights, for instance) can be attached.
    pub fn reborrow(&self) -> FitInputs<'_> {
        FitInputs {
            y: self.y.view(),
            z: self.z.view(),
            keep_covariates: self.keep_covariates,
            priors: self.priors.as_ref().map(|w| w.view()),
            groups: self.groups,
            sample_weights: self.sample_weights.as_ref().map(|w| w.view()),
        }
    }
}

/// Fits one model of sparsity `k`.
pub fn fit<X: DesignMatrix + ?Sized>(
    x: &X,
    inputs: &FitInputs<'_>,
    k: usize,
    config: &IhtConfig,
) -> Result<IhtResult, IhtError> {
    Iht::new(x, inputs, config)?.fit(k)
}

/// A fitting session over one data set, reusable across sparsity levels.
pub struct Iht<'a, X: DesignMatrix + ?Sized> {
    x: &'a X,
    y: ArrayView1<'a, f64>,
    z: ArrayView2<'a, f64>,
    glm: Glm,
    config: IhtConfig,
    projection: Projection,
    state: IhtState,
}

impl<'a, X: DesignMatrix + ?Sized> Iht<'a, X> {
    pub fn new(x: &'a X, inputs: &'a FitInputs<'_>, config: &IhtConfig) -> Result<Self, IhtError> {
        config.validate()?;
        let (n, p, q) = (x.n_rows(), x.n_cols(), inputs.z.ncols());
        if inputs.y.len() != n || inputs.z.nrows() != n {
            return Err(IhtError::DimensionMismatch(format!(
                "design has {n} rows but the response has {} and the covariates {}",
                inputs.y.len(),
                inputs.z.nrows()
            )));
        }
        let kept = inputs.keep_covariates.unwrap_or(q);
        if kept > q {
            return Err(IhtError::invalid(
                "keep_covariates",
                format!("{kept} exceeds the {q} covariate columns"),
            ));
        }

        let cv_wts = match inputs.sample_weights {
            Some(w) if w.len() != n => {
                return Err(IhtError::DimensionMismatch(format!(
                    "{} sample weights for {n} samples",
                    w.len()
                )));
            }
            Some(w) if w.iter().any(|v| !(v.is_finite() && *v >= 0.0)) => {
                return Err(IhtError::invalid(
                    "sample_weights",
                    "weights must be finite and non-negative".to_string(),
                ));
            }
            Some(w) if w.sum() <= 0.0 => {
                return Err(IhtError::invalid(
                    "sample_weights",
                    "no sample has positive weight".to_string(),
                ));
            }
            Some(w) => w.to_owned(),
            None => Array1::ones(n),
        };

        let priors = match inputs.priors {
            Some(w) if w.len() != p => {
                return Err(IhtError::DimensionMismatch(format!(
                    "{} prior weights for {p} predictors",
                    w.len()
                )));
            }
            Some(w) if w.iter().any(|v| !(v.is_finite() && *v > 0.0)) => {
                return Err(IhtError::invalid(
                    "priors",
                    "prior weights must be finite and positive".to_string(),
                ));
            }
            Some(w) => Some(w.to_owned()),
            None => None,
        };

        if let Some(groups) = inputs.groups {
            if groups.labels.len() != p {
                return Err(IhtError::DimensionMismatch(format!(
                    "{} group labels for {p} predictors",
                    groups.labels.len()
                )));
            }
            if groups.max_groups == 0 {
                return Err(IhtError::invalid(
                    "max_groups",
                    "at least one group must be allowed".to_string(),
                ));
            }
            if kept != q {
                return Err(IhtError::invalid(
                    "keep_covariates",
                    "group-sparse fits require every covariate to be kept".to_string(),
                ));
            }
        }

        let glm = Glm::new(config.family, config.link);
        let active: Vec<f64> = inputs
            .y
            .iter()
            .zip(cv_wts.iter())
            .filter_map(|(&y, &w)| (w > 0.0).then_some(y))
            .collect();
        glm.family
            .validate_response(ArrayView1::from(active.as_slice()))
            .map_err(|message| IhtError::invalid("y", message))?;

        // Competing covariates rank with unit prior weight.
        let projection_weights = priors.as_ref().map(|w| {
            let mut extended = Array1::ones(p + q - kept);
            extended.slice_mut(s![..p]).assign(w);
            extended
        });
        let projection = Projection::new(projection_weights, inputs.groups);
        let state = IhtState::new(n, p, q, kept, cv_wts, inputs.groups.cloned());

        Ok(Self {
            x,
            y: inputs.y.view(),
            z: inputs.z.view(),
            glm,
            config: config.clone(),
            projection,
            state,
        })
    }

    pub fn state(&self) -> &IhtState {
        &self.state
    }

    /// Largest admissible sparsity level: every predictor plus the covariates that compete
    /// for the support.
    pub fn max_k(&self) -> usize {
        self.state.n_predictors() + self.state.n_free()
    }

    /// Runs a fit at sparsity `k`, reusing the buffers of any previous fit.
    pub fn fit(&mut self, k: usize) -> Result<IhtResult, IhtError> {
        let slots = self.max_k();
        if k == 0 || k > slots {
            return Err(IhtError::invalid(
                "k",
                format!("must lie in 1..={slots}, got {k}"),
            ));
        }
        let start = Instant::now();
        self.state.reset(k);
        self.initialize();

        let mut objective = self.objective();
        let mut status = FitStatus::MaxIterationsReached;
        let mut iterations = 0;

        for iteration in 1..=self.config.max_iter {
            iterations = iteration;
            let previous = objective;
            objective = self.iterate(iteration, previous)?;

            let crit = self.relative_change();
            debug!(
                "k={k} iteration {iteration}: objective {objective:.6e}, relative change {crit:.3e}"
            );
            if iteration >= self.config.min_iter && crit < self.config.tol {
                status = FitStatus::Converged;
                break;
            }
        }

        if status == FitStatus::MaxIterationsReached {
            debug!("k={k} did not converge within {} iterations", self.config.max_iter);
        }
        Ok(self.result(status, iterations, objective, start.elapsed()))
    }

    // ------------------------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------------------------

    fn initialize(&mut self) {
        let kept = self.state.kept;
        if self.state.initial_covariates.is_none() && kept > 0 {
            let z_kept = self.z.slice(s![.., ..kept]);
            let start = match debias::covariate_fit(
                z_kept,
                self.y,
                self.state.cv_wts.view(),
                &self.glm,
            ) {
                Ok(c) => c,
                Err(e) => {
                    warn!("covariate-only starting fit failed ({e}); starting from zero");
                    Array1::zeros(kept)
                }
            };
            self.state.initial_covariates = Some(start);
        }
        if let Some(start) = &self.state.initial_covariates {
            self.state.c.slice_mut(s![..kept]).assign(start);
        }

        self.update_covariate_predictor();
        self.state.xb.fill(0.0);
        self.refresh_point();

        // Initial support: the projection of the score vector.
        let p = self.state.n_predictors();
        let state = &mut self.state;
        state.combined.slice_mut(s![..p]).assign(&state.df);
        state
            .combined
            .slice_mut(s![p..])
            .assign(&state.dc.slice(s![kept..]));
        self.projection
            .apply(state.combined.view_mut(), state.k, &mut state.combined_mask);
        state.idx.copy_from_slice(&state.combined_mask[..p]);
        state.idc[kept..].copy_from_slice(&state.combined_mask[p..]);
        self.refresh_support_columns();
    }

    // ------------------------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------------------------

    fn iterate(&mut self, iteration: usize, previous: f64) -> Result<f64, IhtError> {
        self.state.snapshot();
        let step = self.step_size(iteration)?;

        // Halve the projected step until the objective decreases, remembering the best.
        let mut best: Option<(f64, f64, bool)> = None;
        let mut accepted = None;
        'search: for confined in [false, true] {
            for halvings in 0..=self.config.max_backtrack {
                let trial = step / f64::powi(2.0, halvings as i32);
                let value = self.take_step(trial, confined);
                if best.is_none_or(|(v, _, _)| value < v) {
                    best = Some((value, trial, confined));
                }
                if value <= previous {
                    accepted = Some(value);
                    break 'search;
                }
            }
            if !confined {
                warn!(
                    "backtracking exhausted after {} halvings at iteration {iteration} (k={}); \
                     retrying on the current support",
                    self.config.max_backtrack, self.state.k
                );
            }
        }

        let objective = match (accepted, best) {
            (Some(value), _) => value,
            (None, Some((value, trial, confined))) => {
                warn!(
                    "no step decreased the objective at iteration {iteration} (k={}); keeping the best candidate",
                    self.state.k
                );
                self.take_step(trial, confined);
                value
            }
            (None, None) => previous,
        };

        if !objective.is_finite() {
            return Err(IhtError::NonFiniteObjective { iteration });
        }
        if objective > previous + self.config.tol * (previous.abs() + 1.0) {
            return Err(IhtError::DescentFailure {
                iteration,
                previous,
                current: objective,
            });
        }
        self.refresh_point();
        Ok(objective)
    }

    /// `mu = (||g_S||^2 + ||g_C||^2) / ||W^(1/2) (X_S g_S + Z_C g_C)||^2` on the current
    /// support, with the Fisher weights of the current point.
    fn step_size(&mut self, iteration: usize) -> Result<f64, IhtError> {
        let state = &mut self.state;
        state.gk = state.support.iter().map(|&j| state.df[j]).collect();
        let gc: Array1<f64> = state
            .dc
            .iter()
            .zip(&state.idc)
            .map(|(&g, &on)| if on { g } else { 0.0 })
            .collect();

        let numerator = state.gk.dot(&state.gk) + gc.dot(&gc);
        let mut image = state.xk.dot(&state.gk);
        if !gc.is_empty() {
            image += &self.z.dot(&gc);
        }
        let denominator: f64 = image
            .iter()
            .zip(state.w.iter())
            .map(|(v, w)| w * v * v)
            .sum();

        if denominator == 0.0 {
            return Err(IhtError::DegenerateStepSize { iteration });
        }
        let step = numerator / denominator;
        if !step.is_finite() {
            return Err(IhtError::NonFiniteStepSize {
                iteration,
                value: step,
            });
        }
        Ok(step)
    }

    /// Moves from the snapshot along the gradient by `step` and returns the new objective.
    /// A confined step stays on the snapshot's support instead of re-projecting.
    fn take_step(&mut self, step: f64, confined: bool) -> f64 {
        let kept = self.state.kept;
        let p = self.state.n_predictors();
        {
            let state = &mut self.state;
            state.b.assign(&state.b0);
            state.b.scaled_add(step, &state.df);
            state.c.assign(&state.c0);
            state.c.scaled_add(step, &state.dc);

            if confined {
                state.idx.clone_from(&state.idx0);
                state.idc.clone_from(&state.idc0);
                for (value, &on) in state.b.iter_mut().zip(&state.idx) {
                    if !on {
                        *value = 0.0;
                    }
                }
            } else {
                state.combined.slice_mut(s![..p]).assign(&state.b);
                state
                    .combined
                    .slice_mut(s![p..])
                    .assign(&state.c.slice(s![kept..]));
                self.projection
                    .apply(state.combined.view_mut(), state.k, &mut state.combined_mask);
                state.b.assign(&state.combined.slice(s![..p]));
                state
                    .c
                    .slice_mut(s![kept..])
                    .assign(&state.combined.slice(s![p..]));
                state.idx.copy_from_slice(&state.combined_mask[..p]);
                state.idc[kept..].copy_from_slice(&state.combined_mask[p..]);
            }
            for (value, &on) in state.c.iter_mut().zip(&state.idc) {
                if !on {
                    *value = 0.0;
                }
            }
        }

        self.refresh_support_columns();
        self.update_genetic_predictor();
        self.update_covariate_predictor();
        if self.debias_applies() {
            self.debias();
        }
        self.update_mean();
        self.objective()
    }

    // ------------------------------------------------------------------------------------
    // Debiasing
    // ------------------------------------------------------------------------------------

    fn debias_applies(&self) -> bool {
        let active = self.state.support.len() + self.state.active_covariates().len();
        self.config.debias != DebiasMode::Off
            && active > 0
            && debias::weighted_count(self.state.cv_wts.view()) > active as f64
    }

    fn debias(&mut self) {
        let active_cov = self.state.active_covariates();
        let z_active = self.z.select(Axis(1), &active_cov);
        let b_active: Array1<f64> = self.state.support.iter().map(|&j| self.state.b[j]).collect();
        let c_active: Array1<f64> = active_cov.iter().map(|&j| self.state.c[j]).collect();

        // Column positions within `xk` of each block after the covariates.
        let genetic_blocks: Vec<Vec<usize>> = match (&self.config.debias, &self.state.groups) {
            (DebiasMode::PerGroup, Some(groups)) => {
                let mut by_label: Vec<(usize, Vec<usize>)> = Vec::new();
                for (pos, &j) in self.state.support.iter().enumerate() {
                    let label = groups.labels[j];
                    match by_label.iter_mut().find(|(l, _)| *l == label) {
                        Some((_, members)) => members.push(pos),
                        None => by_label.push((label, vec![pos])),
                    }
                }
                by_label.sort_by_key(|(label, _)| *label);
                by_label.into_iter().map(|(_, members)| members).collect()
            }
            _ => vec![(0..self.state.support.len()).collect()],
        };
        let joint = self.config.debias == DebiasMode::Joint || self.state.groups.is_none();

        let mut eta = self.state.eta.clone();
        let result = if joint {
            let design = ndarray::concatenate(Axis(1), &[z_active.view(), self.state.xk.view()])
                .unwrap_or_else(|_| Array2::zeros((self.state.n_samples(), 0)));
            let mut coefs = [ndarray::concatenate(Axis(0), &[c_active.view(), b_active.view()])
                .unwrap_or_else(|_| Array1::zeros(0))];
            debias::refit_blocks(
                &[design.view()],
                &mut coefs,
                &mut eta,
                self.y,
                self.state.cv_wts.view(),
                &self.glm,
            )
            .map(|()| {
                let [joined] = coefs;
                let split = active_cov.len();
                vec![joined.slice(s![..split]).to_owned(), joined.slice(s![split..]).to_owned()]
            })
        } else {
            let blocks: Vec<Array2<f64>> = genetic_blocks
                .iter()
                .map(|positions| self.state.xk.select(Axis(1), positions))
                .collect();
            let mut views = vec![z_active.view()];
            views.extend(blocks.iter().map(|b| b.view()));
            let mut coefs = vec![c_active];
            coefs.extend(
                genetic_blocks
                    .iter()
                    .map(|positions| positions.iter().map(|&pos| b_active[pos]).collect()),
            );
            debias::refit_blocks(
                &views,
                &mut coefs,
                &mut eta,
                self.y,
                self.state.cv_wts.view(),
                &self.glm,
            )
            .map(|()| {
                let mut genetic = Array1::zeros(b_active.len());
                for (positions, coef) in genetic_blocks.iter().zip(&coefs[1..]) {
                    for (&pos, &value) in positions.iter().zip(coef.iter()) {
                        genetic[pos] = value;
                    }
                }
                vec![coefs[0].clone(), genetic]
            })
        };

        match result {
            Ok(parts) => {
                for (&j, &value) in active_cov.iter().zip(parts[0].iter()) {
                    self.state.c[j] = value;
                }
                for (&j, &value) in self.state.support.iter().zip(parts[1].iter()) {
                    self.state.b[j] = value;
                }
                self.update_genetic_predictor();
                self.update_covariate_predictor();
            }
            Err(e) => warn!("debiasing on the active support failed ({e}); keeping projected values"),
        }
    }

    // ------------------------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------------------------

    /// Re-extracts the support columns when the support changed since the last extraction.
    fn refresh_support_columns(&mut self) {
        let active = self.state.active_predictors();
        if active != self.state.support {
            self.state.xk = self.x.columns(&active);
            self.state.support = active;
        }
    }

    fn update_genetic_predictor(&mut self) {
        let state = &mut self.state;
        let b_active: Array1<f64> = state.support.iter().map(|&j| state.b[j]).collect();
        if b_active.is_empty() {
            state.xb.fill(0.0);
        } else {
            state.xb = state.xk.dot(&b_active);
        }
    }

    fn update_covariate_predictor(&mut self) {
        if self.z.ncols() == 0 {
            self.state.zc.fill(0.0);
        } else {
            self.state.zc = self.z.dot(&self.state.c);
        }
        let state = &mut self.state;
        state.eta.assign(&state.xb);
        state.eta += &state.zc;
    }

    fn update_mean(&mut self) {
        let state = &mut self.state;
        self.glm.fill_mean(state.eta.view(), state.mu.view_mut());
    }

    /// Mean, Fisher weights, score residuals and both gradients at the current point.
    fn refresh_point(&mut self) {
        self.update_mean();
        let state = &mut self.state;
        self.glm.fisher_weights(
            state.eta.view(),
            state.mu.view(),
            state.cv_wts.view(),
            state.w.view_mut(),
        );
        self.glm.score_residuals(
            self.y,
            state.eta.view(),
            state.mu.view(),
            state.cv_wts.view(),
            state.r.view_mut(),
        );
        self.x.matvec_transpose(state.r.view(), state.df.view_mut());
        if self.z.ncols() > 0 {
            state.dc = self.z.t().dot(&state.r);
        }
    }

    fn objective(&self) -> f64 {
        self.glm
            .objective(self.y, self.state.mu.view(), self.state.cv_wts.view())
    }

    /// `max(||b - b0||_inf, ||c - c0||_inf) / (max(||b0||_inf, ||c0||_inf) + 1)`
    fn relative_change(&self) -> f64 {
        let state = &self.state;
        let change = max_abs((&state.b - &state.b0).view())
            .max(max_abs((&state.c - &state.c0).view()));
        let scale = max_abs(state.b0.view()).max(max_abs(state.c0.view()));
        change / (scale + 1.0)
    }

    fn result(
        &self,
        status: FitStatus,
        iterations: usize,
        objective: f64,
        elapsed: Duration,
    ) -> IhtResult {
        let tol = self.config.tol;
        let chop = |v: &Array1<f64>| v.mapv(|x| if x.abs() < tol { 0.0 } else { x });
        let beta = chop(&self.state.b);
        let support = beta
            .iter()
            .enumerate()
            .filter_map(|(j, &v)| (v != 0.0).then_some(j))
            .collect();
        IhtResult {
            k: self.state.k,
            beta,
            covariates: chop(&self.state.c),
            support,
            status,
            iterations,
            objective,
            elapsed,
        }
    }
}

fn max_abs(v: ArrayView1<'_, f64>) -> f64 {
    v.iter().fold(0.0f64, |m, x| m.max(x.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::Family;
    use crate::matrix::DenseDesign;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, StandardNormal};

    struct Simulated {
        x: DenseDesign,
        y: Array1<f64>,
        z: Array2<f64>,
        truth: Vec<usize>,
    }

    /// Three true predictors at columns 3, 17 and 42, so `p` must exceed 42.
    fn simulate(n: usize, p: usize, seed: u64) -> Simulated {
        assert!(p > 42, "the fixture needs at least 43 predictors, got {p}");
        let mut rng = StdRng::seed_from_u64(seed);
        let x: Array2<f64> = Array2::from_shape_fn((n, p), |_| StandardNormal.sample(&mut rng));
        let truth = vec![3, 17, 42];
        let mut y = Array1::from_shape_fn(n, |_| {
            let noise: f64 = StandardNormal.sample(&mut rng);
            0.1 * noise + 1.0
        });
        for (&j, effect) in truth.iter().zip([1.5, -2.0, 1.0]) {
            y.scaled_add(effect, &x.column(j));
        }
        Simulated {
            x: DenseDesign::new(x).unwrap(),
            y,
            z: Array2::ones((n, 1)),
            truth,
        }
    }

    #[test]
    fn recovers_the_true_support() {
        let data = simulate(120, 60, 1);
        let inputs = FitInputs::new(data.y.view(), data.z.view());
        let result = fit(&data.x, &inputs, 3, &IhtConfig::default()).unwrap();
        assert!(result.status.is_converged());
        assert_eq!(result.support, data.truth);
        assert!((result.beta[17] + 2.0).abs() < 0.1);
        assert!((result.covariates[0] - 1.0).abs() < 0.1);
    }

    #[test]
    fn repeated_fits_are_identical() {
        let data = simulate(80, 50, 2);
        let inputs = FitInputs::new(data.y.view(), data.z.view());
        let config = IhtConfig::default();
        let first = fit(&data.x, &inputs, 4, &config).unwrap();
        let second = fit(&data.x, &inputs, 4, &config).unwrap();
        assert_eq!(first.beta, second.beta);
        assert_eq!(first.covariates, second.covariates);
        assert_eq!(first.iterations, second.iterations);
    }

    #[test]
    fn reprojecting_a_fit_is_a_no_op() {
        let data = simulate(100, 50, 3);
        let inputs = FitInputs::new(data.y.view(), data.z.view());
        let result = fit(&data.x, &inputs, 5, &IhtConfig::default()).unwrap();
        let mut again = result.beta.clone();
        let mut mask = vec![false; again.len()];
        Projection::TopK.apply(again.view_mut(), 5, &mut mask);
        assert_eq!(again, result.beta);
    }

    #[test]
    fn zero_image_of_the_active_set_is_degenerate() {
        let x = DenseDesign::new(Array2::zeros((20, 10))).unwrap();
        let y = Array1::from_shape_fn(20, |i| i as f64 - 9.5);
        let z = Array2::zeros((20, 0));
        let inputs = FitInputs::new(y.view(), z.view());
        let err = fit(&x, &inputs, 2, &IhtConfig::default()).unwrap_err();
        assert!(matches!(err, IhtError::DegenerateStepSize { iteration: 1 }));
        assert!(err.is_numerical());
    }

    #[test]
    fn exhausting_iterations_is_flagged_not_fatal() {
        let data = simulate(60, 50, 4);
        let inputs = FitInputs::new(data.y.view(), data.z.view());
        let config = IhtConfig {
            max_iter: 1,
            tol: 1e-12,
            ..IhtConfig::default()
        };
        let result = fit(&data.x, &inputs, 3, &config).unwrap();
        assert_eq!(result.status, FitStatus::MaxIterationsReached);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn rejects_invalid_sparsity_levels() {
        let data = simulate(30, 50, 5);
        let inputs = FitInputs::new(data.y.view(), data.z.view());
        for k in [0, 51] {
            let err = fit(&data.x, &inputs, k, &IhtConfig::default()).unwrap_err();
            assert!(matches!(err, IhtError::InvalidConfig { parameter: "k", .. }));
        }
    }

    #[test]
    fn held_out_samples_do_not_influence_the_fit() {
        let data = simulate(90, 50, 6);
        let mut weights = Array1::ones(90);
        let mut corrupted = data.y.clone();
        for i in 60..90 {
            weights[i] = 0.0;
            corrupted[i] = 1e6;
        }
        let clean = FitInputs::new(data.y.view(), data.z.view()).with_sample_weights(weights.view());
        let dirty = FitInputs::new(corrupted.view(), data.z.view()).with_sample_weights(weights.view());
        let config = IhtConfig::default();
        let a = fit(&data.x, &clean, 3, &config).unwrap();
        let b = fit(&data.x, &dirty, 3, &config).unwrap();
        assert_eq!(a.beta, b.beta);
    }

    #[test]
    fn debiased_group_fits_find_the_signal_groups() {
        let data = simulate(120, 60, 7);
        let groups = GroupSpec {
            labels: (0..60).map(|j| j / 10).collect(),
            max_groups: 3,
        };
        let inputs = FitInputs::new(data.y.view(), data.z.view()).with_groups(&groups);
        for debias in [DebiasMode::Joint, DebiasMode::PerGroup] {
            let config = IhtConfig {
                debias,
                ..IhtConfig::default()
            };
            let result = fit(&data.x, &inputs, 1, &config).unwrap();
            assert_eq!(result.support, data.truth);
        }
    }

    #[test]
    fn reset_reuses_cached_columns_between_sizes() {
        let data = simulate(100, 50, 8);
        let inputs = FitInputs::new(data.y.view(), data.z.view());
        let config = IhtConfig::default();
        let mut session = Iht::new(&data.x, &inputs, &config).unwrap();
        let three = session.fit(3).unwrap();
        assert_eq!(session.state().cached_support(), three.support.as_slice());
        let two = session.fit(2).unwrap();
        assert_eq!(two.support.len(), 2);
        assert_eq!(fit(&data.x, &inputs, 2, &config).unwrap().beta, two.beta);
    }

    #[test]
    fn logistic_fit_runs_through_the_same_engine() {
        let data = simulate(200, 50, 9);
        let mut rng = StdRng::seed_from_u64(90);
        let y = Array1::from_shape_fn(200, |i| {
            let eta = 0.6 * data.x.data()[[i, 3]] - 0.8 * data.x.data()[[i, 17]];
            let p = 1.0 / (1.0 + (-eta).exp());
            if rng.r#gen::<f64>() < p { 1.0 } else { 0.0 }
        });
        let inputs = FitInputs::new(y.view(), data.z.view());
        let config = IhtConfig {
            family: Family::Bernoulli,
            ..IhtConfig::default()
        };
        let result = fit(&data.x, &inputs, 2, &config).unwrap();
        assert_eq!(result.support.len(), 2);
        assert!(result.objective.is_finite());
        assert!(result.objective < 0.5 * 200.0 * 2.0 * std::f64::consts::LN_2);
    }

    #[test]
    fn support_lists_exactly_the_nonzero_coefficients() {
        let data = simulate(100, 50, 10);
        let inputs = FitInputs::new(data.y.view(), data.z.view());
        let config = IhtConfig {
            tol: 0.05,
            ..IhtConfig::default()
        };
        let result = fit(&data.x, &inputs, 8, &config).unwrap();
        let nonzero: Vec<usize> = (0..50).filter(|&j| result.beta[j] != 0.0).collect();
        assert_eq!(result.support, nonzero);
        assert!(result.support.len() <= 8);
        for j in &data.truth {
            assert!(result.support.contains(j));
        }
    }

    #[test]
    fn reborrowed_inputs_accept_shorter_lived_weights() {
        let data = simulate(80, 50, 11);
        let inputs = FitInputs::new(data.y.view(), data.z.view());
        let config = IhtConfig::default();
        let full = fit(&data.x, &inputs, 3, &config).unwrap();
        let weighted = {
            let weights = Array1::ones(80);
            let fold = inputs.reborrow().with_sample_weights(weights.view());
            fit(&data.x, &fold, 3, &config).unwrap()
        };
        assert_eq!(full.beta, weighted.beta);
    }

    #[test]
    fn oversized_sparsity_is_reported_through_max_k() {
        let data = simulate(40, 50, 12);
        let z = Array2::ones((40, 3));
        let inputs = FitInputs::new(data.y.view(), z.view()).keep_leading(1);
        let session = Iht::new(&data.x, &inputs, &IhtConfig::default()).unwrap();
        assert_eq!(session.max_k(), 52);
    }
}
