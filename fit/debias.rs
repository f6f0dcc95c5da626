//! Unpenalized refits on a fixed support.
//!
//! Both the covariate-only starting point of a fit and the optional debiasing step solve
//! the same problem: maximize the likelihood over a small dense design with the rest of
//! the linear predictor held fixed as an offset. They share one IRLS routine.

use crate::family::Glm;
use crate::linalg::{LinalgError, weighted_least_squares};
use ndarray::{Array1, ArrayView1, ArrayView2, Zip};

const IRLS_MAX_ITER: usize = 25;
const IRLS_TOL: f64 = 1e-8;

/// Iteratively reweighted least squares for `eta = offset + design * beta`, starting from
/// the linear predictor `eta`.
pub(crate) fn irls(
    design: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    cv_wts: ArrayView1<'_, f64>,
    offset: ArrayView1<'_, f64>,
    mut eta: Array1<f64>,
    glm: &Glm,
) -> Result<Array1<f64>, LinalgError> {
    let n = y.len();
    let mut mu = Array1::zeros(n);
    let mut weights = Array1::zeros(n);
    let mut target = Array1::zeros(n);
    let mut beta: Array1<f64> = Array1::zeros(design.ncols());

    for iteration in 0..IRLS_MAX_ITER {
        glm.fill_mean(eta.view(), mu.view_mut());
        glm.fisher_weights(eta.view(), mu.view(), cv_wts, weights.view_mut());
        Zip::from(&mut target)
            .and(&eta)
            .and(&offset)
            .and(&y)
            .and(&mu)
            .and(&cv_wts)
            .for_each(|t, &e, &o, &yi, &mi, &wi| {
                *t = if wi == 0.0 {
                    0.0
                } else {
                    e - o + (yi - mi) / glm.link.mu_eta(e)
                };
            });

        let next = weighted_least_squares(design, weights.view(), target.view())?;
        let change = (&next - &beta).iter().fold(0.0f64, |m, d| m.max(d.abs()));
        let scale = 1.0 + next.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        eta = &offset + &design.dot(&next);
        beta = next;
        if iteration > 0 && change < IRLS_TOL * scale {
            break;
        }
    }
    Ok(beta)
}

/// Sum of the per-sample weights, the effective training size.
pub(crate) fn weighted_count(cv_wts: ArrayView1<'_, f64>) -> f64 {
    cv_wts.sum()
}

/// Fits the covariates alone, starting from the link of the weighted mean response.
pub(crate) fn covariate_fit(
    z: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    cv_wts: ArrayView1<'_, f64>,
    glm: &Glm,
) -> Result<Array1<f64>, LinalgError> {
    let total = weighted_count(cv_wts);
    let mean = if total > 0.0 { y.dot(&cv_wts) / total } else { 0.0 };
    let start = glm.link.link(glm.family.clamp_mean(mean));
    let eta = Array1::from_elem(y.len(), start);
    let offset = Array1::zeros(y.len());
    irls(z, y, cv_wts, offset.view(), eta, glm)
}

/// Refits each block against the linear predictor of all the others, in order.
///
/// `eta` must equal the sum of `blocks[i] * coefs[i]` on entry and is kept in sync.
/// On error the coefficients refitted so far are kept.
pub(crate) fn refit_blocks(
    blocks: &[ArrayView2<'_, f64>],
    coefs: &mut [Array1<f64>],
    eta: &mut Array1<f64>,
    y: ArrayView1<'_, f64>,
    cv_wts: ArrayView1<'_, f64>,
    glm: &Glm,
) -> Result<(), LinalgError> {
    debug_assert_eq!(blocks.len(), coefs.len());
    for (block, coef) in blocks.iter().zip(coefs.iter_mut()) {
        if block.ncols() == 0 {
            continue;
        }
        let offset = &*eta - &block.dot(&*coef);
        let refit = irls(*block, y, cv_wts, offset.view(), eta.clone(), glm)?;
        *eta = &offset + &block.dot(&refit);
        *coef = refit;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{Family, Link};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    #[test]
    fn normal_identity_refit_is_weighted_least_squares() {
        let glm = Glm::new(Family::Normal, None);
        let z = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        let y = array![1.0, 3.0, 5.0, 40.0];
        let w = array![1.0, 1.0, 1.0, 0.0];
        let fitted = covariate_fit(z.view(), y.view(), w.view(), &glm).unwrap();
        assert_abs_diff_eq!(fitted, array![1.0, 2.0], epsilon = 1e-10);
    }

    #[test]
    fn logistic_intercept_matches_the_log_odds() {
        let glm = Glm::new(Family::Bernoulli, Some(Link::Logit));
        let z = Array2::ones((5, 1));
        let y = array![1.0, 0.0, 1.0, 1.0, 0.0];
        let w = Array1::ones(5);
        let fitted = covariate_fit(z.view(), y.view(), w.view(), &glm).unwrap();
        assert_abs_diff_eq!(fitted[0], (0.6f64 / 0.4).ln(), epsilon = 1e-8);
    }

    #[test]
    fn poisson_slope_is_recovered_from_exact_means() {
        let glm = Glm::new(Family::Poisson, None);
        let z = array![[1.0, -1.0], [1.0, 0.0], [1.0, 1.0], [1.0, 2.0]];
        let y = z.dot(&array![0.3, 0.5]).mapv(f64::exp);
        let w = Array1::ones(4);
        let fitted = covariate_fit(z.view(), y.view(), w.view(), &glm).unwrap();
        assert_abs_diff_eq!(fitted, array![0.3, 0.5], epsilon = 1e-6);
    }

    #[test]
    fn block_refit_keeps_the_linear_predictor_in_sync() {
        let glm = Glm::new(Family::Normal, None);
        let a = array![[1.0], [1.0], [1.0], [1.0]];
        let b = array![[0.0], [1.0], [0.0], [1.0]];
        let y = array![1.0, 3.0, 1.2, 2.8];
        let w = Array1::ones(4);
        let mut coefs = vec![Array1::zeros(1), Array1::zeros(1)];
        let mut eta = Array1::zeros(4);
        refit_blocks(
            &[a.view(), b.view()],
            &mut coefs,
            &mut eta,
            y.view(),
            w.view(),
            &glm,
        )
        .unwrap();
        let expected = a.dot(&coefs[0]) + b.dot(&coefs[1]);
        assert_abs_diff_eq!(eta, expected, epsilon = 1e-12);
        assert_abs_diff_eq!(coefs[0][0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(coefs[1][0], 0.9, epsilon = 1e-12);
    }
}
