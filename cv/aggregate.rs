//! Fold-weighted aggregation of held-out error and model selection.

use ndarray::{Array1, ArrayView1, ArrayView2};

/// Combines a `path x folds` error matrix into one error per sparsity level, weighting
/// fold `f` by `n_f / n`.
pub fn meanloss(errors: ArrayView2<'_, f64>, fold_sizes: &[usize]) -> Array1<f64> {
    debug_assert_eq!(errors.ncols(), fold_sizes.len());
    let total: usize = fold_sizes.iter().sum();
    let mut loss = Array1::zeros(errors.nrows());
    if total == 0 {
        return loss;
    }
    for (column, &size) in errors.columns().into_iter().zip(fold_sizes) {
        if size > 0 {
            loss.scaled_add(size as f64 / total as f64, &column);
        }
    }
    loss
}

/// Index and value of the sparsity level with the smallest aggregated error. Ties go to
/// the smaller model; non-finite errors never win.
pub fn select_best(path: &[usize], losses: ArrayView1<'_, f64>) -> Option<(usize, usize)> {
    debug_assert_eq!(path.len(), losses.len());
    path.iter()
        .zip(losses.iter())
        .enumerate()
        .filter(|(_, (_, loss))| loss.is_finite())
        .min_by(|(_, (ka, la)), (_, (kb, lb))| la.total_cmp(lb).then(ka.cmp(kb)))
        .map(|(index, (&k, _))| (index, k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn two_fold_aggregate_is_the_size_weighted_sum() {
        let errors = array![[4.0, 10.0], [2.0, 6.0], [3.0, 3.0]];
        let loss = meanloss(errors.view(), &[30, 10]);
        let expected = &errors.column(0) * 0.75 + &errors.column(1) * 0.25;
        assert_abs_diff_eq!(loss, expected, epsilon = 1e-12);
    }

    #[test]
    fn empty_folds_carry_no_weight() {
        let errors = array![[1.0, 99.0, 3.0]];
        let loss = meanloss(errors.view(), &[2, 0, 2]);
        assert_abs_diff_eq!(loss[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn ties_prefer_the_smaller_model() {
        let path = [2, 4, 6, 8];
        assert_eq!(select_best(&path, array![5.0, 1.0, 1.0, 3.0].view()), Some((1, 4)));
        assert_eq!(select_best(&path, array![f64::NAN, 2.0, 3.0, 2.0].view()), Some((1, 4)));
        assert_eq!(select_best(&[], Array1::<f64>::zeros(0).view()), None);
    }
}
