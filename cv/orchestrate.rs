//! Dispatches (fold, sparsity level) work units and folds their held-out error together.

use super::aggregate::{meanloss, select_best};
use super::folds::FoldAssignment;
use super::pool::WorkQueue;
use super::progress::{CvProgressObserver, CvProgressStage};
use super::report::{CvReport, RefitSummary};
use super::store::FoldStore;
use super::{CvAxis, CvConfig, CvError};
use crate::config::IhtConfig;
use crate::engine::{self, FitInputs, Iht, IhtError, IhtResult};
use crate::family::Glm;
use crate::matrix::{DesignMatrix, RowSubset};
use ahash::AHashMap;
use log::info;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::path::Path;

/// Cross-validates every sparsity level of `cv.path` and reports the best one.
///
/// `inputs.sample_weights`, when given, scale every sample in both training and
/// evaluation. A missing `assignment` is drawn from `cv.seed`.
pub fn cross_validate<X: RowSubset>(
    x: &X,
    inputs: &FitInputs<'_>,
    fit_config: &IhtConfig,
    cv: &CvConfig,
    assignment: Option<FoldAssignment>,
    observer: &mut dyn CvProgressObserver,
) -> Result<CvReport, CvError> {
    cv.validate()?;
    // Input checks of a fit run once here, so a bad input never reaches a worker.
    let max_k = Iht::new(x, inputs, fit_config)?.max_k();
    let largest = cv.path.iter().copied().max().unwrap_or(0);
    if largest > max_k {
        return Err(CvError::invalid(
            "path",
            format!("sparsity level {largest} exceeds the {max_k} selectable predictors"),
        ));
    }
    let n = x.n_rows();
    let folds = match assignment {
        Some(folds) if folds.n() != n || folds.q() != cv.folds => {
            return Err(CvError::invalid(
                "folds",
                format!(
                    "assignment covers {} samples in {} folds, expected {n} samples in {} folds",
                    folds.n(),
                    folds.q(),
                    cv.folds
                ),
            ));
        }
        Some(folds) => folds,
        None => FoldAssignment::random(n, cv.folds, cv.seed)?,
    };

    let queue = WorkQueue::new(cv.strategy)?;
    info!(
        "Cross-validating {} sparsity levels over {} folds on the {} axis with {} worker(s)",
        cv.path.len(),
        folds.q(),
        cv.axis,
        queue.workers()
    );

    let base_weights = inputs
        .sample_weights
        .map_or_else(|| Array1::ones(n), |w| w.to_owned());
    let context = FoldContext {
        inputs,
        base_weights: base_weights.view(),
        config: fit_config,
        glm: Glm::new(fit_config.family, fit_config.link),
        path: &cv.path,
        folds: &folds,
    };

    observer.on_stage_start(CvProgressStage::Folds, cv.path.len() * folds.q());
    let errors = match cv.axis {
        CvAxis::Path => cv_over_path(x, &context, &queue, observer)?,
        CvAxis::Folds => {
            let scratch = cv.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);
            cv_over_folds(x, &context, &queue, &scratch, observer)?
        }
    };
    observer.on_stage_finish(CvProgressStage::Folds);

    let fold_sizes = folds.fold_sizes();
    let mean_errors = meanloss(errors.view(), &fold_sizes);
    let (best_index, best_k) = select_best(&cv.path, mean_errors.view()).ok_or_else(|| {
        CvError::invalid(
            "path",
            "no sparsity level produced a finite held-out error".to_string(),
        )
    })?;
    info!("Selected k={best_k} (mean held-out error {:.6e})", mean_errors[best_index]);

    let refit = if cv.refit {
        observer.on_stage_start(CvProgressStage::Refit, 1);
        let result = engine::fit(x, inputs, best_k, fit_config)
            .map_err(|source| CvError::Refit { k: best_k, source })?;
        observer.on_stage_advance(CvProgressStage::Refit, 1);
        observer.on_stage_finish(CvProgressStage::Refit);
        Some(RefitSummary::from(&result))
    } else {
        None
    };

    Ok(CvReport {
        axis: cv.axis,
        path: cv.path.clone(),
        fold_sizes,
        mean_errors: mean_errors.to_vec(),
        fold_errors: errors.rows().into_iter().map(|row| row.to_vec()).collect(),
        best_index,
        best_k,
        refit,
    })
}

/// Everything a work unit reads; shared immutably by all workers.
struct FoldContext<'a, 'b> {
    inputs: &'a FitInputs<'b>,
    base_weights: ArrayView1<'a, f64>,
    config: &'a IhtConfig,
    glm: Glm,
    path: &'a [usize],
    folds: &'a FoldAssignment,
}

impl FoldContext<'_, '_> {
    /// Base weights restricted to the training samples of `fold`, or to its held-out ones.
    fn weights_where(&self, fold: usize, held_out: bool) -> Array1<f64> {
        let mask = self.folds.train_mask(fold);
        let mask = if held_out { mask.mapv(|m| 1.0 - m) } else { mask };
        &self.base_weights * &mask
    }
}

fn fit_failure(fold: usize, k: usize) -> impl FnOnce(IhtError) -> CvError {
    move |source| CvError::Fit { fold, k, source }
}

/// Weighted deviance of a fit over the samples with positive `weights`.
fn held_out_error<X: DesignMatrix + ?Sized>(
    result: &IhtResult,
    x: &X,
    z: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    weights: ArrayView1<'_, f64>,
    glm: &Glm,
) -> f64 {
    let eta = result.linear_predictor(x, z);
    let mu = eta.mapv(|e| glm.mean(e));
    glm.family.deviance(y, mu.view(), weights)
}

/// Folds run in sequence; within a fold every sparsity level is its own work unit, fitted
/// on the full matrix with the held-out samples weighted to zero.
fn cv_over_path<X: DesignMatrix>(
    x: &X,
    context: &FoldContext<'_, '_>,
    queue: &WorkQueue,
    observer: &mut dyn CvProgressObserver,
) -> Result<Array2<f64>, CvError> {
    let mut results: AHashMap<(usize, usize), f64> = AHashMap::new();
    let units: Vec<usize> = (0..context.path.len()).collect();
    let mut completed = 0;

    for fold in 1..=context.folds.q() {
        if context.folds.fold_size(fold) == 0 {
            completed += units.len();
            observer.on_stage_advance(CvProgressStage::Folds, completed);
            continue;
        }
        let train = context.weights_where(fold, false);
        let test = context.weights_where(fold, true);
        let fold_inputs = context.inputs.reborrow().with_sample_weights(train.view());

        let errors = queue.run(&units, |&index| {
            let k = context.path[index];
            let result = engine::fit(x, &fold_inputs, k, context.config)
                .map_err(fit_failure(fold, k))?;
            let error = held_out_error(
                &result,
                x,
                context.inputs.z,
                context.inputs.y,
                test.view(),
                &context.glm,
            );
            Ok::<_, CvError>((index, error))
        })?;
        for (index, error) in errors {
            results.insert((fold, index), error);
        }
        completed += units.len();
        observer.on_stage_advance(CvProgressStage::Folds, completed);
        info!("Fold {fold}/{} finished", context.folds.q());
    }

    Ok(error_matrix(&results, context.path.len(), context.folds.q()))
}

/// Folds are the work units. Each one materializes its train and test rows, fits the
/// whole path sequentially on the training matrix, then scores every fit on the test
/// matrix.
fn cv_over_folds<X: RowSubset>(
    x: &X,
    context: &FoldContext<'_, '_>,
    queue: &WorkQueue,
    scratch: &Path,
    observer: &mut dyn CvProgressObserver,
) -> Result<Array2<f64>, CvError> {
    let units: Vec<usize> = (1..=context.folds.q())
        .filter(|&fold| context.folds.fold_size(fold) > 0)
        .collect();
    let inputs = context.inputs;

    let per_fold = queue.run(&units, |&fold| {
        let train_rows = context.folds.train_rows(fold);
        let test_rows = context.folds.test_rows(fold);

        let mut store = FoldStore::create(scratch, fold)?;
        let x_train = store.materialize(x, &train_rows, "train")?;
        let x_test = store.materialize(x, &test_rows, "test")?;

        let y_train = inputs.y.select(Axis(0), &train_rows);
        let y_test = inputs.y.select(Axis(0), &test_rows);
        let z_train = inputs.z.select(Axis(0), &train_rows);
        let z_test = inputs.z.select(Axis(0), &test_rows);
        let w_train = context.base_weights.select(Axis(0), &train_rows);
        let w_test = context.base_weights.select(Axis(0), &test_rows);

        let mut train_inputs = FitInputs::new(y_train.view(), z_train.view())
            .with_sample_weights(w_train.view());
        train_inputs.keep_covariates = inputs.keep_covariates;
        train_inputs.priors = inputs.priors.as_ref().map(|p| p.view());
        train_inputs.groups = inputs.groups;

        let mut session = Iht::new(&x_train, &train_inputs, context.config)
            .map_err(fit_failure(fold, context.path[0]))?;
        let mut errors = Vec::with_capacity(context.path.len());
        for &k in context.path {
            let result = session.fit(k).map_err(fit_failure(fold, k))?;
            errors.push(held_out_error(
                &result,
                &x_test,
                z_test.view(),
                y_test.view(),
                w_test.view(),
                &context.glm,
            ));
        }
        drop(session);
        drop((x_train, x_test));
        store.close();
        Ok::<_, CvError>((fold, errors))
    })?;

    let mut results: AHashMap<(usize, usize), f64> = AHashMap::new();
    for (fold, errors) in per_fold {
        for (index, error) in errors.into_iter().enumerate() {
            results.insert((fold, index), error);
        }
        info!("Fold {fold}/{} finished", context.folds.q());
    }
    observer.on_stage_advance(CvProgressStage::Folds, context.path.len() * context.folds.q());

    Ok(error_matrix(&results, context.path.len(), context.folds.q()))
}

/// `errors[path index, fold - 1]`; units that never ran (empty folds) stay zero.
fn error_matrix(results: &AHashMap<(usize, usize), f64>, n_path: usize, q: usize) -> Array2<f64> {
    Array2::from_shape_fn((n_path, q), |(index, f)| {
        results.get(&(f + 1, index)).copied().unwrap_or(0.0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cv::{NoopCvProgress, Strategy};
    use crate::matrix::DenseDesign;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, StandardNormal};

    fn data(n: usize, p: usize) -> (DenseDesign, Array1<f64>, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(5);
        let x: Array2<f64> = Array2::from_shape_fn((n, p), |_| StandardNormal.sample(&mut rng));
        let mut y = Array1::from_shape_fn(n, |_| {
            let noise: f64 = StandardNormal.sample(&mut rng);
            0.5 * noise
        });
        y.scaled_add(2.0, &x.column(1));
        y.scaled_add(-1.5, &x.column(6));
        (DenseDesign::new(x).unwrap(), y, Array2::ones((n, 1)))
    }

    #[test]
    fn both_axes_agree_on_a_shared_assignment() {
        let (x, y, z) = data(60, 20);
        let inputs = FitInputs::new(y.view(), z.view());
        let scratch = tempfile::tempdir().unwrap();
        let mut cv = CvConfig {
            path: vec![1, 2, 3],
            folds: 3,
            strategy: Strategy::Serial,
            scratch_dir: Some(scratch.path().to_path_buf()),
            ..CvConfig::default()
        };
        let folds = FoldAssignment::random(60, 3, 1).unwrap();
        let config = IhtConfig::default();

        let over_path = cross_validate(
            &x,
            &inputs,
            &config,
            &cv,
            Some(folds.clone()),
            &mut NoopCvProgress,
        )
        .unwrap();
        cv.axis = CvAxis::Folds;
        let over_folds =
            cross_validate(&x, &inputs, &config, &cv, Some(folds), &mut NoopCvProgress).unwrap();

        for (a, b) in over_path.mean_errors.iter().zip(&over_folds.mean_errors) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6 * (1.0 + a.abs()));
        }
        assert_eq!(over_path.best_k, over_folds.best_k);
        assert!(over_path.best_k >= 2);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn empty_supplied_folds_contribute_nothing() {
        let (x, y, z) = data(30, 10);
        let inputs = FitInputs::new(y.view(), z.view());
        let labels: Vec<usize> = (0..30).map(|i| if i % 2 == 0 { 1 } else { 3 }).collect();
        let folds = FoldAssignment::from_labels(labels, 30, 3).unwrap();
        let cv = CvConfig {
            path: vec![1, 2],
            folds: 3,
            strategy: Strategy::Serial,
            ..CvConfig::default()
        };
        let report = cross_validate(
            &x,
            &inputs,
            &IhtConfig::default(),
            &cv,
            Some(folds),
            &mut NoopCvProgress,
        )
        .unwrap();
        assert_eq!(report.fold_sizes, vec![15, 0, 15]);
        assert!(report.fold_errors.iter().all(|row| row[1] == 0.0));
    }

    #[test]
    fn refit_reports_the_selected_model() {
        let (x, y, z) = data(80, 15);
        let inputs = FitInputs::new(y.view(), z.view());
        let cv = CvConfig {
            path: vec![1, 2, 4],
            folds: 4,
            refit: true,
            ..CvConfig::default()
        };
        let report = cross_validate(
            &x,
            &inputs,
            &IhtConfig::default(),
            &cv,
            None,
            &mut NoopCvProgress,
        )
        .unwrap();
        let refit = report.refit.unwrap();
        assert_eq!(refit.k, report.best_k);
        assert!(refit.support.contains(&1));
        assert!(refit.support.contains(&6));
    }

    #[test]
    fn oversized_levels_are_rejected_before_any_fold_runs() {
        let (x, y, z) = data(30, 8);
        let inputs = FitInputs::new(y.view(), z.view());
        let cv = CvConfig {
            path: vec![1, 2, 9],
            folds: 3,
            strategy: Strategy::Serial,
            ..CvConfig::default()
        };
        let mut observer = CountingObserver::default();
        let err = cross_validate(
            &x,
            &inputs,
            &IhtConfig::default(),
            &cv,
            None,
            &mut observer,
        )
        .unwrap_err();
        assert!(matches!(err, CvError::InvalidConfig { parameter: "path", .. }));
        assert_eq!(observer.starts, 0);

        let short = Array1::zeros(29);
        let mismatched = FitInputs::new(short.view(), z.view());
        let cv = CvConfig {
            path: vec![1, 2],
            ..cv
        };
        let err = cross_validate(
            &x,
            &mismatched,
            &IhtConfig::default(),
            &cv,
            None,
            &mut observer,
        )
        .unwrap_err();
        assert!(matches!(err, CvError::Iht(IhtError::DimensionMismatch(_))));
        assert_eq!(observer.starts, 0);
    }

    #[derive(Default)]
    struct CountingObserver {
        starts: usize,
    }

    impl CvProgressObserver for CountingObserver {
        fn on_stage_start(&mut self, _: CvProgressStage, _: usize) {
            self.starts += 1;
        }
    }
}
