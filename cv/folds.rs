use super::CvError;
use log::warn;
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Fold labels in `1..=q`, one per sample, fixed for a cross-validation run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoldAssignment {
    labels: Vec<usize>,
    q: usize,
}

impl FoldAssignment {
    /// Shuffles the samples with a seeded generator and deals them round-robin, so fold
    /// sizes differ by at most one and no fold is empty when `n >= q`.
    pub fn random(n: usize, q: usize, seed: u64) -> Result<Self, CvError> {
        if q < 2 {
            return Err(CvError::invalid("folds", format!("at least 2 folds are required, got {q}")));
        }
        if n < q {
            return Err(CvError::invalid(
                "folds",
                format!("{q} folds cannot be formed from {n} samples"),
            ));
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let mut labels = vec![0; n];
        for (position, &sample) in order.iter().enumerate() {
            labels[sample] = position % q + 1;
        }
        Ok(Self { labels, q })
    }

    /// Validates a supplied assignment. Folds without samples are allowed and contribute
    /// nothing to the aggregated error.
    pub fn from_labels(labels: Vec<usize>, n: usize, q: usize) -> Result<Self, CvError> {
        if q < 2 {
            return Err(CvError::invalid("folds", format!("at least 2 folds are required, got {q}")));
        }
        if labels.len() != n {
            return Err(CvError::invalid(
                "folds",
                format!("{} fold labels supplied for {n} samples", labels.len()),
            ));
        }
        if let Some((sample, &label)) = labels
            .iter()
            .enumerate()
            .find(|&(_, &label)| label == 0 || label > q)
        {
            return Err(CvError::invalid(
                "folds",
                format!("sample {sample} has fold label {label}, expected a value in 1..={q}"),
            ));
        }
        let assignment = Self { labels, q };
        for fold in 1..=q {
            if assignment.fold_size(fold) == 0 {
                warn!("fold {fold} has no samples and will carry zero weight");
            }
        }
        Ok(assignment)
    }

    pub fn q(&self) -> usize {
        self.q
    }

    pub fn n(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn fold_size(&self, fold: usize) -> usize {
        self.labels.iter().filter(|&&label| label == fold).count()
    }

    pub fn fold_sizes(&self) -> Vec<usize> {
        (1..=self.q).map(|fold| self.fold_size(fold)).collect()
    }

    pub fn test_rows(&self, fold: usize) -> Vec<usize> {
        self.rows_where(|label| label == fold)
    }

    pub fn train_rows(&self, fold: usize) -> Vec<usize> {
        self.rows_where(|label| label != fold)
    }

    /// One for training samples of `fold`, zero for its held-out samples.
    pub fn train_mask(&self, fold: usize) -> Array1<f64> {
        self.labels
            .iter()
            .map(|&label| if label == fold { 0.0 } else { 1.0 })
            .collect()
    }

    fn rows_where(&self, keep: impl Fn(usize) -> bool) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(i, &label)| keep(label).then_some(i))
            .collect()
    }
}
