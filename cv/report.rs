use super::CvAxis;
use crate::engine::{FitStatus, IhtResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Final fit at the selected sparsity level, reduced to its non-zero coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefitSummary {
    pub k: usize,
    pub converged: bool,
    pub iterations: usize,
    pub objective: f64,
    pub support: Vec<usize>,
    pub support_coefficients: Vec<f64>,
    pub covariates: Vec<f64>,
}

impl From<&IhtResult> for RefitSummary {
    fn from(result: &IhtResult) -> Self {
        Self {
            k: result.k,
            converged: result.status == FitStatus::Converged,
            iterations: result.iterations,
            objective: result.objective,
            support: result.support.clone(),
            support_coefficients: result.support.iter().map(|&j| result.beta[j]).collect(),
            covariates: result.covariates.to_vec(),
        }
    }
}

/// Outcome of one cross-validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvReport {
    pub axis: CvAxis,
    pub path: Vec<usize>,
    pub fold_sizes: Vec<usize>,
    /// Fold-weighted held-out error, one entry per sparsity level.
    pub mean_errors: Vec<f64>,
    /// Held-out error of every fold, one row per sparsity level.
    pub fold_errors: Vec<Vec<f64>>,
    pub best_index: usize,
    pub best_k: usize,
    pub refit: Option<RefitSummary>,
}

impl CvReport {
    pub fn save(&self, path: &Path) -> Result<(), crate::config::ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, crate::config::ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}
