// ========================================================================================
//
//                       Cross-validation over sparsity levels
//
// ========================================================================================

pub mod aggregate;
pub mod folds;
pub mod orchestrate;
pub mod pool;
pub mod progress;
pub mod report;
pub mod store;

use crate::engine::IhtError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub use aggregate::{meanloss, select_best};
pub use folds::FoldAssignment;
pub use orchestrate::cross_validate;
pub use pool::WorkQueue;
pub use progress::{CvProgressObserver, NoopCvProgress};
pub use report::{CvReport, RefitSummary};
pub use store::{FoldStore, StoreError};

#[derive(Debug, Error)]
pub enum CvError {
    #[error("invalid cross-validation setting `{parameter}`: {message}")]
    InvalidConfig {
        parameter: &'static str,
        message: String,
    },
    #[error(transparent)]
    Iht(#[from] IhtError),
    #[error("fit failed in fold {fold} at k={k}: {source}")]
    Fit {
        fold: usize,
        k: usize,
        #[source]
        source: IhtError,
    },
    #[error("refit at the selected k={k} failed: {source}")]
    Refit {
        k: usize,
        #[source]
        source: IhtError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl CvError {
    pub(crate) fn invalid(parameter: &'static str, message: String) -> Self {
        CvError::InvalidConfig { parameter, message }
    }
}

/// Which dimension of the (fold, sparsity level) grid is spread across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CvAxis {
    /// Folds run one after another; each fold fits every sparsity level in parallel on
    /// the full matrix with held-out samples weighted to zero.
    #[default]
    Path,
    /// Folds run in parallel, each on its own materialized train and test matrices.
    Folds,
}

impl fmt::Display for CvAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CvAxis::Path => f.write_str("path"),
            CvAxis::Folds => f.write_str("folds"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Serial,
    /// A dedicated pool; zero threads means one per logical core.
    Threads { threads: usize },
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Threads { threads: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CvConfig {
    /// Candidate sparsity levels, strictly ascending.
    pub path: Vec<usize>,
    /// Number of folds `q`.
    pub folds: usize,
    pub axis: CvAxis,
    pub strategy: Strategy,
    pub seed: u64,
    /// Where fold matrices are materialized for the `folds` axis. The system temporary
    /// directory when absent.
    pub scratch_dir: Option<PathBuf>,
    /// Fit the full data at the selected sparsity level.
    pub refit: bool,
}

impl Default for CvConfig {
    fn default() -> Self {
        Self {
            path: (1..=10).collect(),
            folds: 5,
            axis: CvAxis::Path,
            strategy: Strategy::default(),
            seed: 2024,
            scratch_dir: None,
            refit: false,
        }
    }
}

impl CvConfig {
    pub fn validate(&self) -> Result<(), CvError> {
        if self.path.is_empty() {
            return Err(CvError::invalid("path", "at least one sparsity level is required".to_string()));
        }
        if self.path[0] == 0 {
            return Err(CvError::invalid("path", "sparsity levels must be positive".to_string()));
        }
        if self.path.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CvError::invalid(
                "path",
                format!("sparsity levels must be strictly ascending, got {:?}", self.path),
            ));
        }
        if self.folds < 2 {
            return Err(CvError::invalid(
                "folds",
                format!("at least 2 folds are required, got {}", self.folds),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_names_the_offending_setting() {
        let mut config = CvConfig::default();
        assert!(config.validate().is_ok());

        config.folds = 1;
        assert!(matches!(
            config.validate(),
            Err(CvError::InvalidConfig { parameter: "folds", .. })
        ));

        config.folds = 3;
        config.path = vec![2, 2, 5];
        assert!(matches!(
            config.validate(),
            Err(CvError::InvalidConfig { parameter: "path", .. })
        ));
    }
}
