//! Fold-local train and test matrices materialized on disk.
//!
//! Each fold owns its own store. Artifact names come from `tempfile`, so concurrent folds
//! (or concurrent runs sharing a scratch directory) never collide, and every artifact is
//! removed exactly once: by [`FoldStore::close`] on the success path, or by `Drop` when a
//! fold bails out early. A file that cannot be removed is reported, never escalated.

use crate::matrix::{MatrixError, RowSubset};
use itertools::Itertools;
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error in scratch directory '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to materialize fold {fold} {role} rows: {source}")]
    Materialize {
        fold: usize,
        role: &'static str,
        #[source]
        source: MatrixError,
    },
}

pub struct FoldStore {
    dir: PathBuf,
    fold: usize,
    artifacts: Vec<TempPath>,
}

impl FoldStore {
    pub fn create(scratch_dir: &Path, fold: usize) -> Result<Self, StoreError> {
        fs::create_dir_all(scratch_dir).map_err(|source| StoreError::Io {
            path: scratch_dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir: scratch_dir.to_path_buf(),
            fold,
            artifacts: Vec::new(),
        })
    }

    pub fn fold(&self) -> usize {
        self.fold
    }

    /// Writes `rows` of `x` to a fresh artifact and maps it back in.
    pub fn materialize<X: RowSubset>(
        &mut self,
        x: &X,
        rows: &[usize],
        role: &'static str,
    ) -> Result<X::Persisted, StoreError> {
        let file = tempfile::Builder::new()
            .prefix(&format!("fold{}-{role}-", self.fold))
            .suffix(".bin")
            .tempfile_in(&self.dir)
            .map_err(|source| StoreError::Io {
                path: self.dir.display().to_string(),
                source,
            })?;
        let artifact = file.into_temp_path();
        let path = artifact.to_path_buf();
        // Tracked before writing so a partial artifact is still cleaned up.
        self.artifacts.push(artifact);

        let wrap = |source| StoreError::Materialize {
            fold: self.fold,
            role,
            source,
        };
        x.persist_rows(rows, &path).map_err(wrap)?;
        let view = x.open_persisted(&path, rows.len()).map_err(wrap)?;
        debug!("fold {}: materialized {} {role} rows at {}", self.fold, rows.len(), path.display());
        Ok(view)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.artifacts.iter().map(|a| a.to_path_buf()).collect()
    }

    /// Deletes every artifact and returns the paths that could not be removed.
    pub fn close(mut self) -> Vec<PathBuf> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> Vec<PathBuf> {
        let mut orphans = Vec::new();
        for artifact in self.artifacts.drain(..) {
            let path = artifact.to_path_buf();
            match artifact.close() {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("fold {}: could not remove '{}': {e}", self.fold, path.display());
                    orphans.push(path);
                }
            }
        }
        if !orphans.is_empty() {
            warn!(
                "fold {}: {} orphaned artifact(s) left behind: {}",
                self.fold,
                orphans.len(),
                orphans.iter().map(|p| p.display()).join(", ")
            );
        }
        orphans
    }
}

impl Drop for FoldStore {
    fn drop(&mut self) {
        if !self.artifacts.is_empty() {
            self.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{DenseDesign, DesignMatrix};
    use ndarray::array;

    fn design() -> DenseDesign {
        DenseDesign::new(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).unwrap()
    }

    #[test]
    fn close_removes_every_artifact() {
        let scratch = tempfile::tempdir().unwrap();
        let x = design();
        let mut store = FoldStore::create(scratch.path(), 2).unwrap();
        let train = store.materialize(&x, &[0, 2], "train").unwrap();
        let test = store.materialize(&x, &[1], "test").unwrap();
        assert_eq!(train.columns(&[1]), array![[2.0], [6.0]]);
        assert_eq!(test.n_rows(), 1);

        let paths = store.paths();
        assert_eq!(paths.len(), 2);
        assert_ne!(paths[0], paths[1]);
        assert!(paths.iter().all(|p| p.exists()));
        let name = paths[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("fold2-train-"));

        drop((train, test));
        assert!(store.close().is_empty());
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn dropping_a_failed_store_cleans_up() {
        let scratch = tempfile::tempdir().unwrap();
        let x = design();
        let paths = {
            let mut store = FoldStore::create(scratch.path(), 1).unwrap();
            store.materialize(&x, &[0], "train").unwrap();
            let err = store.materialize(&x, &[9], "test").err().unwrap();
            assert!(matches!(err, StoreError::Materialize { fold: 1, role: "test", .. }));
            store.paths()
        };
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn concurrent_stores_never_share_files() {
        let scratch = tempfile::tempdir().unwrap();
        let x = design();
        let mut a = FoldStore::create(scratch.path(), 1).unwrap();
        let mut b = FoldStore::create(scratch.path(), 1).unwrap();
        a.materialize(&x, &[0], "train").unwrap();
        b.materialize(&x, &[0], "train").unwrap();
        assert_ne!(a.paths(), b.paths());
        assert!(a.close().is_empty());
        assert!(b.paths().iter().all(|p| p.exists()));
    }
}
