use std::fmt;

/// Stages reported while cross-validating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CvProgressStage {
    Folds,
    Refit,
}

impl CvProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Folds => "cross-validation work units",
            Self::Refit => "refit at the selected sparsity level",
        }
    }
}

impl fmt::Display for CvProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting progress as batches of work units complete.
pub trait CvProgressObserver {
    fn on_stage_start(&mut self, stage: CvProgressStage, total_units: usize) {
        let _ = (stage, total_units);
    }
    fn on_stage_advance(&mut self, stage: CvProgressStage, completed_units: usize) {
        let _ = (stage, completed_units);
    }
    fn on_stage_finish(&mut self, stage: CvProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopCvProgress;

impl CvProgressObserver for NoopCvProgress {}
