//! Execution strategies for independent work units.

use super::{CvError, Strategy};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Runs a batch of work units and blocks until all of them have finished.
///
/// Results come back in submission order regardless of completion order. The first
/// failing unit decides the error; results of units still in flight are discarded.
pub enum WorkQueue {
    Serial,
    Pool(ThreadPool),
}

impl WorkQueue {
    pub fn new(strategy: Strategy) -> Result<Self, CvError> {
        match strategy {
            Strategy::Serial => Ok(WorkQueue::Serial),
            Strategy::Threads { threads } => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("hardthresh-cv-{index}"))
                    .build()?;
                Ok(WorkQueue::Pool(pool))
            }
        }
    }

    pub fn workers(&self) -> usize {
        match self {
            WorkQueue::Serial => 1,
            WorkQueue::Pool(pool) => pool.current_num_threads(),
        }
    }

    pub fn run<U, T, E, F>(&self, units: &[U], work: F) -> Result<Vec<T>, E>
    where
        U: Sync,
        T: Send,
        E: Send,
        F: Fn(&U) -> Result<T, E> + Sync,
    {
        match self {
            WorkQueue::Serial => units.iter().map(work).collect(),
            WorkQueue::Pool(pool) => pool.install(|| units.par_iter().map(&work).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_strategies_preserve_submission_order() {
        let units: Vec<usize> = (0..50).collect();
        for strategy in [Strategy::Serial, Strategy::Threads { threads: 4 }] {
            let queue = WorkQueue::new(strategy).unwrap();
            let squares: Result<Vec<usize>, ()> = queue.run(&units, |&u| Ok(u * u));
            assert_eq!(squares.unwrap(), units.iter().map(|u| u * u).collect::<Vec<_>>());
        }
    }

    #[test]
    fn a_failing_unit_fails_the_batch() {
        let queue = WorkQueue::new(Strategy::Threads { threads: 2 }).unwrap();
        let units: Vec<usize> = (0..20).collect();
        let outcome = queue.run(&units, |&u| if u == 13 { Err(u) } else { Ok(u) });
        assert_eq!(outcome, Err(13));
    }

    #[test]
    fn pooled_units_do_not_nest_parallel_kernels() {
        let queue = WorkQueue::new(Strategy::Threads { threads: 2 }).unwrap();
        let nested = queue
            .run(&[0usize, 1][..], |_| {
                Ok::<_, ()>(crate::matrix::inner_parallelism_allowed(usize::MAX))
            })
            .unwrap();
        assert_eq!(nested, vec![false, false]);
        assert_eq!(queue.workers(), 2);
    }
}
