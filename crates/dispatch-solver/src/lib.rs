//! The `Solver` trait a user implements to plug work into the dispatch
//! master/worker pair, plus a demo implementation.
//!
//! The master side drives `init_as_master`/`set_result`/`finish`; the worker
//! side drives `init_as_worker`/`compute`. Neither side ever sees the other's
//! methods invoked — `dispatch-master` only calls the master methods,
//! `dispatch-worker` only calls the worker methods.

use std::sync::Mutex;
use std::time::Duration;

use dispatch_proto::Variants;

/// Appends newly discovered task ids to the scheduler's pending queue.
/// Implemented by `dispatch-master`, passed to `Solver::init_as_master`.
pub trait TaskAppender {
    fn add_task(&mut self, task_id: i64);
}

/// User-supplied work: what tasks exist, how to compute one, and what to do
/// with results once they're all in.
pub trait Solver: Send + Sync {
    /// Called once on the master at startup; push every task id that should
    /// be dispatched via `appender`.
    fn init_as_master(&self, appender: &mut dyn TaskAppender);

    /// Called once on a worker at startup.
    fn init_as_worker(&self) {}

    /// Called on a worker when the master assigns `task_id`.
    fn compute(&self, task_id: i64) -> Variants;

    /// Called on the master when a worker reports a result for `task_id`.
    fn set_result(&self, task_id: i64, result: &Variants, time_usage: Duration);

    /// Called on the master once every dispatched task has a result.
    fn finish(&self) {}
}

/// Demo solver: dispatches tasks `0..count`, computes `task_id * task_id`,
/// and sums results in `finish`.
pub struct SquareSumSolver {
    count: i64,
    results: Mutex<Vec<i64>>,
}

impl SquareSumSolver {
    pub fn new(count: i64) -> Self {
        Self {
            count,
            results: Mutex::new(vec![0; count as usize]),
        }
    }

    pub fn sum(&self) -> i64 {
        self.results.lock().expect("results lock poisoned").iter().sum()
    }
}

impl Default for SquareSumSolver {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Solver for SquareSumSolver {
    fn init_as_master(&self, appender: &mut dyn TaskAppender) {
        for task_id in 0..self.count {
            appender.add_task(task_id);
        }
    }

    fn compute(&self, task_id: i64) -> Variants {
        Variants::single((task_id * task_id).into())
    }

    fn set_result(&self, task_id: i64, result: &Variants, time_usage: Duration) {
        let value = match result.iter().next() {
            Some(dispatch_proto::VariantItem::I64(v)) => *v,
            Some(dispatch_proto::VariantItem::I32(v)) => *v as i64,
            _ => {
                tracing::warn!(task_id, "result missing or wrong type, treating as 0");
                0
            }
        };
        tracing::debug!(task_id, value, ?time_usage, "task result recorded");
        let mut results = self.results.lock().expect("results lock poisoned");
        if let Some(slot) = results.get_mut(task_id as usize) {
            *slot = value;
        }
    }

    fn finish(&self) {
        tracing::info!(sum = self.sum(), "all tasks complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecAppender(Vec<i64>);
    impl TaskAppender for VecAppender {
        fn add_task(&mut self, task_id: i64) {
            self.0.push(task_id);
        }
    }

    #[test]
    fn init_as_master_appends_all_tasks() {
        let solver = SquareSumSolver::new(10);
        let mut appender = VecAppender(Vec::new());
        solver.init_as_master(&mut appender);
        assert_eq!(appender.0, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn compute_squares_task_id() {
        let solver = SquareSumSolver::new(10);
        let result = solver.compute(4);
        match result.iter().next() {
            Some(dispatch_proto::VariantItem::I64(v)) => assert_eq!(*v, 16),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn finish_sums_all_results() {
        let solver = SquareSumSolver::new(5);
        for task_id in 0..5 {
            let result = solver.compute(task_id);
            solver.set_result(task_id, &result, Duration::from_millis(1));
        }
        // 0 + 1 + 4 + 9 + 16 = 30
        assert_eq!(solver.sum(), 30);
    }

    #[test]
    fn set_result_ignores_out_of_range_task_id() {
        let solver = SquareSumSolver::new(2);
        let result = Variants::single(99i64.into());
        solver.set_result(5, &result, Duration::from_millis(1));
        assert_eq!(solver.sum(), 0);
    }
}
