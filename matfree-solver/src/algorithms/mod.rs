use crate::operator::Operator;
use matfree_core::{DeviceVector, Result};
use std::future::Future;

pub mod cg;
pub mod update_cg;

pub use cg::ConjugateGradient;

// --- Algorithm Trait Definition ---

/// An iterative solver that keeps its scratch space between solves.
pub trait LinearSolver {
    /// Solves `A x = b` in place.
    ///
    /// # Arguments
    ///
    /// * `op` - The operator `A`.
    /// * `x` - Initial guess, overwritten with the solution.
    /// * `r` - Holds `b` on entry and the final residual on return.
    /// * `tolerance` - Relative tolerance on the residual norm, with an absolute floor of the same size.
    /// * `max_iterations` - Iteration budget.
    /// * `verbose` - Log progress on rank 0.
    ///
    /// # Returns
    ///
    /// The number of iterations performed. Running out of iterations is not
    /// an error; compare against `max_iterations` to detect it. After an
    /// error the solver is back in [`SolverState::Uninitialized`] and can be
    /// reused.
    fn solve<O>(
        &mut self,
        op: &O,
        x: &mut DeviceVector,
        r: &mut DeviceVector,
        tolerance: f64,
        max_iterations: usize,
        verbose: bool,
    ) -> impl Future<Output = Result<usize>> + Send
    where
        O: Operator + Sync;
}

/// Where a solver is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    Uninitialized,
    Iterating,
    Converged,
    MaxIterExceeded,
}

/// How the fused update reduces the residual norm within a rank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReductionMode {
    /// One kernel; blocks add their partial sums to a shared accumulator
    /// atomically, so the summation order varies between runs.
    #[default]
    Atomic,
    /// Blocks write partial sums and a second kernel adds them in block
    /// order. Reproducible.
    BlockPartials,
}

/// Diagnostics from the most recent solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveInfo {
    pub iterations: usize,
    /// Euclidean norm of the final residual. NaN if cancellation drove the
    /// reduced squared norm negative.
    pub residual_norm: f64,
    pub state: SolverState,
    /// Squared residual norm before the first iteration and after each one.
    pub rdotr_history: Vec<f64>,
}
