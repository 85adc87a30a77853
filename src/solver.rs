//! Solve entry point.
//!
//! The driver validates the options, snapshots the problem's parameter values, runs the
//! selected minimizer and writes the final accepted values back into the problem. Nothing
//! is written while the minimizer runs, and nothing at all if the residuals could not be
//! evaluated at the starting point.

use std::time::Instant;

use tracing::{debug, info};

use crate::core::{Evaluator, ParameterState, Problem};
use crate::error::LsqResult;
use crate::optimizer::{
    MinimizerOutput, OptimizerError, SolverOptions, Summary, TerminationReason,
    create_minimizer,
};

/// Reusable solver holding validated options.
#[derive(Debug, Clone)]
pub struct Solver {
    options: SolverOptions,
}

impl Solver {
    pub fn new(options: SolverOptions) -> LsqResult<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Minimize `problem` in place and report the outcome.
    pub fn solve(&self, problem: &mut Problem) -> LsqResult<Summary> {
        let start = Instant::now();
        let options = &self.options;
        options.print_configuration();

        let layout = problem.layout().clone();
        let linear_solver_type = options.linear_solver_type.resolve(layout.num_columns());
        let evaluator =
            Evaluator::new(problem, &layout).with_parallel(options.parallel_evaluation);

        if problem.num_residual_blocks() == 0 {
            let mut summary = Summary::new(options.minimizer_type, linear_solver_type, &evaluator);
            summary.terminate(
                TerminationReason::EmptyProblem,
                "Problem has no residual blocks",
            );
            summary.total_time = start.elapsed();
            return Ok(summary);
        }

        let initial = ParameterState::from_problem(problem);
        let run = || {
            let mut minimizer = create_minimizer(options, linear_solver_type);
            minimizer.minimize(&evaluator, initial)
        };
        let MinimizerOutput { state, mut summary } = match options.num_threads {
            Some(num_threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .map_err(|e| {
                    OptimizerError::ThreadPool(format!("{num_threads} threads"))
                        .log_with_source(e)
                })?
                .install(run),
            None => run(),
        };

        if summary.termination_reason != TerminationReason::InitialEvaluationFailed {
            problem.write_state(&state);
        }
        summary.total_time = start.elapsed();

        if options.minimizer_progress_to_stdout {
            info!("{}", summary.brief_report());
        } else {
            debug!("{}", summary.brief_report());
        }
        Ok(summary)
    }
}

/// Minimize `problem` with `options`.
///
/// Returns `Err` only for invalid options; every outcome of the minimization itself,
/// failures included, is reported in the [`Summary`].
pub fn solve(options: &SolverOptions, problem: &mut Problem) -> LsqResult<Summary> {
    Solver::new(options.clone())?.solve(problem)
}
