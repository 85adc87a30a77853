//! Gauss-Newton minimizer with Armijo backtracking.
//!
//! The search direction solves the normal equations with a tiny regularizing diagonal
//! (`min_lm_diagonal · diag(JᵀJ)`). When that solve fails, when the result is not a descent
//! direction, or after a failed search, the steepest descent direction `−g` is used instead.
//!
//! Starting from `α = 1`, the step length is contracted until
//!
//! ```text
//! F(x + αd) ≤ F(x) + c₁ · gᵀ(αd)
//! ```
//!
//! The convergence tests only run after a step has been accepted.

use std::ops::Mul;
use std::time::Instant;

use faer::Mat;
use tracing::{debug, info, warn};

use crate::core::{Evaluator, ParameterState};
use crate::linalg::{LinearSolver, LinearSolverType, create_linear_solver};
use crate::optimizer::{
    IterationStats, Linearization, Minimizer, MinimizerOutput, MinimizerType, SolverOptions,
    Summary, TerminationReason,
};

/// Outcome of one backtracking search.
enum SearchResult {
    Accepted {
        state: ParameterState,
        step_norm: f64,
        step_length: f64,
        steps: usize,
    },
    /// No trial point satisfied the sufficient decrease condition
    Failed { step_norm: f64, steps: usize },
}

pub struct LineSearchMinimizer {
    options: SolverOptions,
    linear_solver_type: LinearSolverType,
    linear_solver: Box<dyn LinearSolver>,
}

impl LineSearchMinimizer {
    pub fn new(options: SolverOptions, linear_solver_type: LinearSolverType) -> Self {
        let linear_solver = create_linear_solver(
            linear_solver_type,
            options.max_linear_solver_iterations,
            options.linear_solver_tolerance,
        );
        Self {
            options,
            linear_solver_type,
            linear_solver,
        }
    }

    fn steepest_descent(gradient: &Mat<f64>) -> Mat<f64> {
        -gradient
    }

    /// Gauss-Newton direction, or `None` if it is unusable.
    fn gauss_newton_direction(&mut self, current: &Linearization) -> Option<(Mat<f64>, usize)> {
        let diagonal: Vec<f64> = current
            .column_norms
            .iter()
            .map(|&d| {
                self.options.min_lm_diagonal
                    * d.clamp(self.options.min_lm_diagonal, self.options.max_lm_diagonal)
            })
            .collect();
        match self.linear_solver.solve_augmented_equation(
            &current.residuals,
            &current.jacobian,
            &diagonal,
        ) {
            Ok(solution) if current.gradient.col(0).transpose() * solution.step.col(0) < 0.0 => {
                Some((solution.step, solution.iterations))
            }
            Ok(_) => {
                debug!("gauss-newton step is not a descent direction");
                None
            }
            Err(e) => {
                warn!("linear solve failed: {}", e);
                None
            }
        }
    }

    fn search(
        &self,
        evaluator: &Evaluator<'_>,
        current: &Linearization,
        direction: &Mat<f64>,
        summary: &mut Summary,
    ) -> SearchResult {
        let problem = evaluator.problem();
        let layout = evaluator.layout();
        let x_norm = current.state.variable_norm(layout);
        let tolerance = self.options.parameter_tolerance * (x_norm + self.options.parameter_tolerance);

        let mut step_length = 1.0;
        let mut step_norm = 0.0;
        for k in 0..self.options.max_line_search_steps {
            let scaled = direction.as_ref().mul(faer::Scale(step_length));
            let state = current.state.plus(problem, layout, &scaled);
            let step = state.difference(&current.state, layout);
            step_norm = step.norm_l2();
            // A contracted step below the parameter tolerance ends the search.
            if k > 0 && step_norm <= tolerance {
                return SearchResult::Failed {
                    step_norm,
                    steps: k,
                };
            }

            let slope = current.gradient.col(0).transpose() * step.col(0);
            summary.num_residual_evaluations += 1;
            match evaluator.evaluate_cost(&state) {
                Ok(cost)
                    if slope < 0.0
                        && cost
                            <= current.cost
                                + self.options.line_search_sufficient_decrease * slope =>
                {
                    return SearchResult::Accepted {
                        state,
                        step_norm,
                        step_length,
                        steps: k + 1,
                    };
                }
                Ok(_) => {}
                Err(e) => debug!("trial point not evaluable: {}", e),
            }
            step_length *= self.options.line_search_contraction;
        }
        SearchResult::Failed {
            step_norm,
            steps: self.options.max_line_search_steps,
        }
    }

    fn record(&self, summary: &mut Summary, stats: IterationStats) {
        stats.log_line(self.options.minimizer_progress_to_stdout);
        if self.options.record_iteration_trace {
            summary.trace.push(stats);
        }
    }
}

impl Minimizer for LineSearchMinimizer {
    fn minimize(
        &mut self,
        evaluator: &Evaluator<'_>,
        initial: ParameterState,
    ) -> MinimizerOutput {
        let start = Instant::now();
        let options = self.options.clone();
        let mut summary = Summary::new(MinimizerType::LineSearch, self.linear_solver_type, evaluator);

        summary.num_residual_evaluations += 1;
        summary.num_jacobian_evaluations += 1;
        let mut current = match Linearization::at(evaluator, initial.clone()) {
            Ok(current) => current,
            Err(e) => {
                warn!("initial evaluation failed: {}", e);
                summary.total_time = start.elapsed();
                summary.terminate(
                    TerminationReason::InitialEvaluationFailed,
                    format!("Residual evaluation failed at the initial point: {e}"),
                );
                return MinimizerOutput {
                    state: initial,
                    summary,
                };
            }
        };
        summary.initial_cost = current.cost;

        IterationStats::log_header(options.minimizer_progress_to_stdout);
        self.record(
            &mut summary,
            IterationStats {
                iteration: 0,
                cost: current.cost,
                cost_change: 0.0,
                gradient_norm: current.gradient_norm,
                step_norm: 0.0,
                tr_ratio: 0.0,
                tr_radius: 0.0,
                ls_iter: 0,
                iter_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                accepted: true,
            },
        );

        let mut iteration = 0;
        let mut consecutive_failures = 0;
        let mut force_steepest_descent = false;

        let (reason, message) = loop {
            if current.gradient_norm <= options.gradient_tolerance {
                break (
                    TerminationReason::GradientTolerance,
                    format!(
                        "Gradient tolerance reached. Gradient max norm: {:.3e} <= {:.3e}",
                        current.gradient_norm, options.gradient_tolerance
                    ),
                );
            }
            if let Some(reason) = options.interruption(start) {
                break (reason, reason.to_string());
            }
            if iteration >= options.max_iterations {
                break (
                    TerminationReason::MaxIterations,
                    format!(
                        "Maximum number of iterations reached. Number of iterations: {iteration}"
                    ),
                );
            }
            iteration += 1;
            let iteration_start = Instant::now();

            let gauss_newton = if force_steepest_descent {
                None
            } else {
                self.gauss_newton_direction(&current)
            };
            let direction = match gauss_newton {
                Some((direction, linear_iterations)) => {
                    summary.num_linear_solver_iterations += linear_iterations;
                    direction
                }
                None => Self::steepest_descent(&current.gradient),
            };

            match self.search(evaluator, &current, &direction, &mut summary) {
                SearchResult::Failed { step_norm, steps } => {
                    summary.final_step_norm = step_norm;
                    summary.unsuccessful_steps += 1;
                    consecutive_failures += 1;
                    force_steepest_descent = true;
                    self.record(
                        &mut summary,
                        IterationStats {
                            iteration,
                            cost: current.cost,
                            cost_change: 0.0,
                            gradient_norm: current.gradient_norm,
                            step_norm,
                            tr_ratio: 0.0,
                            tr_radius: 0.0,
                            ls_iter: steps,
                            iter_time_ms: iteration_start.elapsed().as_secs_f64() * 1000.0,
                            total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                            accepted: false,
                        },
                    );
                    if consecutive_failures > options.max_consecutive_rejections {
                        break (
                            TerminationReason::NoProgress,
                            format!("{consecutive_failures} consecutive failed line searches"),
                        );
                    }
                }
                SearchResult::Accepted {
                    state,
                    step_norm,
                    step_length,
                    steps,
                } => {
                    summary.final_step_norm = step_norm;
                    summary.successful_steps += 1;
                    consecutive_failures = 0;
                    force_steepest_descent = false;

                    let old_cost = current.cost;
                    let x_norm = state.variable_norm(evaluator.layout());
                    summary.num_jacobian_evaluations += 1;
                    current = match Linearization::at(evaluator, state) {
                        Ok(next) => next,
                        Err(e) => {
                            break (
                                TerminationReason::EvaluationFailed,
                                format!("Jacobian evaluation failed at an accepted point: {e}"),
                            );
                        }
                    };
                    let cost_change = old_cost - current.cost;
                    self.record(
                        &mut summary,
                        IterationStats {
                            iteration,
                            cost: current.cost,
                            cost_change,
                            gradient_norm: current.gradient_norm,
                            step_norm,
                            tr_ratio: step_length,
                            tr_radius: 0.0,
                            ls_iter: steps,
                            iter_time_ms: iteration_start.elapsed().as_secs_f64() * 1000.0,
                            total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                            accepted: true,
                        },
                    );

                    if cost_change.abs() <= options.function_tolerance * old_cost {
                        break (
                            TerminationReason::FunctionTolerance,
                            format!(
                                "Function tolerance reached. |cost_change|/cost: {:.3e} <= {:.3e}",
                                cost_change.abs() / old_cost.max(f64::MIN_POSITIVE),
                                options.function_tolerance
                            ),
                        );
                    }
                    if step_norm
                        <= options.parameter_tolerance * (x_norm + options.parameter_tolerance)
                    {
                        break (
                            TerminationReason::ParameterTolerance,
                            format!("Parameter tolerance reached. Step norm: {step_norm:.3e}"),
                        );
                    }
                }
            }
        };

        summary.final_cost = current.cost;
        summary.final_gradient_norm = current.gradient_norm;
        summary.iterations = iteration;
        summary.total_time = start.elapsed();
        summary.terminate(reason, message);
        if options.minimizer_progress_to_stdout {
            info!("{}", summary.brief_report());
        } else {
            debug!("{}", summary.brief_report());
        }
        MinimizerOutput {
            state: current.state,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Problem;
    use crate::factors::PriorFactor;
    use crate::optimizer::TerminationType;
    use nalgebra::DVector;

    #[test]
    fn test_linear_problem_converges_in_one_step() {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(&[5.0, -3.0]).unwrap();
        problem
            .add_residual_block(
                Box::new(PriorFactor::new(DVector::from_vec(vec![1.0, 2.0]))),
                None,
                &[x],
            )
            .unwrap();
        let layout = problem.compute_layout();
        let evaluator = Evaluator::new(&problem, &layout);
        let options = SolverOptions::new().with_minimizer_type(MinimizerType::LineSearch);
        let mut minimizer = LineSearchMinimizer::new(options, LinearSolverType::DenseQr);

        let output = minimizer.minimize(&evaluator, ParameterState::from_problem(&problem));
        assert_eq!(output.summary.termination_type, TerminationType::Convergence);
        assert!(output.summary.final_cost < 1e-10);
        assert!(output.summary.successful_steps >= 1);
        assert_eq!(output.summary.unsuccessful_steps, 0);
        assert!((output.state.block(0)[0] - 1.0).abs() < 1e-5);
        assert!((output.state.block(0)[1] - 2.0).abs() < 1e-5);
    }
}
