//! Levenberg-Marquardt trust region minimizer.
//!
//! Each iteration solves the damped normal equations
//!
//! ```text
//! (JᵀJ + λ·D)·δ = −Jᵀr,    λ = 1 / radius,    D = clamp(diag(JᵀJ), min_lm_diagonal, max_lm_diagonal)
//! ```
//!
//! and judges the step by its quality
//!
//! ```text
//! ρ = (F(x) − F(x + δ)) / (−(gᵀδ + ½‖Jδ‖²))
//! ```
//!
//! ## Radius update
//!
//! - `ρ > good_step_quality`: accept, `radius ← radius / max(⅓, 1 − (2ρ − 1)³)`
//! - `ρ < min_step_quality`: reject, `radius ← radius / decrease_factor`, and the decrease
//!   factor doubles until the next accepted step
//! - otherwise: accept, radius unchanged
//!
//! A step whose linear solve fails, whose predicted reduction is not positive, or whose
//! candidate point cannot be evaluated is rejected the same way. The Jacobian is only
//! recomputed after an accepted step, and the function, parameter and gradient tolerances
//! are only tested there.
//!
//! ## State machine
//!
//! ```text
//! Init → Evaluating → StepComputed → StepAccepted → Evaluating …
//!                                  ↘ StepRejected → Evaluating …
//! any phase → Terminated(reason)
//! ```

use std::ops::Mul;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::core::{Evaluator, ParameterState};
use crate::linalg::{LinAlgError, LinearSolver, LinearSolverType, create_linear_solver};
use crate::optimizer::{
    IterationStats, Linearization, Minimizer, MinimizerOutput, MinimizerType, SolverOptions,
    Summary, TerminationReason,
};

/// Initial value of the radius decrease factor, restored after every accepted step.
const INITIAL_DECREASE_FACTOR: f64 = 2.0;

/// Trial point produced by one linear solve.
struct CandidateStep {
    state: ParameterState,
    /// Norm of the step after projection onto the bounds
    step_norm: f64,
    predicted_reduction: f64,
    linear_iterations: usize,
}

enum Phase {
    /// Solve for a step at the current linearization
    Evaluating,
    StepComputed(CandidateStep),
    StepAccepted {
        candidate: CandidateStep,
        new_cost: f64,
        rho: f64,
    },
    StepRejected {
        step_norm: f64,
        rho: f64,
        linear_iterations: usize,
    },
    Terminated(TerminationReason, String),
}

/// Mutable state of one `minimize` call.
struct TrustRegionState {
    current: Linearization,
    radius: f64,
    decrease_factor: f64,
    iteration: usize,
    consecutive_rejections: usize,
    iteration_start: Instant,
}

/// Levenberg-Marquardt minimizer with a multiplicative trust region.
pub struct TrustRegionMinimizer {
    options: SolverOptions,
    linear_solver_type: LinearSolverType,
    linear_solver: Box<dyn LinearSolver>,
}

impl TrustRegionMinimizer {
    /// `linear_solver_type` must already be resolved (not `Auto`).
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

    /// Scaled Levenberg-Marquardt diagonal for the current radius.
    fn lm_diagonal(&self, column_norms: &[f64], radius: f64) -> Vec<f64> {
        column_norms
            .iter()
            .map(|&d| {
                d.clamp(self.options.min_lm_diagonal, self.options.max_lm_diagonal) / radius
            })
            .collect()
    }

    fn compute_step(
        &mut self,
        evaluator: &Evaluator<'_>,
        tr: &TrustRegionState,
    ) -> Result<CandidateStep, LinAlgError> {
        let current = &tr.current;
        let diagonal = self.lm_diagonal(&current.column_norms, tr.radius);
        let solution = self
            .linear_solver
            .solve_augmented_equation(&current.residuals, &current.jacobian, &diagonal)?;

        let problem = evaluator.problem();
        let layout = evaluator.layout();
        let state = current.state.plus(problem, layout, &solution.step);
        let step = state.difference(&current.state, layout);
        let step_norm = step.norm_l2();

        // L(0) − L(δ) = −(gᵀδ + ½‖Jδ‖²)
        let j_step = current.jacobian.as_ref().mul(&step);
        let g_step = current.gradient.col(0).transpose() * step.col(0);
        let predicted_reduction = -(g_step + 0.5 * j_step.squared_norm_l2());

        Ok(CandidateStep {
            state,
            step_norm,
            predicted_reduction,
            linear_iterations: solution.iterations,
        })
    }

    fn record(&self, summary: &mut Summary, stats: IterationStats) {
        stats.log_line(self.options.minimizer_progress_to_stdout);
        if self.options.record_iteration_trace {
            summary.trace.push(stats);
        }
    }

    fn finish(
        &self,
        mut summary: Summary,
        tr: TrustRegionState,
        reason: TerminationReason,
        message: String,
        start: Instant,
    ) -> MinimizerOutput {
        summary.final_cost = tr.current.cost;
        summary.final_gradient_norm = tr.current.gradient_norm;
        summary.iterations = tr.iteration;
        summary.total_time = start.elapsed();
        summary.terminate(reason, message);
        if self.options.minimizer_progress_to_stdout {
            info!("{}", summary.brief_report());
        } else {
            debug!("{}", summary.brief_report());
        }
        MinimizerOutput {
            state: tr.current.state,
            summary,
        }
    }
}

impl Minimizer for TrustRegionMinimizer {
    fn minimize(
        &mut self,
        evaluator: &Evaluator<'_>,
        initial: ParameterState,
    ) -> MinimizerOutput {
        let start = Instant::now();
        let options = self.options.clone();
        let progress = options.minimizer_progress_to_stdout;
        let mut summary = Summary::new(MinimizerType::TrustRegion, self.linear_solver_type, evaluator);

        // Init
        summary.num_residual_evaluations += 1;
        summary.num_jacobian_evaluations += 1;
        let current = match Linearization::at(evaluator, initial.clone()) {
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

        let mut tr = TrustRegionState {
            current,
            radius: options.initial_trust_region_radius,
            decrease_factor: INITIAL_DECREASE_FACTOR,
            iteration: 0,
            consecutive_rejections: 0,
            iteration_start: Instant::now(),
        };

        IterationStats::log_header(progress);
        self.record(
            &mut summary,
            IterationStats {
                iteration: 0,
                cost: tr.current.cost,
                cost_change: 0.0,
                gradient_norm: tr.current.gradient_norm,
                step_norm: 0.0,
                tr_ratio: 0.0,
                tr_radius: tr.radius,
                ls_iter: 0,
                iter_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                accepted: true,
            },
        );

        let mut phase = if tr.current.gradient_norm <= options.gradient_tolerance {
            Phase::Terminated(
                TerminationReason::GradientTolerance,
                format!(
                    "Gradient tolerance reached. Gradient max norm: {:.3e} <= {:.3e}",
                    tr.current.gradient_norm, options.gradient_tolerance
                ),
            )
        } else {
            Phase::Evaluating
        };

        loop {
            phase = match phase {
                Phase::Evaluating => {
                    if let Some(reason) = options.interruption(start) {
                        Phase::Terminated(reason, reason.to_string())
                    } else if tr.iteration >= options.max_iterations {
                        Phase::Terminated(
                            TerminationReason::MaxIterations,
                            format!(
                                "Maximum number of iterations reached. Number of iterations: {}",
                                tr.iteration
                            ),
                        )
                    } else {
                        tr.iteration += 1;
                        tr.iteration_start = Instant::now();
                        match self.compute_step(evaluator, &tr) {
                            Ok(candidate) => Phase::StepComputed(candidate),
                            Err(e) => {
                                warn!("linear solve failed at iteration {}: {}", tr.iteration, e);
                                Phase::StepRejected {
                                    step_norm: 0.0,
                                    rho: 0.0,
                                    linear_iterations: 0,
                                }
                            }
                        }
                    }
                }

                Phase::StepComputed(candidate) => {
                    summary.num_linear_solver_iterations += candidate.linear_iterations;
                    summary.final_step_norm = candidate.step_norm;
                    if candidate.predicted_reduction <= 0.0 {
                        debug!(
                            "non-positive predicted reduction {:.3e}",
                            candidate.predicted_reduction
                        );
                        Phase::StepRejected {
                            step_norm: candidate.step_norm,
                            rho: 0.0,
                            linear_iterations: candidate.linear_iterations,
                        }
                    } else {
                        summary.num_residual_evaluations += 1;
                        match evaluator.evaluate_cost(&candidate.state) {
                            Ok(new_cost) => {
                                let rho = (tr.current.cost - new_cost) / candidate.predicted_reduction;
                                if rho.is_finite() && rho >= options.min_step_quality {
                                    Phase::StepAccepted {
                                        candidate,
                                        new_cost,
                                        rho,
                                    }
                                } else {
                                    Phase::StepRejected {
                                        step_norm: candidate.step_norm,
                                        rho,
                                        linear_iterations: candidate.linear_iterations,
                                    }
                                }
                            }
                            Err(e) => {
                                debug!("candidate evaluation failed: {}", e);
                                Phase::StepRejected {
                                    step_norm: candidate.step_norm,
                                    rho: 0.0,
                                    linear_iterations: candidate.linear_iterations,
                                }
                            }
                        }
                    }
                }

                Phase::StepAccepted {
                    candidate,
                    new_cost,
                    rho,
                } => {
                    if rho > options.good_step_quality {
                        let factor = (1.0 - (2.0 * rho - 1.0).powi(3)).max(1.0 / 3.0);
                        tr.radius = (tr.radius / factor).min(options.max_trust_region_radius);
                    }
                    tr.decrease_factor = INITIAL_DECREASE_FACTOR;
                    tr.consecutive_rejections = 0;
                    summary.successful_steps += 1;

                    let old_cost = tr.current.cost;
                    let x_norm = candidate.state.variable_norm(evaluator.layout());
                    summary.num_jacobian_evaluations += 1;
                    match Linearization::at(evaluator, candidate.state.clone()) {
                        Ok(next) => {
                            tr.current = next;
                            let cost_change = old_cost - tr.current.cost;
                            self.record(
                                &mut summary,
                                IterationStats {
                                    iteration: tr.iteration,
                                    cost: tr.current.cost,
                                    cost_change,
                                    gradient_norm: tr.current.gradient_norm,
                                    step_norm: candidate.step_norm,
                                    tr_ratio: rho,
                                    tr_radius: tr.radius,
                                    ls_iter: candidate.linear_iterations,
                                    iter_time_ms: tr.iteration_start.elapsed().as_secs_f64() * 1000.0,
                                    total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                                    accepted: true,
                                },
                            );

                            if cost_change.abs() <= options.function_tolerance * old_cost {
                                Phase::Terminated(
                                    TerminationReason::FunctionTolerance,
                                    format!(
                                        "Function tolerance reached. |cost_change|/cost: {:.3e} <= {:.3e}",
                                        cost_change.abs() / old_cost.max(f64::MIN_POSITIVE),
                                        options.function_tolerance
                                    ),
                                )
                            } else if candidate.step_norm
                                <= options.parameter_tolerance
                                    * (x_norm + options.parameter_tolerance)
                            {
                                Phase::Terminated(
                                    TerminationReason::ParameterTolerance,
                                    format!(
                                        "Parameter tolerance reached. Step norm: {:.3e}",
                                        candidate.step_norm
                                    ),
                                )
                            } else if tr.current.gradient_norm <= options.gradient_tolerance {
                                Phase::Terminated(
                                    TerminationReason::GradientTolerance,
                                    format!(
                                        "Gradient tolerance reached. Gradient max norm: {:.3e} <= {:.3e}",
                                        tr.current.gradient_norm, options.gradient_tolerance
                                    ),
                                )
                            } else {
                                Phase::Evaluating
                            }
                        }
                        Err(e) => {
                            // The candidate cost was evaluable; keep the point and its cost.
                            tr.current.state = candidate.state;
                            tr.current.cost = new_cost;
                            Phase::Terminated(
                                TerminationReason::EvaluationFailed,
                                format!("Jacobian evaluation failed at an accepted point: {e}"),
                            )
                        }
                    }
                }

                Phase::StepRejected {
                    step_norm,
                    rho,
                    linear_iterations,
                } => {
                    tr.radius /= tr.decrease_factor;
                    tr.decrease_factor *= 2.0;
                    tr.consecutive_rejections += 1;
                    summary.unsuccessful_steps += 1;
                    self.record(
                        &mut summary,
                        IterationStats {
                            iteration: tr.iteration,
                            cost: tr.current.cost,
                            cost_change: 0.0,
                            gradient_norm: tr.current.gradient_norm,
                            step_norm,
                            tr_ratio: rho,
                            tr_radius: tr.radius,
                            ls_iter: linear_iterations,
                            iter_time_ms: tr.iteration_start.elapsed().as_secs_f64() * 1000.0,
                            total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                            accepted: false,
                        },
                    );

                    if tr.consecutive_rejections > options.max_consecutive_rejections {
                        Phase::Terminated(
                            TerminationReason::NoProgress,
                            format!(
                                "{} consecutive unsuccessful steps",
                                tr.consecutive_rejections
                            ),
                        )
                    } else if tr.radius < options.min_trust_region_radius {
                        Phase::Terminated(
                            TerminationReason::NoProgress,
                            format!(
                                "Trust region radius {:.3e} below minimum {:.3e}",
                                tr.radius, options.min_trust_region_radius
                            ),
                        )
                    } else {
                        Phase::Evaluating
                    }
                }

                Phase::Terminated(reason, message) => {
                    return self.finish(summary, tr, reason, message, start);
                }
            };
        }
    }
}
