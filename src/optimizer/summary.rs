//! Outcome records of a solve.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

use crate::core::Evaluator;
use crate::linalg::LinearSolverType;
use crate::optimizer::{MinimizerType, TerminationReason, TerminationType};

/// Per-iteration statistics for detailed logging (Ceres-style output).
#[derive(Debug, Clone, PartialEq)]
pub struct IterationStats {
    /// Iteration number, 0 is the initial point
    pub iteration: usize,
    /// Cost at the last accepted point after this iteration
    pub cost: f64,
    /// Cost decrease achieved (0 for rejected steps)
    pub cost_change: f64,
    /// Infinity norm of the projected gradient
    pub gradient_norm: f64,
    /// L2 norm of the attempted step
    pub step_norm: f64,
    /// Step quality ρ for the trust region, step length for the line search
    pub tr_ratio: f64,
    /// Trust region radius after this iteration
    pub tr_radius: f64,
    /// Linear solver iterations, or line search steps
    pub ls_iter: usize,
    pub iter_time_ms: f64,
    pub total_time_ms: f64,
    pub accepted: bool,
}

impl IterationStats {
    /// Log the table header.
    pub fn log_header(progress_to_stdout: bool) {
        let header = format!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>11}  {:>7}  {:>11}  {:>13}",
            "iter",
            "cost",
            "cost_change",
            "|gradient|",
            "|step|",
            "tr_ratio",
            "tr_radius",
            "ls_iter",
            "iter_time",
            "total_time"
        );
        if progress_to_stdout {
            info!("{}", header);
        } else {
            debug!("{}", header);
        }
    }

    /// Log one table line.
    pub fn log_line(&self, progress_to_stdout: bool) {
        let line = format!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  {:>7}  {:>9.2}ms  {:>11.2}ms",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_norm,
            self.step_norm,
            self.tr_ratio,
            self.tr_radius,
            self.ls_iter,
            self.iter_time_ms,
            self.total_time_ms,
        );
        if progress_to_stdout {
            info!("{}", line);
        } else {
            debug!("{}", line);
        }
    }
}

/// Outcome of one solve.
#[derive(Debug, Clone)]
pub struct Summary {
    pub minimizer_type: MinimizerType,
    /// Linear solver actually used (`Auto` resolved)
    pub linear_solver_type: LinearSolverType,
    pub termination_type: TerminationType,
    pub termination_reason: TerminationReason,
    pub message: String,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Iterations performed, rejected steps included
    pub iterations: usize,
    pub successful_steps: usize,
    pub unsuccessful_steps: usize,
    pub num_residual_evaluations: usize,
    pub num_jacobian_evaluations: usize,
    pub num_linear_solver_iterations: usize,
    /// Projected gradient infinity norm at the final point
    pub final_gradient_norm: f64,
    /// Norm of the last attempted step
    pub final_step_norm: f64,
    pub num_parameter_blocks: usize,
    pub num_parameters: usize,
    /// Parameters not held constant
    pub num_effective_parameters: usize,
    pub num_residual_blocks: usize,
    pub num_residuals: usize,
    pub total_time: Duration,
    pub trace: Vec<IterationStats>,
}

impl Summary {
    /// Fresh summary for a run over `evaluator`'s problem.
    pub fn new(
        minimizer_type: MinimizerType,
        linear_solver_type: LinearSolverType,
        evaluator: &Evaluator<'_>,
    ) -> Self {
        let problem = evaluator.problem();
        Self {
            minimizer_type,
            linear_solver_type,
            termination_type: TerminationType::Failure,
            termination_reason: TerminationReason::InitialEvaluationFailed,
            message: String::new(),
            initial_cost: 0.0,
            final_cost: 0.0,
            iterations: 0,
            successful_steps: 0,
            unsuccessful_steps: 0,
            num_residual_evaluations: 0,
            num_jacobian_evaluations: 0,
            num_linear_solver_iterations: 0,
            final_gradient_norm: 0.0,
            final_step_norm: 0.0,
            num_parameter_blocks: problem.num_parameter_blocks(),
            num_parameters: problem.num_parameters(),
            num_effective_parameters: evaluator.num_columns(),
            num_residual_blocks: problem.num_residual_blocks(),
            num_residuals: evaluator.num_rows(),
            total_time: Duration::ZERO,
            trace: Vec::new(),
        }
    }

    /// Record the termination reason and its message.
    pub(crate) fn terminate(&mut self, reason: TerminationReason, message: impl Into<String>) {
        self.termination_reason = reason;
        self.termination_type = reason.termination_type();
        self.message = message.into();
    }

    /// `true` unless the run failed.
    pub fn is_solution_usable(&self) -> bool {
        self.termination_type != TerminationType::Failure
    }

    /// One line report.
    pub fn brief_report(&self) -> String {
        format!(
            "Solver Report: Iterations: {}, Initial cost: {:.6e}, Final cost: {:.6e}, Termination: {}",
            self.iterations, self.initial_cost, self.final_cost, self.termination_type
        )
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Solver Summary ===")?;
        writeln!(
            f,
            "Parameter blocks:          {} ({} parameters, {} effective)",
            self.num_parameter_blocks, self.num_parameters, self.num_effective_parameters
        )?;
        writeln!(
            f,
            "Residual blocks:           {} ({} residuals)",
            self.num_residual_blocks, self.num_residuals
        )?;
        writeln!(f, "Minimizer:                 {}", self.minimizer_type)?;
        writeln!(f, "Linear solver:             {}", self.linear_solver_type)?;
        writeln!(f, "Initial cost:              {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:                {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Cost reduction:            {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        writeln!(
            f,
            "Successful steps:          {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "Unsuccessful steps:        {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "Residual evaluations:      {}",
            self.num_residual_evaluations
        )?;
        writeln!(
            f,
            "Jacobian evaluations:      {}",
            self.num_jacobian_evaluations
        )?;
        writeln!(
            f,
            "Linear solver iterations:  {}",
            self.num_linear_solver_iterations
        )?;
        writeln!(
            f,
            "Final gradient norm:       {:.6e}",
            self.final_gradient_norm
        )?;
        writeln!(f, "Final step norm:           {:.6e}", self.final_step_norm)?;
        writeln!(f, "Total time:                {:?}", self.total_time)?;
        writeln!(
            f,
            "Termination:               {} ({})",
            self.termination_type, self.message
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Problem;

    #[test]
    fn test_report_contains_outcome() {
        let mut problem = Problem::new();
        problem.add_parameter_block(&[1.0, 2.0]).unwrap();
        let layout = problem.compute_layout();
        let evaluator = Evaluator::new(&problem, &layout);

        let mut summary = Summary::new(
            MinimizerType::TrustRegion,
            LinearSolverType::DenseQr,
            &evaluator,
        );
        summary.initial_cost = 2.0;
        summary.final_cost = 0.5;
        summary.iterations = 3;
        summary.terminate(TerminationReason::FunctionTolerance, "done");

        assert_eq!(summary.num_parameters, 2);
        assert!(summary.is_solution_usable());
        assert!(summary.brief_report().contains("CONVERGENCE"));
        let report = summary.to_string();
        assert!(report.contains("DENSE_QR"));
        assert!(report.contains("Total iterations:          3"));
    }
}
