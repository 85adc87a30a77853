//! Minimizers for nonlinear least squares problems.
//!
//! Two strategies share the same evaluation and linear algebra backends:
//!
//! - [`TrustRegionMinimizer`]: Levenberg-Marquardt with a trust region radius driving the
//!   damping of the normal equations
//! - [`LineSearchMinimizer`]: Gauss-Newton direction with Armijo backtracking
//!
//! Both work on a private [`ParameterState`](crate::core::ParameterState) and return the last
//! accepted state together with a [`Summary`]. Recoverable failures inside the loop (a
//! residual that cannot be evaluated at a trial point, a singular linear system) reject the
//! step and never surface as errors.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use faer::Mat;
use faer::sparse::SparseColMat;
use thiserror::Error;
use tracing::{debug, error};

use crate::core::{CoreError, CoreResult, Evaluation, Evaluator, ParameterState};
use crate::linalg::LinearSolverType;

pub mod line_search;
pub mod summary;
pub mod trust_region;

pub use line_search::LineSearchMinimizer;
pub use summary::{IterationStats, Summary};
pub use trust_region::TrustRegionMinimizer;

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Options failed validation
    #[error("Invalid solver options: {0}")]
    InvalidOptions(String),

    /// Dedicated thread pool could not be created
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(String),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error for debugging context
    #[must_use]
    pub fn log_with_source<E: fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Minimization strategy
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimizerType {
    /// Levenberg-Marquardt trust region
    #[default]
    TrustRegion,
    /// Gauss-Newton direction with backtracking line search
    LineSearch,
}

impl fmt::Display for MinimizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinimizerType::TrustRegion => write!(f, "TRUST_REGION"),
            MinimizerType::LineSearch => write!(f, "LINE_SEARCH"),
        }
    }
}

/// Coarse outcome of a solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationType {
    /// A convergence test passed
    Convergence,
    /// Stopped early; the last accepted point is still usable
    NoConvergence,
    /// The run failed
    Failure,
}

impl fmt::Display for TerminationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationType::Convergence => write!(f, "CONVERGENCE"),
            TerminationType::NoConvergence => write!(f, "NO_CONVERGENCE"),
            TerminationType::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Why a solve stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    GradientTolerance,
    FunctionTolerance,
    ParameterTolerance,
    MaxIterations,
    Cancelled,
    Timeout,
    /// The residuals could not be evaluated at the starting point
    InitialEvaluationFailed,
    /// Too many consecutive rejected steps, or the trust region collapsed
    NoProgress,
    /// The Jacobian could not be evaluated at an accepted point
    EvaluationFailed,
    /// No residual blocks
    EmptyProblem,
}

impl TerminationReason {
    pub fn termination_type(self) -> TerminationType {
        match self {
            TerminationReason::GradientTolerance
            | TerminationReason::FunctionTolerance
            | TerminationReason::ParameterTolerance
            | TerminationReason::EmptyProblem => TerminationType::Convergence,
            TerminationReason::MaxIterations
            | TerminationReason::Cancelled
            | TerminationReason::Timeout => TerminationType::NoConvergence,
            TerminationReason::InitialEvaluationFailed
            | TerminationReason::NoProgress
            | TerminationReason::EvaluationFailed => TerminationType::Failure,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationReason::GradientTolerance => "Gradient tolerance reached",
            TerminationReason::FunctionTolerance => "Function tolerance reached",
            TerminationReason::ParameterTolerance => "Parameter tolerance reached",
            TerminationReason::MaxIterations => "Maximum number of iterations reached",
            TerminationReason::Cancelled => "Cancelled by caller",
            TerminationReason::Timeout => "Timeout reached",
            TerminationReason::InitialEvaluationFailed => {
                "Residual evaluation failed at the initial point"
            }
            TerminationReason::NoProgress => "Too many consecutive unsuccessful steps",
            TerminationReason::EvaluationFailed => "Jacobian evaluation failed",
            TerminationReason::EmptyProblem => "Problem has no residual blocks",
        };
        write!(f, "{text}")
    }
}

/// Cooperative cancellation flag, checked once per minimizer iteration.
///
/// Clones share the same flag, so one clone can be handed to another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Options for one solve, passed explicitly at call time.
///
/// # Builder Pattern
///
/// ```
/// use lsq_solver::linalg::LinearSolverType;
/// use lsq_solver::optimizer::SolverOptions;
///
/// let options = SolverOptions::new()
///     .with_max_iterations(100)
///     .with_linear_solver_type(LinearSolverType::DenseQr)
///     .with_minimizer_progress_to_stdout(true);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub minimizer_type: MinimizerType,
    pub linear_solver_type: LinearSolverType,
    pub max_iterations: usize,
    /// Relative cost change below which the run has converged
    pub function_tolerance: f64,
    /// Projected gradient infinity norm below which the run has converged
    pub gradient_tolerance: f64,
    /// Relative step size below which the run has converged
    pub parameter_tolerance: f64,
    pub initial_trust_region_radius: f64,
    pub max_trust_region_radius: f64,
    pub min_trust_region_radius: f64,
    pub min_step_quality: f64,
    pub good_step_quality: f64,
    /// Clamp range of the Levenberg-Marquardt scaling diagonal
    pub min_lm_diagonal: f64,
    pub max_lm_diagonal: f64,
    pub max_consecutive_rejections: usize,
    pub max_linear_solver_iterations: usize,
    pub linear_solver_tolerance: f64,
    /// Armijo constant of the line search
    pub line_search_sufficient_decrease: f64,
    /// Backtracking factor of the line search
    pub line_search_contraction: f64,
    pub max_line_search_steps: usize,
    /// Per-iteration progress at `info` instead of `debug`
    pub minimizer_progress_to_stdout: bool,
    pub record_iteration_trace: bool,
    pub parallel_evaluation: bool,
    /// Size of a dedicated rayon pool, `None` uses the global pool
    pub num_threads: Option<usize>,
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            minimizer_type: MinimizerType::default(),
            linear_solver_type: LinearSolverType::default(),
            max_iterations: 50,
            function_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-8,
            initial_trust_region_radius: 1e4,
            max_trust_region_radius: 1e16,
            min_trust_region_radius: 1e-32,
            min_step_quality: 0.25,
            good_step_quality: 0.75,
            min_lm_diagonal: 1e-6,
            max_lm_diagonal: 1e32,
            max_consecutive_rejections: 10,
            max_linear_solver_iterations: 500,
            linear_solver_tolerance: 1e-10,
            line_search_sufficient_decrease: 1e-4,
            line_search_contraction: 0.5,
            max_line_search_steps: 20,
            minimizer_progress_to_stdout: false,
            record_iteration_trace: true,
            parallel_evaluation: true,
            num_threads: None,
            timeout: None,
            cancellation: None,
        }
    }
}

impl SolverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_minimizer_type(mut self, minimizer_type: MinimizerType) -> Self {
        self.minimizer_type = minimizer_type;
        self
    }

    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_function_tolerance(mut self, tolerance: f64) -> Self {
        self.function_tolerance = tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.gradient_tolerance = tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, tolerance: f64) -> Self {
        self.parameter_tolerance = tolerance;
        self
    }

    /// Set the initial, maximum and minimum trust region radius.
    pub fn with_trust_region_radius(mut self, initial: f64, max: f64, min: f64) -> Self {
        self.initial_trust_region_radius = initial;
        self.max_trust_region_radius = max;
        self.min_trust_region_radius = min;
        self
    }

    pub fn with_step_quality(mut self, min_quality: f64, good_quality: f64) -> Self {
        self.min_step_quality = min_quality;
        self.good_step_quality = good_quality;
        self
    }

    pub fn with_lm_diagonal_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_lm_diagonal = min;
        self.max_lm_diagonal = max;
        self
    }

    pub fn with_max_consecutive_rejections(mut self, max: usize) -> Self {
        self.max_consecutive_rejections = max;
        self
    }

    /// Inner iteration limit and relative tolerance of the iterative linear solver.
    pub fn with_linear_solver_params(mut self, max_iterations: usize, tolerance: f64) -> Self {
        self.max_linear_solver_iterations = max_iterations;
        self.linear_solver_tolerance = tolerance;
        self
    }

    pub fn with_line_search(
        mut self,
        sufficient_decrease: f64,
        contraction: f64,
        max_steps: usize,
    ) -> Self {
        self.line_search_sufficient_decrease = sufficient_decrease;
        self.line_search_contraction = contraction;
        self.max_line_search_steps = max_steps;
        self
    }

    pub fn with_minimizer_progress_to_stdout(mut self, enabled: bool) -> Self {
        self.minimizer_progress_to_stdout = enabled;
        self
    }

    pub fn with_record_iteration_trace(mut self, enabled: bool) -> Self {
        self.record_iteration_trace = enabled;
        self
    }

    pub fn with_parallel_evaluation(mut self, enabled: bool) -> Self {
        self.parallel_evaluation = enabled;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Check every option for consistency.
    pub fn validate(&self) -> OptimizerResult<()> {
        let invalid = |message: String| Err(OptimizerError::InvalidOptions(message).log());

        if self.max_iterations == 0 {
            return invalid("max_iterations must be positive".to_string());
        }

        for (name, value) in [
            ("function_tolerance", self.function_tolerance),
            ("gradient_tolerance", self.gradient_tolerance),
            ("parameter_tolerance", self.parameter_tolerance),
            ("linear_solver_tolerance", self.linear_solver_tolerance),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("{name} must be finite and non-negative, got {value}"));
            }
        }
        if !(self.min_trust_region_radius > 0.0
            && self.min_trust_region_radius <= self.initial_trust_region_radius
            && self.initial_trust_region_radius <= self.max_trust_region_radius)
        {
            return invalid(format!(
                "trust region radii must satisfy 0 < min ({:e}) <= initial ({:e}) <= max ({:e})",
                self.min_trust_region_radius,
                self.initial_trust_region_radius,
                self.max_trust_region_radius
            ));
        }
        if !(0.0 < self.min_step_quality
            && self.min_step_quality <= self.good_step_quality
            && self.good_step_quality < 1.0)
        {
            return invalid(format!(
                "step qualities must satisfy 0 < min ({}) <= good ({}) < 1",
                self.min_step_quality, self.good_step_quality
            ));
        }
        if !(self.min_lm_diagonal > 0.0 && self.min_lm_diagonal <= self.max_lm_diagonal) {
            return invalid(format!(
                "lm diagonal bounds must satisfy 0 < min ({:e}) <= max ({:e})",
                self.min_lm_diagonal, self.max_lm_diagonal
            ));
        }
        if self.max_linear_solver_iterations == 0 {
            return invalid("max_linear_solver_iterations must be positive".to_string());
        }
        if !(self.line_search_sufficient_decrease > 0.0
            && self.line_search_sufficient_decrease < 0.5)
        {
            return invalid(format!(
                "line_search_sufficient_decrease must lie in (0, 0.5), got {}",
                self.line_search_sufficient_decrease
            ));
        }
        if !(self.line_search_contraction > 0.0 && self.line_search_contraction < 1.0) {
            return invalid(format!(
                "line_search_contraction must lie in (0, 1), got {}",
                self.line_search_contraction
            ));
        }
        if self.max_line_search_steps == 0 {
            return invalid("max_line_search_steps must be positive".to_string());
        }
        if self.num_threads == Some(0) {
            return invalid("num_threads must be positive".to_string());
        }
        Ok(())
    }

    /// Dump the configuration at debug level.
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Minimizer:           {}\n  Linear solver:       {}\n  Convergence Criteria:\n  Max iterations:      {}\n  Function tolerance:  {:.2e}\n  Gradient tolerance:  {:.2e}\n  Parameter tolerance: {:.2e}\n  Timeout:             {:?}\n  Trust Region:\n  Initial radius:      {:.2e}\n  Radius range:        [{:.2e}, {:.2e}]\n  Min step quality:    {:.2}\n  Good step quality:   {:.2}\n  LM diagonal range:   [{:.2e}, {:.2e}]\n  Max rejections:      {}\n  Evaluation:\n  Parallel:            {}\n  Threads:             {:?}",
            self.minimizer_type,
            self.linear_solver_type,
            self.max_iterations,
            self.function_tolerance,
            self.gradient_tolerance,
            self.parameter_tolerance,
            self.timeout,
            self.initial_trust_region_radius,
            self.min_trust_region_radius,
            self.max_trust_region_radius,
            self.min_step_quality,
            self.good_step_quality,
            self.min_lm_diagonal,
            self.max_lm_diagonal,
            self.max_consecutive_rejections,
            if self.parallel_evaluation {
                "enabled"
            } else {
                "disabled"
            },
            self.num_threads,
        );
    }

    /// Cancellation or timeout, checked at the top of every iteration.
    pub(crate) fn interruption(&self, start: Instant) -> Option<TerminationReason> {
        if self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Some(TerminationReason::Cancelled);
        }
        if let Some(timeout) = self.timeout
            && start.elapsed() >= timeout
        {
            return Some(TerminationReason::Timeout);
        }
        None
    }
}

/// Final state and outcome of one minimizer run.
#[derive(Debug, Clone)]
pub struct MinimizerOutput {
    /// Last accepted parameter values
    pub state: ParameterState,
    pub summary: Summary,
}

/// A minimization strategy.
pub trait Minimizer {
    /// Minimize starting from `initial`. Never fails: every outcome is reported in the
    /// returned summary.
    fn minimize(&mut self, evaluator: &Evaluator<'_>, initial: ParameterState)
    -> MinimizerOutput;
}

/// Current point of a minimizer together with its first-order model.
pub(crate) struct Linearization {
    pub state: ParameterState,
    pub cost: f64,
    pub residuals: Mat<f64>,
    pub jacobian: SparseColMat<usize, f64>,
    /// g = Jᵀr
    pub gradient: Mat<f64>,
    /// diag(JᵀJ)
    pub column_norms: Vec<f64>,
    /// Projected gradient infinity norm
    pub gradient_norm: f64,
}

impl Linearization {
    /// Evaluate residuals and Jacobian at `state`.
    pub fn at(evaluator: &Evaluator<'_>, state: ParameterState) -> CoreResult<Self> {
        let Evaluation {
            cost,
            residuals,
            jacobian,
            gradient,
            jacobian_column_norms,
        } = evaluator.evaluate(&state, true)?;
        let (Some(jacobian), Some(gradient), Some(column_norms)) =
            (jacobian, gradient, jacobian_column_norms)
        else {
            return Err(CoreError::JacobianAssembly(
                "evaluation returned no jacobian".to_string(),
            )
            .log());
        };
        let gradient_norm =
            state.projected_gradient_norm(evaluator.problem(), evaluator.layout(), &gradient);
        Ok(Self {
            state,
            cost,
            residuals,
            jacobian,
            gradient,
            column_norms,
            gradient_norm,
        })
    }
}

/// Build the minimizer selected by `options`.
pub fn create_minimizer(
    options: &SolverOptions,
    linear_solver_type: LinearSolverType,
) -> Box<dyn Minimizer> {
    match options.minimizer_type {
        MinimizerType::TrustRegion => {
            Box::new(TrustRegionMinimizer::new(options.clone(), linear_solver_type))
        }
        MinimizerType::LineSearch => {
            Box::new(LineSearchMinimizer::new(options.clone(), linear_solver_type))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = SolverOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.max_iterations, 50);
        assert_eq!(options.initial_trust_region_radius, 1e4);
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let cases = [
            SolverOptions::new().with_max_iterations(0),
            SolverOptions::new().with_function_tolerance(-1.0),
            SolverOptions::new().with_gradient_tolerance(f64::NAN),
            SolverOptions::new().with_trust_region_radius(1e20, 1e16, 1e-32),
            SolverOptions::new().with_step_quality(0.8, 0.5),
            SolverOptions::new().with_lm_diagonal_bounds(0.0, 1.0),
            SolverOptions::new().with_line_search(1e-4, 1.5, 20),
            SolverOptions::new().with_num_threads(0),
        ];
        for options in cases {
            assert!(matches!(
                options.validate(),
                Err(OptimizerError::InvalidOptions(_))
            ));
        }
    }

    #[test]
    fn test_termination_types() {
        assert_eq!(
            TerminationReason::FunctionTolerance.termination_type(),
            TerminationType::Convergence
        );
        assert_eq!(
            TerminationReason::MaxIterations.termination_type(),
            TerminationType::NoConvergence
        );
        assert_eq!(
            TerminationReason::NoProgress.termination_type(),
            TerminationType::Failure
        );
        assert_eq!(TerminationType::Failure.to_string(), "FAILURE");
    }

    #[test]
    fn test_cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let options = SolverOptions::new().with_cancellation(token.clone());
        let start = Instant::now();
        assert_eq!(options.interruption(start), None);
        token.cancel();
        assert_eq!(
            options.interruption(start),
            Some(TerminationReason::Cancelled)
        );
    }

    #[test]
    fn test_zero_timeout_interrupts() {
        let options = SolverOptions::new().with_timeout(Duration::ZERO);
        assert_eq!(
            options.interruption(Instant::now()),
            Some(TerminationReason::Timeout)
        );
    }
}
