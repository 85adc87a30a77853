//! # lsq-solver
//!
//! A generic nonlinear least squares solver. Callers register parameter blocks and residual
//! blocks in a [`Problem`] and minimize
//!
//! ```text
//! F(x) = ½ Σᵢ ρᵢ(‖rᵢ(x)‖²)
//! ```
//!
//! with [`solve`].
//!
//! ## Features
//!
//! - **Minimizers**: Levenberg-Marquardt trust region and Gauss-Newton line search
//! - **Linear solvers**: dense QR, dense and sparse normal Cholesky, conjugate gradients
//! - **Derivatives**: analytic factors, forward-mode automatic differentiation, finite differences
//! - **Robust losses**: Huber, soft L1, Cauchy and arctan with second-order correction
//! - **Parallel evaluation** of residual blocks with rayon
//!
//! ## Example
//!
//! ```
//! use lsq_solver::factors::{AutoDiffFactor, AutoDiffFunctor, Scalar};
//! use lsq_solver::{Problem, SolverOptions, TerminationType, solve};
//!
//! // r(x) = 10 − x
//! struct Quadratic;
//!
//! impl AutoDiffFunctor for Quadratic {
//!     fn num_residuals(&self) -> usize {
//!         1
//!     }
//!     fn parameter_block_sizes(&self) -> Vec<usize> {
//!         vec![1]
//!     }
//!     fn residuals<T: Scalar>(&self, params: &[&[T]], residuals: &mut [T]) -> bool {
//!         residuals[0] = -params[0][0] + 10.0;
//!         true
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut problem = Problem::new();
//! let x = problem.add_parameter_block(&[0.5])?;
//! problem.add_residual_block(Box::new(AutoDiffFactor::<_, 1>::new(Quadratic)?), None, &[x])?;
//!
//! let summary = solve(&SolverOptions::default(), &mut problem)?;
//! assert_eq!(summary.termination_type, TerminationType::Convergence);
//! assert!((problem.parameter_values(x)?[0] - 10.0).abs() < 1e-6);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod factors;
pub mod linalg;
pub mod logger;
pub mod optimizer;
pub mod solver;

pub use core::loss_functions::{ArctanLoss, CauchyLoss, HuberLoss, LossFunction, SoftLOneLoss};
pub use core::{BlockHandle, Bounds, Layout, Problem, TermHandle};
pub use error::{LsqError, LsqResult};
pub use factors::{Factor, PriorFactor};
pub use linalg::LinearSolverType;
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{
    CancellationToken, IterationStats, MinimizerType, SolverOptions, Summary, TerminationReason,
    TerminationType,
};
pub use solver::{Solver, solve};
