//! Residual evaluation contracts.
//!
//! A factor computes the residual vector of one residual block and, on request, its
//! Jacobian with respect to every bound parameter block. The solver never needs to know
//! how the derivatives were obtained:
//!
//! - hand-written analytic factors implement [`Factor`] directly (see [`basic`]),
//! - [`autodiff::AutoDiffFactor`] differentiates a generic residual expression with dual
//!   numbers,
//! - [`numeric_diff::NumericDiffFactor`] approximates derivatives with finite differences.
//!
//! # Jacobian layout
//!
//! For a factor with `m` residuals bound to blocks of sizes `n₀, n₁, …`, the Jacobian is an
//! `m × (n₀ + n₁ + …)` matrix whose columns are the per-block Jacobians concatenated in
//! binding order.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::error;

pub mod autodiff;
pub mod basic;
pub mod numeric_diff;

pub use autodiff::{AutoDiffFactor, AutoDiffFunctor, Jet, Scalar};
pub use basic::PriorFactor;
pub use numeric_diff::{DiffMethod, NumericDiffFactor};

/// Factor-specific error types
#[derive(Debug, Clone, Error)]
pub enum FactorError {
    /// Invalid dimension mismatch between expected and actual
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    /// The residual is not defined at the given parameters (domain error, explicit failure)
    #[error("Residual evaluation failed: {0}")]
    EvaluationFailed(String),

    /// Jacobian computation failed
    #[error("Jacobian computation failed: {0}")]
    JacobianFailed(String),

    /// Invalid parameter values
    #[error("Invalid parameter values: {0}")]
    InvalidParameters(String),
}

impl FactorError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| FactorError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error for debugging context
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for factor operations
pub type FactorResult<T> = Result<T, FactorError>;

/// Evaluation contract of a residual block.
///
/// Factors must be `Send + Sync`: residual blocks are evaluated in parallel.
///
/// # Example
///
/// ```
/// use lsq_solver::factors::{Factor, FactorResult};
/// use nalgebra::{DMatrix, DVector};
///
/// // r(x) = 10 − x
/// struct Quadratic;
///
/// impl Factor for Quadratic {
///     fn linearize(
///         &self,
///         params: &[DVector<f64>],
///         compute_jacobian: bool,
///     ) -> FactorResult<(DVector<f64>, Option<DMatrix<f64>>)> {
///         let residual = DVector::from_element(1, 10.0 - params[0][0]);
///         let jacobian = compute_jacobian.then(|| DMatrix::from_element(1, 1, -1.0));
///         Ok((residual, jacobian))
///     }
///
///     fn get_dimension(&self) -> usize {
///         1
///     }
///
///     fn parameter_block_sizes(&self) -> Vec<usize> {
///         vec![1]
///     }
/// }
/// ```
pub trait Factor: Send + Sync {
    /// Compute the residual and, if `compute_jacobian` is set, the Jacobian.
    ///
    /// `params` holds one vector per bound parameter block, in binding order. Returning
    /// `Err` marks the point as non-evaluable; the solver discards every output of the
    /// evaluation in that case.
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> FactorResult<(DVector<f64>, Option<DMatrix<f64>>)>;

    /// Number of residuals produced.
    fn get_dimension(&self) -> usize;

    /// Expected size of every bound parameter block, in binding order.
    fn parameter_block_sizes(&self) -> Vec<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factor_error_display() {
        let err = FactorError::InvalidDimension {
            expected: 3,
            actual: 2,
        };
        assert_eq!(err.to_string(), "Invalid dimension: expected 3, got 2");

        let err = FactorError::EvaluationFailed("log of a negative number".into()).log();
        assert!(err.to_string().contains("log of a negative number"));
    }
}
