//! Core problem representation for the lsq-solver library
//!
//! This module contains the building blocks of a nonlinear least squares problem:
//! - Parameter blocks (the optimized variables) and their bounds
//! - Residual blocks binding a factor and an optional robust loss to parameter blocks
//! - The problem graph owning both collections and deriving the Jacobian layout
//! - The evaluator producing stacked residuals, sparse Jacobians and gradients
//! - Loss functions and the corrector applying them

use thiserror::Error;
use tracing::error;

pub mod corrector;
pub mod evaluator;
pub mod layout;
pub mod loss_functions;
pub mod parameter_block;
pub mod problem;
pub mod residual_block;
pub mod state;

pub use evaluator::{Evaluation, Evaluator};
pub use layout::Layout;
pub use parameter_block::{BlockHandle, Bounds, ParameterBlock};
pub use problem::Problem;
pub use residual_block::{ResidualBlock, TermHandle};
pub use state::ParameterState;

/// Errors raised while building or evaluating a problem
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Declared and actual sizes disagree (block sizes, residual counts, bound vectors)
    #[error("Dimension error: {0}")]
    Dimension(String),

    /// A handle does not belong to this problem or is out of range
    #[error("Unknown handle: {0}")]
    UnknownHandle(String),

    /// The same parameter block was bound twice by one residual block
    #[error("Parameter block {block} appears more than once in residual block")]
    DuplicateParameterBlock { block: usize },

    /// Bounds are inconsistent or exclude the current parameter values
    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),

    /// A constructor argument is out of its valid range (for example a loss scale)
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A residual block failed to evaluate; the whole evaluation is discarded
    #[error("Residual evaluation failed for residual block {term}: {reason}")]
    ResidualEvaluation { term: usize, reason: String },

    /// The sparse Jacobian could not be assembled
    #[error("Jacobian assembly failed: {0}")]
    JacobianAssembly(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying source error
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_display() {
        let err = CoreError::ResidualEvaluation {
            term: 3,
            reason: "negative argument to sqrt".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Residual evaluation failed for residual block 3: negative argument to sqrt"
        );
    }

    #[test]
    fn test_core_error_log_returns_self() {
        let err = CoreError::DuplicateParameterBlock { block: 1 }.log();
        assert!(matches!(err, CoreError::DuplicateParameterBlock { block: 1 }));
    }
}
