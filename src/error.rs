//! Error types for the lsq-solver library
//!
//! Each module defines its own error enum (`CoreError`, `FactorError`, `LinAlgError`,
//! `OptimizerError`). They all convert into [`LsqError`], the error returned by the public
//! entry points. All errors use the `thiserror` crate for automatic trait implementations.

use crate::{
    core::CoreError, factors::FactorError, linalg::LinAlgError, optimizer::OptimizerError,
};
use thiserror::Error;

/// Main result type used throughout the lsq-solver library
pub type LsqResult<T> = Result<T, LsqError>;

/// Main error type for the lsq-solver library
#[derive(Debug, Clone, Error)]
pub enum LsqError {
    /// Problem construction and evaluation errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Errors raised by residual evaluation contracts
    #[error(transparent)]
    Factor(#[from] FactorError),

    /// Linear algebra related errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Configuration and minimizer setup errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsq_error_display_is_transparent() {
        let error = LsqError::from(LinAlgError::SingularSystem("zero pivot".to_string()));
        assert_eq!(
            error.to_string(),
            "Singular linear system: zero pivot"
        );
    }

    #[test]
    fn test_lsq_error_from_core() {
        let core_error = CoreError::Dimension("block size must be positive".to_string());
        let error: LsqError = core_error.into();

        match error {
            LsqError::Core(CoreError::Dimension(msg)) => assert!(msg.contains("positive")),
            _ => panic!("Expected core dimension error"),
        }
    }

    #[test]
    fn test_lsq_error_from_optimizer() {
        let error: LsqError = OptimizerError::InvalidOptions("max_iterations".to_string()).into();
        assert!(matches!(error, LsqError::Optimizer(_)));
        assert!(error.to_string().contains("max_iterations"));
    }

    #[test]
    fn test_lsq_result_err() {
        let result: LsqResult<i32> = Err(LsqError::Factor(FactorError::InvalidDimension {
            expected: 2,
            actual: 3,
        }));
        assert!(result.is_err());
    }
}
