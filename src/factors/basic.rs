//! Hand-written analytic factors.

use nalgebra::{DMatrix, DVector};

use super::{Factor, FactorError, FactorResult};

/// Pulls one parameter block toward a target value.
///
/// ```text
/// r(x) = x − target,   J = I
/// ```
#[derive(Debug, Clone)]
pub struct PriorFactor {
    pub target: DVector<f64>,
}

impl PriorFactor {
    pub fn new(target: DVector<f64>) -> Self {
        Self { target }
    }
}

impl Factor for PriorFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> FactorResult<(DVector<f64>, Option<DMatrix<f64>>)> {
        let x = params.first().ok_or(FactorError::InvalidDimension {
            expected: 1,
            actual: 0,
        })?;
        if x.len() != self.target.len() {
            return Err(FactorError::InvalidDimension {
                expected: self.target.len(),
                actual: x.len(),
            });
        }
        let residual = x - &self.target;
        let jacobian = compute_jacobian
            .then(|| DMatrix::<f64>::identity(residual.nrows(), residual.nrows()));
        Ok((residual, jacobian))
    }

    fn get_dimension(&self) -> usize {
        self.target.len()
    }

    fn parameter_block_sizes(&self) -> Vec<usize> {
        vec![self.target.len()]
    }
}
