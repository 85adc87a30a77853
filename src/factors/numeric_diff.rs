//! Finite-difference Jacobians.
//!
//! For a residual function that can only be evaluated (no derivatives), each Jacobian
//! column is approximated by perturbing one parameter scalar. The step for a scalar `x` is
//! `relative_step_size · |x|`, or `relative_step_size` when `x` is zero.

use nalgebra::{DMatrix, DVector};

use super::{Factor, FactorError, FactorResult};

/// Finite-difference stencil
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMethod {
    /// (r(x + h) − r(x)) / h
    Forward,
    /// (r(x) − r(x − h)) / h
    Backward,
    /// (r(x + h) − r(x − h)) / 2h
    #[default]
    Central,
}

/// [`Factor`] approximating the Jacobian of a residual closure by finite differences.
pub struct NumericDiffFactor<F> {
    function: F,
    num_residuals: usize,
    block_sizes: Vec<usize>,
    method: DiffMethod,
    relative_step_size: f64,
}

impl<F> NumericDiffFactor<F>
where
    F: Fn(&[DVector<f64>]) -> FactorResult<DVector<f64>> + Send + Sync,
{
    pub fn new(function: F, num_residuals: usize, block_sizes: Vec<usize>) -> FactorResult<Self> {
        if block_sizes.is_empty() || block_sizes.iter().any(|&s| s == 0) {
            return Err(FactorError::InvalidParameters(format!(
                "invalid parameter block sizes {block_sizes:?}"
            ))
            .log());
        }
        Ok(Self {
            function,
            num_residuals,
            block_sizes,
            method: DiffMethod::default(),
            relative_step_size: 1e-6,
        })
    }

    pub fn with_method(mut self, method: DiffMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_relative_step_size(mut self, relative_step_size: f64) -> Self {
        self.relative_step_size = relative_step_size;
        self
    }

    pub fn method(&self) -> DiffMethod {
        self.method
    }

    fn evaluate(&self, params: &[DVector<f64>]) -> FactorResult<DVector<f64>> {
        let residual = (self.function)(params)?;
        if residual.len() != self.num_residuals {
            return Err(FactorError::InvalidDimension {
                expected: self.num_residuals,
                actual: residual.len(),
            });
        }
        Ok(residual)
    }

    fn step_size(&self, x: f64) -> f64 {
        if x == 0.0 {
            self.relative_step_size
        } else {
            self.relative_step_size * x.abs()
        }
    }

    fn jacobian(&self, params: &[DVector<f64>], center: &DVector<f64>) -> FactorResult<DMatrix<f64>> {
        let total: usize = self.block_sizes.iter().sum();
        let mut jacobian = DMatrix::<f64>::zeros(self.num_residuals, total);
        let mut perturbed = params.to_vec();

        let mut col = 0;
        for (block, &size) in self.block_sizes.iter().enumerate() {
            for i in 0..size {
                let x = params[block][i];
                let h = self.step_size(x);

                let column = match self.method {
                    DiffMethod::Forward => {
                        perturbed[block][i] = x + h;
                        let plus = self.evaluate(&perturbed)?;
                        (plus - center) / h
                    }
                    DiffMethod::Backward => {
                        perturbed[block][i] = x - h;
                        let minus = self.evaluate(&perturbed)?;
                        (center - minus) / h
                    }
                    DiffMethod::Central => {
                        perturbed[block][i] = x + h;
                        let plus = self.evaluate(&perturbed)?;
                        perturbed[block][i] = x - h;
                        let minus = self.evaluate(&perturbed)?;
                        (plus - minus) / (2.0 * h)
                    }
                };
                perturbed[block][i] = x;
                jacobian.set_column(col, &column);
                col += 1;
            }
        }
        Ok(jacobian)
    }
}

impl<F> Factor for NumericDiffFactor<F>
where
    F: Fn(&[DVector<f64>]) -> FactorResult<DVector<f64>> + Send + Sync,
{
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> FactorResult<(DVector<f64>, Option<DMatrix<f64>>)> {
        if params.len() != self.block_sizes.len() {
            return Err(FactorError::InvalidDimension {
                expected: self.block_sizes.len(),
                actual: params.len(),
            });
        }
        let residual = self.evaluate(params)?;
        if !compute_jacobian {
            return Ok((residual, None));
        }
        let jacobian = self.jacobian(params, &residual).map_err(|e| {
            FactorError::JacobianFailed(format!("perturbed evaluation failed: {e}"))
        })?;
        Ok((residual, Some(jacobian)))
    }

    fn get_dimension(&self) -> usize {
        self.num_residuals
    }

    fn parameter_block_sizes(&self) -> Vec<usize> {
        self.block_sizes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(params: &[DVector<f64>]) -> FactorResult<DVector<f64>> {
        let (m, c) = (params[0][0], params[0][1]);
        Ok(DVector::from_vec(vec![(m * 2.0 + c).exp(), m * c]))
    }

    fn analytic(m: f64, c: f64) -> DMatrix<f64> {
        let e = (m * 2.0 + c).exp();
        DMatrix::from_row_slice(2, 2, &[2.0 * e, e, c, m])
    }

    #[test]
    fn test_all_stencils_approximate_analytic_jacobian() {
        let params = [DVector::from_vec(vec![0.3, 0.1])];
        let expected = analytic(0.3, 0.1);
        for (method, tolerance) in [
            (DiffMethod::Forward, 1e-5),
            (DiffMethod::Backward, 1e-5),
            (DiffMethod::Central, 1e-8),
        ] {
            let factor = NumericDiffFactor::new(curve, 2, vec![2])
                .unwrap()
                .with_method(method);
            let (_, j) = factor.linearize(&params, true).unwrap();
            let j = j.unwrap();
            for r in 0..2 {
                for c in 0..2 {
                    assert!(
                        (j[(r, c)] - expected[(r, c)]).abs() < tolerance,
                        "{method:?} at ({r}, {c})"
                    );
                }
            }
        }
    }

    #[test]
    fn test_zero_parameter_uses_absolute_step() {
        let factor = NumericDiffFactor::new(curve, 2, vec![2]).unwrap();
        let params = [DVector::from_vec(vec![0.0, 0.0])];
        let (_, j) = factor.linearize(&params, true).unwrap();
        let j = j.unwrap();
        assert!((j[(0, 0)] - 2.0).abs() < 1e-8);
        assert!(j[(1, 0)].abs() < 1e-12);
    }

    #[test]
    fn test_wrong_residual_count_is_reported() {
        let factor = NumericDiffFactor::new(curve, 3, vec![2]).unwrap();
        let params = [DVector::from_vec(vec![1.0, 1.0])];
        assert!(matches!(
            factor.linearize(&params, false),
            Err(FactorError::InvalidDimension {
                expected: 3,
                actual: 2
            })
        ));
    }
}
