//! Residual blocks: a factor, an optional loss and the parameter blocks it reads.
//!
//! A block evaluates its factor, checks the output shapes and finiteness, and applies the
//! loss correction. Placing the result into the global Jacobian is the evaluator's job.

use std::fmt;

use nalgebra::{DMatrix, DVector};

use crate::core::corrector::Corrector;
use crate::core::loss_functions::LossFunction;
use crate::core::parameter_block::BlockHandle;
use crate::core::{CoreError, CoreResult};
use crate::factors::Factor;

/// Opaque reference to a residual block registered in a [`Problem`](crate::core::Problem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TermHandle {
    pub(crate) problem_id: u64,
    pub(crate) index: usize,
}

impl TermHandle {
    /// Registration index of the residual block inside its problem
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for TermHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "residual#{}", self.index)
    }
}

/// Residual and Jacobian of one residual block after the loss correction.
#[derive(Debug, Clone)]
pub struct BlockLinearization {
    /// Corrected residual r̃
    pub residual: DVector<f64>,
    /// Corrected Jacobian J̃ (all bound blocks, constant ones included)
    pub jacobian: Option<DMatrix<f64>>,
    /// Cost contribution ½ρ(‖r‖²)
    pub cost: f64,
}

/// A factor bound to parameter blocks, with an optional robust loss.
pub struct ResidualBlock {
    pub residual_block_id: usize,
    pub(crate) parameter_blocks: Vec<BlockHandle>,
    factor: Box<dyn Factor>,
    loss_func: Option<Box<dyn LossFunction>>,
}

impl ResidualBlock {
    pub(crate) fn new(
        residual_block_id: usize,
        parameter_blocks: Vec<BlockHandle>,
        factor: Box<dyn Factor>,
        loss_func: Option<Box<dyn LossFunction>>,
    ) -> Self {
        ResidualBlock {
            residual_block_id,
            parameter_blocks,
            factor,
            loss_func,
        }
    }

    pub fn dimension(&self) -> usize {
        self.factor.get_dimension()
    }

    pub fn parameter_blocks(&self) -> &[BlockHandle] {
        &self.parameter_blocks
    }

    pub fn has_loss(&self) -> bool {
        self.loss_func.is_some()
    }

    /// Evaluate the factor at `params` and apply the loss correction.
    ///
    /// Shape mismatches and non-finite outputs are reported as
    /// [`CoreError::ResidualEvaluation`], the same as an explicit factor failure.
    pub fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> CoreResult<BlockLinearization> {
        let fail = |reason: String| CoreError::ResidualEvaluation {
            term: self.residual_block_id,
            reason,
        };

        let (mut residual, mut jacobian) = self
            .factor
            .linearize(params, compute_jacobian)
            .map_err(|e| fail(e.to_string()))?;

        let dim = self.dimension();
        if residual.len() != dim {
            return Err(fail(format!(
                "factor returned {} residuals, declared {}",
                residual.len(),
                dim
            )));
        }
        if residual.iter().any(|v| !v.is_finite()) {
            return Err(fail("residual contains non-finite values".to_string()));
        }

        if compute_jacobian {
            let cols: usize = params.iter().map(|p| p.len()).sum();
            let jac = jacobian
                .as_ref()
                .ok_or_else(|| fail("factor did not return the requested Jacobian".to_string()))?;
            if jac.nrows() != dim || jac.ncols() != cols {
                return Err(fail(format!(
                    "Jacobian is {}x{}, expected {}x{}",
                    jac.nrows(),
                    jac.ncols(),
                    dim,
                    cols
                )));
            }
            if jac.iter().any(|v| !v.is_finite()) {
                return Err(fail("Jacobian contains non-finite values".to_string()));
            }
        } else {
            jacobian = None;
        }

        let squared_norm = residual.norm_squared();
        let cost = match self.loss_func.as_ref() {
            Some(loss_func) => {
                let rho = loss_func.evaluate(squared_norm);
                let corrector = Corrector::new(loss_func.as_ref(), squared_norm);
                if let Some(jac) = jacobian.as_mut() {
                    corrector.correct_jacobian(&residual, jac);
                }
                corrector.correct_residuals(&mut residual);
                0.5 * rho[0]
            }
            None => 0.5 * squared_norm,
        };

        Ok(BlockLinearization {
            residual,
            jacobian,
            cost,
        })
    }
}

impl fmt::Debug for ResidualBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResidualBlock")
            .field("residual_block_id", &self.residual_block_id)
            .field("dimension", &self.dimension())
            .field("parameter_blocks", &self.parameter_blocks)
            .field("has_loss", &self.has_loss())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loss_functions::HuberLoss;
    use crate::factors::{FactorError, FactorResult};

    struct Offset {
        target: f64,
        fail: bool,
        bad_shape: bool,
    }

    impl Factor for Offset {
        fn linearize(
            &self,
            params: &[DVector<f64>],
            compute_jacobian: bool,
        ) -> FactorResult<(DVector<f64>, Option<DMatrix<f64>>)> {
            if self.fail {
                return Err(FactorError::EvaluationFailed("not evaluable".into()));
            }
            let n = if self.bad_shape { 2 } else { 1 };
            let residual = DVector::from_element(n, params[0][0] - self.target);
            Ok((residual, compute_jacobian.then(|| DMatrix::from_element(n, 1, 1.0))))
        }

        fn get_dimension(&self) -> usize {
            1
        }

        fn parameter_block_sizes(&self) -> Vec<usize> {
            vec![1]
        }
    }

    fn block(factor: Offset, loss: Option<Box<dyn LossFunction>>) -> ResidualBlock {
        let handle = BlockHandle {
            problem_id: 0,
            index: 0,
        };
        ResidualBlock::new(7, vec![handle], Box::new(factor), loss)
    }

    #[test]
    fn test_plain_cost_is_half_squared_norm() {
        let rb = block(
            Offset {
                target: 1.0,
                fail: false,
                bad_shape: false,
            },
            None,
        );
        let lin = rb.linearize(&[DVector::from_element(1, 4.0)], true).unwrap();
        assert_eq!(lin.cost, 4.5);
        assert_eq!(lin.residual[0], 3.0);
        assert!(lin.jacobian.is_some());
    }

    #[test]
    fn test_loss_changes_cost_and_scales_residual() {
        let rb = block(
            Offset {
                target: 0.0,
                fail: false,
                bad_shape: false,
            },
            Some(Box::new(HuberLoss::new(1.0).unwrap())),
        );
        let lin = rb.linearize(&[DVector::from_element(1, 3.0)], false).unwrap();
        // ρ(9) = 2·3 − 1 = 5
        assert!((lin.cost - 2.5).abs() < 1e-12);
        assert!(lin.residual[0] < 3.0);
        assert!(lin.jacobian.is_none());
    }

    #[test]
    fn test_failure_reports_residual_block_id() {
        let rb = block(
            Offset {
                target: 0.0,
                fail: true,
                bad_shape: false,
            },
            None,
        );
        match rb.linearize(&[DVector::from_element(1, 0.0)], true) {
            Err(CoreError::ResidualEvaluation { term, .. }) => assert_eq!(term, 7),
            other => panic!("expected evaluation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_residual_size_is_an_evaluation_failure() {
        let rb = block(
            Offset {
                target: 0.0,
                fail: false,
                bad_shape: true,
            },
            None,
        );
        let result = rb.linearize(&[DVector::from_element(1, 0.0)], false);
        assert!(matches!(result, Err(CoreError::ResidualEvaluation { .. })));
    }
}
