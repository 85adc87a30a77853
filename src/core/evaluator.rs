//! Stacked residual and sparse Jacobian evaluation.
//!
//! The evaluator visits every residual block, either sequentially or in parallel with
//! rayon. Each block produces its own corrected residual and Jacobian; no shared buffer is
//! written during that phase. After the join, a sequential pass scatters the block results
//! into their disjoint row ranges and column ranges given by the [`Layout`].
//!
//! If any block fails, the whole evaluation fails with that block's error and no output is
//! produced.

use std::ops::Mul;

use faer::Mat;
use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DVector;
use rayon::prelude::*;

use crate::core::layout::Layout;
use crate::core::problem::Problem;
use crate::core::residual_block::{BlockLinearization, ResidualBlock};
use crate::core::state::ParameterState;
use crate::core::{CoreError, CoreResult};

/// Result of one evaluation of the whole problem.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// F(x) = ½ Σ ρᵢ(‖rᵢ‖²)
    pub cost: f64,
    /// Stacked corrected residuals, `num_rows × 1`
    pub residuals: Mat<f64>,
    /// Corrected Jacobian, `num_rows × num_columns`
    pub jacobian: Option<SparseColMat<usize, f64>>,
    /// g = Jᵀr, `num_columns × 1`
    pub gradient: Option<Mat<f64>>,
    /// Squared column norms of the Jacobian, i.e. diag(JᵀJ)
    pub jacobian_column_norms: Option<Vec<f64>>,
}

/// Evaluates a problem at arbitrary parameter states without touching its blocks.
pub struct Evaluator<'a> {
    problem: &'a Problem,
    layout: &'a Layout,
    parallel: bool,
}

impl<'a> Evaluator<'a> {
    pub fn new(problem: &'a Problem, layout: &'a Layout) -> Self {
        Self {
            problem,
            layout,
            parallel: true,
        }
    }

    /// Enable or disable parallel evaluation of residual blocks.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn problem(&self) -> &'a Problem {
        self.problem
    }

    pub fn layout(&self) -> &'a Layout {
        self.layout
    }

    pub fn num_rows(&self) -> usize {
        self.layout.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.layout.num_columns()
    }

    fn linearize_block(
        residual_block: &ResidualBlock,
        state: &ParameterState,
        compute_jacobian: bool,
    ) -> CoreResult<BlockLinearization> {
        let params: Vec<DVector<f64>> = residual_block
            .parameter_blocks
            .iter()
            .map(|handle| state.blocks[handle.index].clone())
            .collect();
        residual_block.linearize(&params, compute_jacobian)
    }

    /// Cost only, for step quality checks.
    pub fn evaluate_cost(&self, state: &ParameterState) -> CoreResult<f64> {
        Ok(self.evaluate(state, false)?.cost)
    }

    /// Evaluate every residual block at `state`.
    pub fn evaluate(
        &self,
        state: &ParameterState,
        compute_jacobian: bool,
    ) -> CoreResult<Evaluation> {
        let residual_blocks = self.problem.residual_blocks();
        let linearize = |rb: &ResidualBlock| Self::linearize_block(rb, state, compute_jacobian);

        let linearizations: Vec<BlockLinearization> = if self.parallel && residual_blocks.len() > 1
        {
            residual_blocks
                .par_iter()
                .map(linearize)
                .collect::<CoreResult<Vec<_>>>()?
        } else {
            residual_blocks
                .iter()
                .map(linearize)
                .collect::<CoreResult<Vec<_>>>()?
        };

        self.assemble(residual_blocks, &linearizations, compute_jacobian)
    }

    fn assemble(
        &self,
        residual_blocks: &[ResidualBlock],
        linearizations: &[BlockLinearization],
        compute_jacobian: bool,
    ) -> CoreResult<Evaluation> {
        let layout = self.layout;
        let num_rows = layout.num_rows();
        let num_columns = layout.num_columns();

        let mut cost = 0.0;
        let mut residuals = Mat::<f64>::zeros(num_rows, 1);
        let mut triplets: Vec<Triplet<usize, usize, f64>> = Vec::new();
        let mut column_norms = vec![0.0; num_columns];

        for (rb, lin) in residual_blocks.iter().zip(linearizations.iter()) {
            let row_start = layout.term_rows[rb.residual_block_id];
            cost += lin.cost;
            for (i, value) in lin.residual.iter().enumerate() {
                residuals[(row_start + i, 0)] = *value;
            }

            let Some(jacobian) = lin.jacobian.as_ref() else {
                continue;
            };
            let mut local_col = 0;
            for handle in rb.parameter_blocks() {
                let size = layout.block_sizes[handle.index];
                if let Some(col_start) = layout.block_columns[handle.index] {
                    for c in 0..size {
                        let col = col_start + c;
                        for r in 0..jacobian.nrows() {
                            let value = jacobian[(r, local_col + c)];
                            triplets.push(Triplet::new(row_start + r, col, value));
                            column_norms[col] += value * value;
                        }
                    }
                }
                local_col += size;
            }
        }

        if !compute_jacobian {
            return Ok(Evaluation {
                cost,
                residuals,
                jacobian: None,
                gradient: None,
                jacobian_column_norms: None,
            });
        }

        let jacobian = SparseColMat::try_new_from_triplets(num_rows, num_columns, &triplets)
            .map_err(|e| {
                CoreError::JacobianAssembly(format!(
                    "{num_rows}x{num_columns} matrix from {} entries",
                    triplets.len()
                ))
                .log_with_source(e)
            })?;

        // g = Jᵀr
        let gradient = jacobian.as_ref().transpose().mul(&residuals);

        Ok(Evaluation {
            cost,
            residuals,
            jacobian: Some(jacobian),
            gradient: Some(gradient),
            jacobian_column_norms: Some(column_norms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loss_functions::CauchyLoss;
    use crate::core::loss_functions::LossFunction;
    use crate::factors::{Factor, FactorError, FactorResult, PriorFactor};
    use nalgebra::DMatrix;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// r = [a·b, a + c]
    struct Product;

    impl Factor for Product {
        fn linearize(
            &self,
            params: &[DVector<f64>],
            compute_jacobian: bool,
        ) -> FactorResult<(DVector<f64>, Option<DMatrix<f64>>)> {
            let (a, b, c) = (params[0][0], params[1][0], params[2][0]);
            let residual = DVector::from_vec(vec![a * b, a + c]);
            let jacobian = compute_jacobian
                .then(|| DMatrix::from_row_slice(2, 3, &[b, a, 0.0, 1.0, 0.0, 1.0]));
            Ok((residual, jacobian))
        }

        fn get_dimension(&self) -> usize {
            2
        }

        fn parameter_block_sizes(&self) -> Vec<usize> {
            vec![1, 1, 1]
        }
    }

    struct Failing;

    impl Factor for Failing {
        fn linearize(
            &self,
            _params: &[DVector<f64>],
            _compute_jacobian: bool,
        ) -> FactorResult<(DVector<f64>, Option<DMatrix<f64>>)> {
            Err(FactorError::EvaluationFailed("domain error".into()))
        }

        fn get_dimension(&self) -> usize {
            1
        }

        fn parameter_block_sizes(&self) -> Vec<usize> {
            vec![1]
        }
    }

    #[test]
    fn test_constant_block_columns_are_skipped() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(&[2.0])?;
        let b = problem.add_parameter_block(&[3.0])?;
        let c = problem.add_parameter_block(&[5.0])?;
        problem.add_residual_block(Box::new(Product), None, &[a, b, c])?;
        problem.set_constant(b)?;

        let layout = problem.compute_layout();
        let state = ParameterState::from_problem(&problem);
        let evaluation = Evaluator::new(&problem, &layout).evaluate(&state, true)?;

        let jacobian = evaluation.jacobian.ok_or("missing jacobian")?;
        assert_eq!(jacobian.nrows(), 2);
        assert_eq!(jacobian.ncols(), 2);
        let j = jacobian.to_dense();
        // columns: a, c
        assert_eq!(j[(0, 0)], 3.0);
        assert_eq!(j[(0, 1)], 0.0);
        assert_eq!(j[(1, 0)], 1.0);
        assert_eq!(j[(1, 1)], 1.0);

        // r = [6, 7], cost = ½(36 + 49)
        assert_eq!(evaluation.cost, 42.5);
        let gradient = evaluation.gradient.ok_or("missing gradient")?;
        assert_eq!(gradient[(0, 0)], 3.0 * 6.0 + 7.0);
        assert_eq!(gradient[(1, 0)], 7.0);
        let norms = evaluation.jacobian_column_norms.ok_or("missing norms")?;
        assert_eq!(norms, vec![10.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_parallel_and_sequential_agree() -> TestResult {
        let mut problem = Problem::new();
        let mut handles = Vec::new();
        for i in 0..20 {
            handles.push(problem.add_parameter_block(&[i as f64, 1.0 - i as f64])?);
        }
        for (i, h) in handles.iter().enumerate() {
            let prior = PriorFactor::new(DVector::from_vec(vec![0.5, -0.5]));
            let loss: Option<Box<dyn LossFunction>> = if i % 3 == 0 {
                Some(Box::new(CauchyLoss::new(1.0)?))
            } else {
                None
            };
            problem.add_residual_block(Box::new(prior), loss, &[*h])?;
        }
        let layout = problem.compute_layout();
        let state = ParameterState::from_problem(&problem);

        let parallel = Evaluator::new(&problem, &layout).evaluate(&state, true)?;
        let sequential = Evaluator::new(&problem, &layout)
            .with_parallel(false)
            .evaluate(&state, true)?;

        assert!((parallel.cost - sequential.cost).abs() < 1e-12);
        for i in 0..layout.num_rows() {
            assert_eq!(parallel.residuals[(i, 0)], sequential.residuals[(i, 0)]);
        }
        Ok(())
    }

    #[test]
    fn test_failure_aborts_whole_evaluation() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(&[1.0])?;
        problem.add_residual_block(
            Box::new(PriorFactor::new(DVector::from_element(1, 0.0))),
            None,
            &[a],
        )?;
        problem.add_residual_block(Box::new(Failing), None, &[a])?;

        let layout = problem.compute_layout();
        let state = ParameterState::from_problem(&problem);
        let result = Evaluator::new(&problem, &layout).evaluate(&state, false);
        match result {
            Err(CoreError::ResidualEvaluation { term, reason }) => {
                assert_eq!(term, 1);
                assert!(reason.contains("domain error"));
            }
            other => panic!("expected residual evaluation failure, got {other:?}"),
        }
        Ok(())
    }
}
