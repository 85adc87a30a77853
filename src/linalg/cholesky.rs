use std::ops::Mul;

use faer::Mat;
use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers;
use faer::sparse::{SparseColMat, Triplet};
use tracing::debug;

use super::{LinAlgError, LinAlgResult, LinearSolution, LinearSolver, check_dimensions};

/// Sparse Cholesky factorization of `JᵀJ + D`.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    factorizations: usize,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        SparseCholeskySolver { factorizations: 0 }
    }

    /// Number of numeric factorizations performed so far
    pub fn factorizations(&self) -> usize {
        self.factorizations
    }
}

impl LinearSolver for SparseCholeskySolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        diagonal: &[f64],
    ) -> LinAlgResult<LinearSolution> {
        check_dimensions(residuals, jacobians, diagonal)?;
        let n = jacobians.ncols();

        // H = J^T * J
        let hessian = jacobians
            .as_ref()
            .transpose()
            .to_col_major()
            .map_err(|e| {
                LinAlgError::SparseMatrixCreation("transpose of jacobian".to_string())
                    .log_with_source(e)
            })?
            .mul(jacobians.as_ref());

        // Every diagonal entry is stored so the pattern does not depend on the damping.
        let diagonal_triplets: Vec<Triplet<usize, usize, f64>> = diagonal
            .iter()
            .enumerate()
            .map(|(i, &d)| Triplet::new(i, i, d))
            .collect();
        let damping = SparseColMat::try_new_from_triplets(n, n, &diagonal_triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation(format!("{n}x{n} damping matrix")).log_with_source(e)
        })?;
        let augmented_hessian = hessian + damping;

        // g = -J^T * r
        let gradient = jacobians.as_ref().transpose().mul(-residuals);

        let sym = solvers::SymbolicLlt::try_new(augmented_hessian.symbolic(), faer::Side::Lower)
            .map_err(|e| {
                LinAlgError::FactorizationFailed("symbolic cholesky".to_string())
                    .log_with_source(e)
            })?;
        self.factorizations += 1;
        let cholesky =
            solvers::Llt::try_new_with_symbolic(sym, augmented_hessian.as_ref(), faer::Side::Lower)
                .map_err(|e| {
                    debug!("sparse cholesky failed: {:?}", e);
                    LinAlgError::SingularSystem("matrix is not positive definite".to_string())
                })?;

        let step = cholesky.solve(gradient);
        if (0..n).any(|i| !step[(i, 0)].is_finite()) {
            return Err(LinAlgError::SingularSystem(
                "non-finite sparse cholesky solution".to_string(),
            ));
        }

        Ok(LinearSolution {
            step,
            iterations: 0,
        })
    }
}
