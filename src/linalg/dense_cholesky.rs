use faer::Mat;
use faer::sparse::SparseColMat;
use faer_ext::{IntoFaer, IntoNalgebra};

use super::{LinAlgError, LinAlgResult, LinearSolution, LinearSolver, check_dimensions};

/// Dense Cholesky factorization of the normal matrix `JᵀJ + D`.
#[derive(Debug, Clone, Default)]
pub struct DenseCholeskySolver;

impl DenseCholeskySolver {
    pub fn new() -> Self {
        DenseCholeskySolver
    }
}

impl LinearSolver for DenseCholeskySolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: &[f64],
    ) -> LinAlgResult<LinearSolution> {
        check_dimensions(residuals, jacobian, diagonal)?;

        let dense_jacobian = jacobian.to_dense();
        let j = dense_jacobian.as_ref().into_nalgebra();
        let mut hessian = j.transpose() * j;
        for (i, &d) in diagonal.iter().enumerate() {
            hessian[(i, i)] += d;
        }
        let gradient = -(j.transpose() * residuals.as_ref().into_nalgebra().column(0));

        let cholesky = hessian.cholesky().ok_or_else(|| {
            LinAlgError::SingularSystem("normal matrix is not positive definite".to_string())
        })?;
        let step = cholesky.solve(&gradient);
        if step.iter().any(|v| !v.is_finite()) {
            return Err(LinAlgError::SingularSystem(
                "non-finite cholesky solution".to_string(),
            ));
        }

        Ok(LinearSolution {
            step: step.view_range(.., ..).into_faer().to_owned(),
            iterations: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::test_utils::{column, sparse_from_rows};

    #[test]
    fn test_diagonal_system() {
        let j = sparse_from_rows(2, 2, &[2.0, 0.0, 0.0, 1.0]);
        let r = column(&[4.0, -1.0]);
        let mut solver = DenseCholeskySolver::new();
        let solution = solver.solve_augmented_equation(&r, &j, &[0.0, 1.0]).unwrap();
        // 4 x0 = -8, 2 x1 = 1
        assert!((solution.step[(0, 0)] + 2.0).abs() < 1e-12);
        assert!((solution.step[(1, 0)] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_indefinite_system_is_singular() {
        let j = sparse_from_rows(1, 2, &[1.0, 1.0]);
        let r = column(&[1.0]);
        let mut solver = DenseCholeskySolver::new();
        assert!(matches!(
            solver.solve_augmented_equation(&r, &j, &[0.0, 0.0]),
            Err(LinAlgError::SingularSystem(_))
        ));
    }
}
