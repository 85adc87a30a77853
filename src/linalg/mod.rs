//! Linear solvers for the damped normal equations.
//!
//! Every minimizer iteration solves
//!
//! ```text
//! (JᵀJ + D) δ = −Jᵀr
//! ```
//!
//! where `D` is a non-negative diagonal supplied by the minimizer (λ times the clamped
//! diagonal of JᵀJ for Levenberg-Marquardt). Four backends are available:
//!
//! - [`DenseQrSolver`]: nalgebra QR of the augmented matrix `[J; √D]`
//! - [`DenseCholeskySolver`]: nalgebra Cholesky of the dense normal matrix
//! - [`SparseCholeskySolver`]: faer sparse Cholesky of the normal matrix
//! - [`ConjugateGradientSolver`]: Jacobi-preconditioned CG using only products with J and Jᵀ
//!
//! A numerically singular system is reported as [`LinAlgError::SingularSystem`]. The
//! minimizers treat it as a rejected step and increase the damping.

use std::fmt;

use faer::Mat;
use faer::sparse::SparseColMat;
use thiserror::Error;
use tracing::error;

pub mod cholesky;
pub mod conjugate_gradient;
pub mod dense_cholesky;
pub mod dense_qr;

pub use cholesky::SparseCholeskySolver;
pub use conjugate_gradient::ConjugateGradientSolver;
pub use dense_cholesky::DenseCholeskySolver;
pub use dense_qr::DenseQrSolver;

/// Largest number of columns for which `LinearSolverType::Auto` picks a dense solver.
pub const DENSE_COLUMN_LIMIT: usize = 256;

/// Linear algebra error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// The system is numerically rank deficient
    #[error("Singular linear system: {0}")]
    SingularSystem(String),

    /// A factorization could not be computed
    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    /// A sparse matrix could not be built
    #[error("Sparse matrix creation failed: {0}")]
    SparseMatrixCreation(String),

    /// Operand sizes are incompatible
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying source error
    #[must_use]
    pub fn log_with_source<E: fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Which linear solver the minimizer uses
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    /// Dense QR for small problems, conjugate gradients for large ones
    #[default]
    Auto,
    DenseQr,
    DenseNormalCholesky,
    SparseNormalCholesky,
    ConjugateGradients,
}

impl LinearSolverType {
    /// Replace `Auto` by a concrete solver for a problem with `num_columns` unknowns.
    pub fn resolve(self, num_columns: usize) -> Self {
        match self {
            LinearSolverType::Auto if num_columns <= DENSE_COLUMN_LIMIT => {
                LinearSolverType::DenseQr
            }
            LinearSolverType::Auto => LinearSolverType::ConjugateGradients,
            other => other,
        }
    }
}

impl fmt::Display for LinearSolverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::Auto => write!(f, "AUTO"),
            LinearSolverType::DenseQr => write!(f, "DENSE_QR"),
            LinearSolverType::DenseNormalCholesky => write!(f, "DENSE_NORMAL_CHOLESKY"),
            LinearSolverType::SparseNormalCholesky => write!(f, "SPARSE_NORMAL_CHOLESKY"),
            LinearSolverType::ConjugateGradients => write!(f, "CGNR"),
        }
    }
}

/// Step returned by a linear solver.
#[derive(Debug, Clone)]
pub struct LinearSolution {
    pub step: Mat<f64>,
    /// Inner iterations (0 for direct solvers)
    pub iterations: usize,
}

/// Solver for `(JᵀJ + diag(diagonal)) δ = −Jᵀr`.
pub trait LinearSolver: Send {
    /// `residuals` is `m × 1`, `jacobian` is `m × n`, `diagonal` holds `n` non-negative
    /// entries added to the normal matrix.
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: &[f64],
    ) -> LinAlgResult<LinearSolution>;
}

/// Build the solver for a resolved `solver_type`.
pub fn create_linear_solver(
    solver_type: LinearSolverType,
    max_iterations: usize,
    tolerance: f64,
) -> Box<dyn LinearSolver> {
    match solver_type {
        LinearSolverType::Auto | LinearSolverType::DenseQr => Box::new(DenseQrSolver::new()),
        LinearSolverType::DenseNormalCholesky => Box::new(DenseCholeskySolver::new()),
        LinearSolverType::SparseNormalCholesky => Box::new(SparseCholeskySolver::new()),
        LinearSolverType::ConjugateGradients => Box::new(ConjugateGradientSolver::with_cg_params(
            max_iterations,
            tolerance,
        )),
    }
}

pub(crate) fn check_dimensions(
    residuals: &Mat<f64>,
    jacobian: &SparseColMat<usize, f64>,
    diagonal: &[f64],
) -> LinAlgResult<()> {
    if residuals.nrows() != jacobian.nrows() || diagonal.len() != jacobian.ncols() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "jacobian {}x{}, residuals {}, diagonal {}",
            jacobian.nrows(),
            jacobian.ncols(),
            residuals.nrows(),
            diagonal.len()
        ))
        .log());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use faer::sparse::Triplet;
    use faer_ext::IntoNalgebra;
    use nalgebra::DVector;

    /// Build a sparse matrix from a dense row-major description.
    pub fn sparse_from_rows(rows: usize, cols: usize, values: &[f64]) -> SparseColMat<usize, f64> {
        let triplets: Vec<Triplet<usize, usize, f64>> = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .filter(|&(r, c)| values[r * cols + c] != 0.0)
            .map(|(r, c)| Triplet::new(r, c, values[r * cols + c]))
            .collect();
        match SparseColMat::try_new_from_triplets(rows, cols, &triplets) {
            Ok(m) => m,
            Err(e) => panic!("invalid test matrix: {e:?}"),
        }
    }

    pub fn column(values: &[f64]) -> Mat<f64> {
        Mat::from_fn(values.len(), 1, |i, _| values[i])
    }

    /// Reference solution of the damped normal equations with nalgebra LU.
    pub fn reference_step(
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
        diagonal: &[f64],
    ) -> DVector<f64> {
        let j = jacobian.to_dense().as_ref().into_nalgebra().into_owned();
        let r = residuals.as_ref().into_nalgebra().column(0).into_owned();
        let mut h = j.transpose() * &j;
        for (i, d) in diagonal.iter().enumerate() {
            h[(i, i)] += d;
        }
        let g = -(j.transpose() * r);
        match h.lu().solve(&g) {
            Some(x) => x,
            None => panic!("reference system is singular"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn test_auto_resolution() {
        assert_eq!(LinearSolverType::Auto.resolve(4), LinearSolverType::DenseQr);
        assert_eq!(
            LinearSolverType::Auto.resolve(DENSE_COLUMN_LIMIT + 1),
            LinearSolverType::ConjugateGradients
        );
        assert_eq!(
            LinearSolverType::SparseNormalCholesky.resolve(4),
            LinearSolverType::SparseNormalCholesky
        );
    }

    #[test]
    fn test_all_solvers_agree_on_damped_system() {
        let j = sparse_from_rows(4, 3, &[
            1.0, 0.0, 2.0, //
            0.0, 3.0, 1.0, //
            1.0, 1.0, 0.0, //
            0.0, 0.0, 1.0,
        ]);
        let r = column(&[1.0, -2.0, 0.5, 3.0]);
        let diagonal = [0.1, 0.2, 0.3];
        let expected = reference_step(&j, &r, &diagonal);

        for solver_type in [
            LinearSolverType::DenseQr,
            LinearSolverType::DenseNormalCholesky,
            LinearSolverType::SparseNormalCholesky,
            LinearSolverType::ConjugateGradients,
        ] {
            let mut solver = create_linear_solver(solver_type, 100, 1e-12);
            let solution = match solver.solve_augmented_equation(&r, &j, &diagonal) {
                Ok(solution) => solution,
                Err(e) => panic!("{solver_type} failed: {e}"),
            };
            for i in 0..3 {
                assert!(
                    (solution.step[(i, 0)] - expected[i]).abs() < 1e-8,
                    "{solver_type} differs at {i}"
                );
            }
        }
    }

    #[test]
    fn test_dimension_mismatch_is_reported() {
        let j = sparse_from_rows(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let r = column(&[1.0, 1.0, 1.0]);
        let mut solver = DenseQrSolver::new();
        let result = solver.solve_augmented_equation(&r, &j, &[0.0, 0.0]);
        assert!(matches!(result, Err(LinAlgError::DimensionMismatch(_))));
    }
}
