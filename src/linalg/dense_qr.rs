//! Dense QR on the augmented least squares system.
//!
//! `(JᵀJ + D) δ = −Jᵀr` is the normal equation of
//!
//! ```text
//! | J  |     | −r |
//! | √D | δ ≈ |  0 |
//! ```
//!
//! which is solved without forming JᵀJ, so its conditioning is that of J rather than its
//! square.

use faer::Mat;
use faer::sparse::SparseColMat;
use faer_ext::{IntoFaer, IntoNalgebra};
use nalgebra::{DMatrix, DVector};

use super::{LinAlgError, LinAlgResult, LinearSolution, LinearSolver, check_dimensions};

/// Relative threshold on the diagonal of R below which the system is rank deficient.
const RANK_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, Default)]
pub struct DenseQrSolver;

impl DenseQrSolver {
    pub fn new() -> Self {
        DenseQrSolver
    }
}

impl LinearSolver for DenseQrSolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: &[f64],
    ) -> LinAlgResult<LinearSolution> {
        check_dimensions(residuals, jacobian, diagonal)?;
        let m = jacobian.nrows();
        let n = jacobian.ncols();

        let dense_jacobian = jacobian.to_dense();
        let mut augmented = DMatrix::<f64>::zeros(m + n, n);
        augmented
            .view_mut((0, 0), (m, n))
            .copy_from(&dense_jacobian.as_ref().into_nalgebra());
        for (i, &d) in diagonal.iter().enumerate() {
            augmented[(m + i, i)] = d.max(0.0).sqrt();
        }
        let mut rhs = DVector::<f64>::zeros(m + n);
        rhs.rows_mut(0, m)
            .copy_from(&residuals.as_ref().into_nalgebra().column(0));
        rhs.neg_mut();

        let (q, r) = augmented.qr().unpack();
        let max_diag = (0..n).fold(0.0_f64, |acc, i| acc.max(r[(i, i)].abs()));
        // Relative to the largest pivot only.
        let threshold = RANK_TOLERANCE * max_diag * (m + n) as f64;
        if n > 0 && (max_diag == 0.0 || (0..n).any(|i| r[(i, i)].abs() <= threshold)) {
            return Err(LinAlgError::SingularSystem(
                "rank deficient augmented jacobian".to_string(),
            ));
        }

        let qtb = q.transpose() * rhs;
        let step = r
            .solve_upper_triangular(&qtb)
            .ok_or_else(|| LinAlgError::SingularSystem("zero pivot in R".to_string()))?;

        Ok(LinearSolution {
            step: step.view_range(.., ..).into_faer().to_owned(),
            iterations: 0,
        })
    }
}
