//! Conjugate gradients on the normal equations (CGNR).
//!
//! The normal matrix is never formed. Each iteration applies `p ↦ Jᵀ(J p) + D p` using two
//! sparse products, with a Jacobi preconditioner built from `diag(JᵀJ) + D`.

use std::ops::Mul;

use faer::Mat;
use faer::sparse::SparseColMat;
use tracing::debug;

use super::{LinAlgError, LinAlgResult, LinearSolution, LinearSolver, check_dimensions};

/// `aᵀb` for two column vectors.
fn dot(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    a.col(0).transpose() * b.col(0)
}

#[derive(Debug, Clone)]
pub struct ConjugateGradientSolver {
    max_cg_iterations: usize,
    /// Relative tolerance on the residual norm of the normal equations
    cg_tolerance: f64,
}

impl ConjugateGradientSolver {
    pub fn new() -> Self {
        Self::with_cg_params(500, 1e-10)
    }

    pub fn with_cg_params(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_cg_iterations: max_iterations.max(1),
            cg_tolerance: tolerance,
        }
    }

    fn apply_operator(
        jacobian: &SparseColMat<usize, f64>,
        diagonal: &[f64],
        p: &Mat<f64>,
    ) -> Mat<f64> {
        let jp = jacobian.as_ref().mul(p);
        let mut result = jacobian.as_ref().transpose().mul(&jp);
        for (i, &d) in diagonal.iter().enumerate() {
            result[(i, 0)] += d * p[(i, 0)];
        }
        result
    }

    fn jacobi_preconditioner(jacobian: &SparseColMat<usize, f64>, diagonal: &[f64]) -> Vec<f64> {
        (0..jacobian.ncols())
            .map(|col| {
                let h = jacobian
                    .val_of_col(col)
                    .iter()
                    .map(|v| v * v)
                    .sum::<f64>()
                    + diagonal[col];
                if h > 0.0 { 1.0 / h } else { 1.0 }
            })
            .collect()
    }

    fn solve_pcg(
        &self,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: &[f64],
        b: &Mat<f64>,
    ) -> LinAlgResult<LinearSolution> {
        let n = b.nrows();
        let precond = Self::jacobi_preconditioner(jacobian, diagonal);
        let mut x = Mat::<f64>::zeros(n, 1);

        let b_norm = b.norm_l2();
        if b_norm == 0.0 {
            return Ok(LinearSolution {
                step: x,
                iterations: 0,
            });
        }
        let tolerance = self.cg_tolerance * b_norm;

        // r = b - A*x (x starts at 0, so r = b)
        let mut r = b.clone();
        let mut z = Mat::from_fn(n, 1, |i, _| precond[i] * r[(i, 0)]);
        let mut p = z.clone();
        let mut rz_old = dot(&r, &z);

        let mut iterations = 0;
        while iterations < self.max_cg_iterations {
            let ap = Self::apply_operator(jacobian, diagonal, &p);
            let p_ap = dot(&p, &ap);
            if p_ap <= 1e-300 {
                if iterations == 0 {
                    return Err(LinAlgError::SingularSystem(
                        "normal matrix has a null direction along the gradient".to_string(),
                    ));
                }
                break;
            }
            iterations += 1;

            let alpha = rz_old / p_ap;
            for i in 0..n {
                x[(i, 0)] += alpha * p[(i, 0)];
                r[(i, 0)] -= alpha * ap[(i, 0)];
            }

            let r_norm = r.norm_l2();
            if r_norm < tolerance {
                break;
            }

            for i in 0..n {
                z[(i, 0)] = precond[i] * r[(i, 0)];
            }
            let rz_new = dot(&r, &z);
            let beta = rz_new / rz_old;
            for i in 0..n {
                p[(i, 0)] = z[(i, 0)] + beta * p[(i, 0)];
            }
            rz_old = rz_new;
        }

        if (0..n).any(|i| !x[(i, 0)].is_finite()) {
            return Err(LinAlgError::SingularSystem(
                "conjugate gradients diverged".to_string(),
            ));
        }
        debug!("cgnr finished after {} iterations", iterations);

        Ok(LinearSolution {
            step: x,
            iterations,
        })
    }
}

impl Default for ConjugateGradientSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearSolver for ConjugateGradientSolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: &[f64],
    ) -> LinAlgResult<LinearSolution> {
        check_dimensions(residuals, jacobian, diagonal)?;
        let b = jacobian.as_ref().transpose().mul(-residuals);
        self.solve_pcg(jacobian, diagonal, &b)
    }
}
