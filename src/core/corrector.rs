//! Residual and Jacobian correction for robust losses.
//!
//! A residual block with loss ρ contributes `½ρ(‖r‖²)` to the cost. The corrector rewrites
//! the block as an ordinary least squares term `½‖r̃‖²` whose Gauss-Newton model has the
//! same gradient and a second-order-accurate Hessian (Triggs et al., "Bundle Adjustment:
//! A Modern Synthesis", section 4.3). With `s = ‖r‖²` and `[ρ, ρ', ρ'']`:
//!
//! ```text
//! α  = 1 − √(1 + 2sρ''/ρ')
//! r̃  = √ρ' / (1 − α) · r
//! J̃  = √ρ' · (J − (α/s) · r rᵀ J)
//! ```
//!
//! When `s = 0` or `ρ'' ≤ 0` the square root above can become imaginary, or the
//! rank-one term would make the model indefinite. In that case the second-order term is
//! dropped and both residual and Jacobian are scaled by `√ρ'` only.

use nalgebra::{DMatrix, DVector};

use crate::core::loss_functions::LossFunction;

/// Scaling factors for one residual block at one evaluation point.
#[derive(Debug, Clone)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    /// Evaluate `loss` at the squared residual norm `sq_norm` and derive the scaling.
    pub fn new(loss: &dyn LossFunction, sq_norm: f64) -> Self {
        let [_, rho1, rho2] = loss.evaluate(sq_norm);
        let sqrt_rho1 = rho1.sqrt();

        if sq_norm == 0.0 || rho2 <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        // rho2 > 0 here, so the discriminant is above one.
        let d = 1.0 + 2.0 * sq_norm * rho2 / rho1;
        let alpha = 1.0 - d.sqrt();

        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    /// Whether the rank-one curvature term is applied.
    pub fn uses_second_order_term(&self) -> bool {
        self.alpha_sq_norm != 0.0
    }

    /// Rewrite `jacobian` in place. `residual` must be the uncorrected residual.
    pub fn correct_jacobian(&self, residual: &DVector<f64>, jacobian: &mut DMatrix<f64>) {
        if self.alpha_sq_norm != 0.0 {
            let rtj = residual.transpose() * &*jacobian;
            *jacobian -= (residual * rtj) * self.alpha_sq_norm;
        }
        *jacobian *= self.sqrt_rho1;
    }

    /// Rewrite `residual` in place.
    pub fn correct_residuals(&self, residual: &mut DVector<f64>) {
        *residual *= self.residual_scaling;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loss_functions::{CauchyLoss, HuberLoss};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// ρ(s) = s + s²/2, a loss with positive curvature.
    struct StiffeningLoss;

    impl LossFunction for StiffeningLoss {
        fn evaluate(&self, s: f64) -> [f64; 3] {
            [s + 0.5 * s * s, 1.0 + s, 1.0]
        }
    }

    #[test]
    fn test_inlier_is_unchanged() -> TestResult {
        let loss = HuberLoss::new(1.0)?;
        let residual = DVector::from_vec(vec![0.1, 0.2, 0.1]);
        let corrector = Corrector::new(&loss, residual.norm_squared());

        let mut corrected = residual.clone();
        corrector.correct_residuals(&mut corrected);
        assert!((corrected - &residual).norm() < 1e-15);
        assert!(!corrector.uses_second_order_term());
        Ok(())
    }

    #[test]
    fn test_negative_curvature_drops_second_order_term() -> TestResult {
        let loss = CauchyLoss::new(1.0)?;
        let residual = DVector::from_vec(vec![2.0, 3.0]);
        let sq_norm = residual.norm_squared();
        let corrector = Corrector::new(&loss, sq_norm);
        assert!(!corrector.uses_second_order_term());

        let rho1 = loss.evaluate(sq_norm)[1];
        let mut jacobian = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, -1.0, 2.0]);
        let expected = &jacobian * rho1.sqrt();
        corrector.correct_jacobian(&residual, &mut jacobian);
        assert!((jacobian - expected).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_corrected_gradient_matches_robust_gradient() {
        // Gradient of ½ρ(‖r‖²) is ρ'·Jᵀr; the corrected system must reproduce it.
        let loss = StiffeningLoss;
        let residual = DVector::from_vec(vec![0.7, -0.4]);
        let jacobian = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 2.0, 0.5, -1.0, 1.0]);
        let sq_norm = residual.norm_squared();
        let rho1 = loss.evaluate(sq_norm)[1];

        let corrector = Corrector::new(&loss, sq_norm);
        assert!(corrector.uses_second_order_term());

        let mut r = residual.clone();
        let mut j = jacobian.clone();
        corrector.correct_jacobian(&residual, &mut j);
        corrector.correct_residuals(&mut r);

        let corrected_gradient = j.transpose() * r;
        let robust_gradient = jacobian.transpose() * &residual * rho1;
        assert!((corrected_gradient - robust_gradient).norm() < 1e-12);
    }

    #[test]
    fn test_zero_residual_uses_plain_scaling() {
        let corrector = Corrector::new(&StiffeningLoss, 0.0);
        assert!(!corrector.uses_second_order_term());
        let mut residual = DVector::from_vec(vec![0.0, 0.0]);
        corrector.correct_residuals(&mut residual);
        assert_eq!(residual.norm(), 0.0);
    }
}
