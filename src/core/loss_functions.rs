//! Robust loss functions for nonlinear least squares.
//!
//! Without a loss, a residual block contributes `½‖r‖²` to the cost. With a loss ρ the
//! contribution becomes `½ρ(s)` with `s = ‖r‖²`, which bounds the influence of outliers.
//!
//! Every loss reports `[ρ(s), ρ'(s), ρ''(s)]`. The evaluator feeds these values to the
//! [`Corrector`](crate::core::corrector::Corrector), which rescales the residual and the
//! Jacobian so the linear solver sees an ordinary least squares problem.
//!
//! All losses here satisfy `ρ(0) = 0`, `ρ'(0) = 1`, and are parameterized by a scale `a`
//! at which they start to deviate from the quadratic.
//!
//! # Example
//!
//! ```
//! use lsq_solver::core::loss_functions::{HuberLoss, LossFunction};
//!
//! let huber = HuberLoss::new(1.0).unwrap();
//!
//! // Inlier: identical to the squared loss
//! let [rho, rho1, rho2] = huber.evaluate(0.25);
//! assert_eq!([rho, rho1, rho2], [0.25, 1.0, 0.0]);
//!
//! // Outlier: linear growth, reduced weight
//! let [rho, rho1, _] = huber.evaluate(9.0);
//! assert!((rho - 5.0).abs() < 1e-12);
//! assert!(rho1 < 1.0);
//! ```

use crate::core::{CoreError, CoreResult};

/// A robust loss ρ applied to the squared norm of a residual block.
pub trait LossFunction: Send + Sync {
    /// Evaluate `[ρ(s), ρ'(s), ρ''(s)]` at the squared residual norm `s >= 0`.
    fn evaluate(&self, s: f64) -> [f64; 3];
}

fn check_scale(name: &str, scale: f64) -> CoreResult<()> {
    if !(scale > 0.0 && scale.is_finite()) {
        return Err(CoreError::InvalidParameter(format!(
            "{name} scale must be positive and finite, got {scale}"
        ))
        .log());
    }
    Ok(())
}

/// Huber loss: quadratic for inliers, linear for outliers.
///
/// ```text
/// ρ(s) = s                 s ≤ a²
///        2a√s − a²         s > a²
/// ```
#[derive(Debug, Clone)]
pub struct HuberLoss {
    a: f64,
    b: f64,
}

impl HuberLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("Huber", scale)?;
        Ok(Self {
            a: scale,
            b: scale * scale,
        })
    }
}

impl LossFunction for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.b {
            let r = s.sqrt();
            let rho1 = (self.a / r).max(f64::MIN_POSITIVE);
            [2.0 * self.a * r - self.b, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Soft L1 loss, a smooth approximation of the Huber loss.
///
/// ```text
/// ρ(s) = 2a²(√(1 + s/a²) − 1)
/// ```
#[derive(Debug, Clone)]
pub struct SoftLOneLoss {
    b: f64,
    c: f64,
}

impl SoftLOneLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("SoftLOne", scale)?;
        let b = scale * scale;
        Ok(Self { b, c: 1.0 / b })
    }
}

impl LossFunction for SoftLOneLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let tmp = sum.sqrt();
        [
            2.0 * self.b * (tmp - 1.0),
            (1.0 / tmp).max(f64::MIN_POSITIVE),
            -(self.c * (1.0 / tmp)) / (2.0 * sum),
        ]
    }
}

/// Cauchy loss: logarithmic growth, strong down-weighting of large residuals.
///
/// ```text
/// ρ(s) = a² log(1 + s/a²)
/// ```
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    b: f64,
    c: f64,
}

impl CauchyLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("Cauchy", scale)?;
        let b = scale * scale;
        Ok(Self { b, c: 1.0 / b })
    }
}

impl LossFunction for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let inv = 1.0 / sum;
        [
            self.b * sum.ln(),
            inv.max(f64::MIN_POSITIVE),
            -self.c * (inv * inv),
        ]
    }
}

/// Arctan loss: the cost saturates at `aπ/2`, so outliers stop contributing.
///
/// ```text
/// ρ(s) = a·atan(s/a)
/// ```
#[derive(Debug, Clone)]
pub struct ArctanLoss {
    a: f64,
    b: f64,
}

impl ArctanLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("Arctan", scale)?;
        Ok(Self {
            a: scale,
            b: 1.0 / (scale * scale),
        })
    }
}

impl LossFunction for ArctanLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * s * self.b;
        let inv = 1.0 / sum;
        [
            self.a * s.atan2(self.a),
            inv.max(f64::MIN_POSITIVE),
            -2.0 * s * self.b * (inv * inv),
        ]
    }
}
