//! Forward-mode automatic differentiation.
//!
//! A residual expression is written once, generic over [`Scalar`]. It is evaluated with
//! `f64` when only residuals are needed and with [`Jet<N>`] dual numbers when the Jacobian
//! is requested. Each scalar of each parameter block is seeded with its own infinitesimal
//! direction, so a single evaluation yields the full `m × N` Jacobian.
//!
//! ```
//! use lsq_solver::factors::{AutoDiffFactor, AutoDiffFunctor, Scalar};
//!
//! // r = x1 + 10 x2
//! struct F1;
//!
//! impl AutoDiffFunctor for F1 {
//!     fn num_residuals(&self) -> usize {
//!         1
//!     }
//!     fn parameter_block_sizes(&self) -> Vec<usize> {
//!         vec![1, 1]
//!     }
//!     fn residuals<T: Scalar>(&self, params: &[&[T]], residuals: &mut [T]) -> bool {
//!         residuals[0] = params[0][0] + params[1][0] * 10.0;
//!         true
//!     }
//! }
//!
//! let factor = AutoDiffFactor::<F1, 2>::new(F1).unwrap();
//! ```

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

use nalgebra::{DMatrix, DVector};

use super::{Factor, FactorError, FactorResult};

/// Number type a generic residual expression is evaluated with.
pub trait Scalar:
    Copy
    + Debug
    + Send
    + Sync
    + PartialEq
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + 'static
{
    /// Constant with no derivative part
    fn from_f64(value: f64) -> Self;
    /// Real part
    fn value(&self) -> f64;
    fn sqrt(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn powi(self, n: i32) -> Self;
    fn powf(self, n: f64) -> Self;
    fn abs(self) -> Self;
    fn atan(self) -> Self;
}

impl Scalar for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }
    fn value(&self) -> f64 {
        *self
    }
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    fn sin(self) -> Self {
        f64::sin(self)
    }
    fn cos(self) -> Self {
        f64::cos(self)
    }
    fn exp(self) -> Self {
        f64::exp(self)
    }
    fn ln(self) -> Self {
        f64::ln(self)
    }
    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }
    fn powf(self, n: f64) -> Self {
        f64::powf(self, n)
    }
    fn abs(self) -> Self {
        f64::abs(self)
    }
    fn atan(self) -> Self {
        f64::atan(self)
    }
}

/// Dual number `a + Σ vᵢ εᵢ` with `N` infinitesimal parts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jet<const N: usize> {
    pub a: f64,
    pub v: [f64; N],
}

impl<const N: usize> Jet<N> {
    pub fn constant(a: f64) -> Self {
        Self { a, v: [0.0; N] }
    }

    /// Independent variable with unit derivative along direction `k`.
    pub fn variable(a: f64, k: usize) -> Self {
        let mut v = [0.0; N];
        if k < N {
            v[k] = 1.0;
        }
        Self { a, v }
    }

    /// Apply a scalar function with value `f` and derivative `df` at `self.a`.
    fn chain(self, f: f64, df: f64) -> Self {
        let mut v = self.v;
        for x in v.iter_mut() {
            *x *= df;
        }
        Self { a: f, v }
    }
}

impl<const N: usize> PartialOrd for Jet<N> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.a.partial_cmp(&other.a)
    }
}

impl<const N: usize> Add for Jet<N> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        let mut v = self.v;
        for (x, y) in v.iter_mut().zip(rhs.v.iter()) {
            *x += y;
        }
        Self { a: self.a + rhs.a, v }
    }
}

impl<const N: usize> Sub for Jet<N> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        let mut v = self.v;
        for (x, y) in v.iter_mut().zip(rhs.v.iter()) {
            *x -= y;
        }
        Self { a: self.a - rhs.a, v }
    }
}

impl<const N: usize> Mul for Jet<N> {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        let mut v = [0.0; N];
        for (k, x) in v.iter_mut().enumerate() {
            *x = self.a * rhs.v[k] + self.v[k] * rhs.a;
        }
        Self { a: self.a * rhs.a, v }
    }
}

impl<const N: usize> Div for Jet<N> {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        // (a + u)/(b + w) = a/b + (u − (a/b) w)/b
        let inv = 1.0 / rhs.a;
        let a = self.a * inv;
        let mut v = [0.0; N];
        for (k, x) in v.iter_mut().enumerate() {
            *x = (self.v[k] - a * rhs.v[k]) * inv;
        }
        Self { a, v }
    }
}

impl<const N: usize> Neg for Jet<N> {
    type Output = Self;
    fn neg(self) -> Self {
        let mut v = self.v;
        for x in v.iter_mut() {
            *x = -*x;
        }
        Self { a: -self.a, v }
    }
}

impl<const N: usize> Add<f64> for Jet<N> {
    type Output = Self;
    fn add(self, rhs: f64) -> Self {
        Self {
            a: self.a + rhs,
            v: self.v,
        }
    }
}

impl<const N: usize> Sub<f64> for Jet<N> {
    type Output = Self;
    fn sub(self, rhs: f64) -> Self {
        Self {
            a: self.a - rhs,
            v: self.v,
        }
    }
}

impl<const N: usize> Mul<f64> for Jet<N> {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        self.chain(self.a * rhs, rhs)
    }
}

impl<const N: usize> Div<f64> for Jet<N> {
    type Output = Self;
    fn div(self, rhs: f64) -> Self {
        self.chain(self.a / rhs, 1.0 / rhs)
    }
}

impl<const N: usize> AddAssign for Jet<N> {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<const N: usize> SubAssign for Jet<N> {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl<const N: usize> MulAssign for Jet<N> {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl<const N: usize> Scalar for Jet<N> {
    fn from_f64(value: f64) -> Self {
        Self::constant(value)
    }

    fn value(&self) -> f64 {
        self.a
    }

    fn sqrt(self) -> Self {
        let s = self.a.sqrt();
        self.chain(s, 0.5 / s)
    }

    fn sin(self) -> Self {
        self.chain(self.a.sin(), self.a.cos())
    }

    fn cos(self) -> Self {
        self.chain(self.a.cos(), -self.a.sin())
    }

    fn exp(self) -> Self {
        let e = self.a.exp();
        self.chain(e, e)
    }

    fn ln(self) -> Self {
        self.chain(self.a.ln(), 1.0 / self.a)
    }

    fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::constant(1.0);
        }
        self.chain(self.a.powi(n), f64::from(n) * self.a.powi(n - 1))
    }

    fn powf(self, n: f64) -> Self {
        self.chain(self.a.powf(n), n * self.a.powf(n - 1.0))
    }

    fn abs(self) -> Self {
        if self.a < 0.0 { -self } else { self }
    }

    fn atan(self) -> Self {
        self.chain(self.a.atan(), 1.0 / (1.0 + self.a * self.a))
    }
}

/// Residual expression generic over the scalar type.
pub trait AutoDiffFunctor: Send + Sync {
    fn num_residuals(&self) -> usize;

    fn parameter_block_sizes(&self) -> Vec<usize>;

    /// Write the residuals for `params` (one slice per parameter block).
    ///
    /// Return `false` if the expression is not defined at `params`.
    fn residuals<T: Scalar>(&self, params: &[&[T]], residuals: &mut [T]) -> bool;
}

/// [`Factor`] computing exact Jacobians of an [`AutoDiffFunctor`].
///
/// `N` is the total number of parameters over all bound blocks.
pub struct AutoDiffFactor<F, const N: usize> {
    functor: F,
    block_sizes: Vec<usize>,
    num_residuals: usize,
}

impl<F: AutoDiffFunctor, const N: usize> AutoDiffFactor<F, N> {
    pub fn new(functor: F) -> FactorResult<Self> {
        let block_sizes = functor.parameter_block_sizes();
        let total: usize = block_sizes.iter().sum();
        if total != N {
            return Err(FactorError::InvalidDimension {
                expected: N,
                actual: total,
            }
            .log());
        }
        if block_sizes.iter().any(|&s| s == 0) {
            return Err(
                FactorError::InvalidParameters("zero-sized parameter block".to_string()).log(),
            );
        }
        let num_residuals = functor.num_residuals();
        Ok(Self {
            functor,
            block_sizes,
            num_residuals,
        })
    }

    pub fn functor(&self) -> &F {
        &self.functor
    }

    fn check_params(&self, params: &[DVector<f64>]) -> FactorResult<()> {
        if params.len() != self.block_sizes.len() {
            return Err(FactorError::InvalidDimension {
                expected: self.block_sizes.len(),
                actual: params.len(),
            });
        }
        for (p, &size) in params.iter().zip(self.block_sizes.iter()) {
            if p.len() != size {
                return Err(FactorError::InvalidDimension {
                    expected: size,
                    actual: p.len(),
                });
            }
        }
        Ok(())
    }

    fn evaluate_values(&self, params: &[DVector<f64>]) -> FactorResult<DVector<f64>> {
        let slices: Vec<&[f64]> = params.iter().map(|p| p.as_slice()).collect();
        let mut residuals = vec![0.0; self.num_residuals];
        if !self.functor.residuals(&slices, &mut residuals) {
            return Err(FactorError::EvaluationFailed(
                "functor reported failure".to_string(),
            ));
        }
        Ok(DVector::from_vec(residuals))
    }

    fn evaluate_jets(
        &self,
        params: &[DVector<f64>],
    ) -> FactorResult<(DVector<f64>, DMatrix<f64>)> {
        let mut offset = 0;
        let jets: Vec<Vec<Jet<N>>> = params
            .iter()
            .map(|p| {
                let block: Vec<Jet<N>> = p
                    .iter()
                    .enumerate()
                    .map(|(i, &x)| Jet::variable(x, offset + i))
                    .collect();
                offset += p.len();
                block
            })
            .collect();
        let slices: Vec<&[Jet<N>]> = jets.iter().map(|b| b.as_slice()).collect();

        let mut residuals = vec![Jet::<N>::constant(0.0); self.num_residuals];
        if !self.functor.residuals(&slices, &mut residuals) {
            return Err(FactorError::EvaluationFailed(
                "functor reported failure".to_string(),
            ));
        }

        let values = DVector::from_fn(self.num_residuals, |i, _| residuals[i].a);
        let jacobian = DMatrix::from_fn(self.num_residuals, N, |i, k| residuals[i].v[k]);
        Ok((values, jacobian))
    }
}

impl<F: AutoDiffFunctor, const N: usize> Factor for AutoDiffFactor<F, N> {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> FactorResult<(DVector<f64>, Option<DMatrix<f64>>)> {
        self.check_params(params)?;
        if compute_jacobian {
            let (residual, jacobian) = self.evaluate_jets(params)?;
            Ok((residual, Some(jacobian)))
        } else {
            Ok((self.evaluate_values(params)?, None))
        }
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

    /// r = [x0² y + sin(x1), exp(y) / x0]
    struct Mixed;

    impl AutoDiffFunctor for Mixed {
        fn num_residuals(&self) -> usize {
            2
        }

        fn parameter_block_sizes(&self) -> Vec<usize> {
            vec![2, 1]
        }

        fn residuals<T: Scalar>(&self, params: &[&[T]], residuals: &mut [T]) -> bool {
            let (x0, x1, y) = (params[0][0], params[0][1], params[1][0]);
            residuals[0] = x0.powi(2) * y + x1.sin();
            residuals[1] = y.exp() / x0;
            true
        }
    }

    struct LogOfFirst;

    impl AutoDiffFunctor for LogOfFirst {
        fn num_residuals(&self) -> usize {
            1
        }

        fn parameter_block_sizes(&self) -> Vec<usize> {
            vec![1]
        }

        fn residuals<T: Scalar>(&self, params: &[&[T]], residuals: &mut [T]) -> bool {
            if params[0][0].value() <= 0.0 {
                return false;
            }
            residuals[0] = params[0][0].ln();
            true
        }
    }

    #[test]
    fn test_jacobian_matches_analytic() {
        let factor = AutoDiffFactor::<Mixed, 3>::new(Mixed).unwrap();
        let (x0, x1, y) = (1.5, 0.3, -0.7);
        let params = [
            DVector::from_vec(vec![x0, x1]),
            DVector::from_vec(vec![y]),
        ];
        let (r, j) = factor.linearize(&params, true).unwrap();
        let j = j.unwrap();

        assert!((r[0] - (x0 * x0 * y + x1.sin())).abs() < 1e-15);
        assert!((r[1] - y.exp() / x0).abs() < 1e-15);

        let expected = [
            [2.0 * x0 * y, x1.cos(), x0 * x0],
            [-y.exp() / (x0 * x0), 0.0, y.exp() / x0],
        ];
        for (row, values) in expected.iter().enumerate() {
            for (col, value) in values.iter().enumerate() {
                assert!((j[(row, col)] - value).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_wrong_total_dimension_is_rejected() {
        assert!(matches!(
            AutoDiffFactor::<Mixed, 2>::new(Mixed),
            Err(FactorError::InvalidDimension {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_functor_failure_is_an_error() {
        let factor = AutoDiffFactor::<LogOfFirst, 1>::new(LogOfFirst).unwrap();
        let params = [DVector::from_element(1, -1.0)];
        assert!(factor.linearize(&params, false).is_err());
        assert!(factor.linearize(&params, true).is_err());

        let params = [DVector::from_element(1, 2.0)];
        let (_, j) = factor.linearize(&params, true).unwrap();
        assert!((j.unwrap()[(0, 0)] - 0.5).abs() < 1e-15);
    }

    #[test]
    fn test_jet_elementary_functions() {
        let x = Jet::<1>::variable(0.5, 0);
        assert!((x.sqrt().v[0] - 0.5 / 0.5_f64.sqrt()).abs() < 1e-15);
        assert!((x.atan().v[0] - 1.0 / 1.25).abs() < 1e-15);
        assert!((x.powf(3.0).v[0] - 0.75).abs() < 1e-15);
        assert_eq!((-x).abs().v[0], 1.0);
        assert!(x < Jet::constant(1.0));
    }
}
