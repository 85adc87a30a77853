//! Shared problem builders for solver integration tests
//!
//! Provides residual functors for classic small test problems:
//! - `Quadratic`: r(x) = 10 − x, minimum at x = 10
//! - Powell's singular function, four residual blocks over four scalar blocks
//! - `SqrtFactor`, which fails to evaluate for negative parameters

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use lsq_solver::factors::{AutoDiffFactor, AutoDiffFunctor, Factor, FactorError, FactorResult, Scalar};
use lsq_solver::{BlockHandle, Problem};
use nalgebra::{DMatrix, DVector};

/// r(x) = 10 − x
pub struct Quadratic;

impl AutoDiffFunctor for Quadratic {
    fn num_residuals(&self) -> usize {
        1
    }

    fn parameter_block_sizes(&self) -> Vec<usize> {
        vec![1]
    }

    fn residuals<T: Scalar>(&self, params: &[&[T]], residuals: &mut [T]) -> bool {
        residuals[0] = -params[0][0] + 10.0;
        true
    }
}

/// r = x1 + 10 x2
pub struct PowellF1;

/// r = √5 (x3 − x4)
pub struct PowellF2;

/// r = (x2 − 2 x3)²
pub struct PowellF3;

/// r = √10 (x1 − x4)²
pub struct PowellF4;

macro_rules! pairwise_functor {
    ($name:ident, |$a:ident, $b:ident| $body:expr) => {
        impl AutoDiffFunctor for $name {
            fn num_residuals(&self) -> usize {
                1
            }

            fn parameter_block_sizes(&self) -> Vec<usize> {
                vec![1, 1]
            }

            fn residuals<T: Scalar>(&self, params: &[&[T]], residuals: &mut [T]) -> bool {
                let $a = params[0][0];
                let $b = params[1][0];
                residuals[0] = $body;
                true
            }
        }
    };
}

pairwise_functor!(PowellF1, |x1, x2| x1 + x2 * 10.0);
pairwise_functor!(PowellF2, |x3, x4| (x3 - x4) * 5.0_f64.sqrt());
pairwise_functor!(PowellF3, |x2, x3| (x2 - x3 * 2.0).powi(2));
pairwise_functor!(PowellF4, |x1, x4| (x1 - x4).powi(2) * 10.0_f64.sqrt());

/// Handles of the four Powell parameter blocks
pub struct Powell {
    pub x1: BlockHandle,
    pub x2: BlockHandle,
    pub x3: BlockHandle,
    pub x4: BlockHandle,
}

impl Powell {
    pub fn values(&self, problem: &Problem) -> [f64; 4] {
        [self.x1, self.x2, self.x3, self.x4]
            .map(|h| problem.parameter_values(h).map(|v| v[0]).unwrap_or(f64::NAN))
    }
}

/// Powell's function started from the classic point (3, −1, 0, 1)
pub fn powell_problem() -> (Problem, Powell) {
    let mut problem = Problem::new();
    let x1 = problem.add_parameter_block(&[3.0]).unwrap();
    let x2 = problem.add_parameter_block(&[-1.0]).unwrap();
    let x3 = problem.add_parameter_block(&[0.0]).unwrap();
    let x4 = problem.add_parameter_block(&[1.0]).unwrap();

    problem
        .add_residual_block(Box::new(AutoDiffFactor::<_, 2>::new(PowellF1).unwrap()), None, &[x1, x2])
        .unwrap();
    problem
        .add_residual_block(Box::new(AutoDiffFactor::<_, 2>::new(PowellF2).unwrap()), None, &[x3, x4])
        .unwrap();
    problem
        .add_residual_block(Box::new(AutoDiffFactor::<_, 2>::new(PowellF3).unwrap()), None, &[x2, x3])
        .unwrap();
    problem
        .add_residual_block(Box::new(AutoDiffFactor::<_, 2>::new(PowellF4).unwrap()), None, &[x1, x4])
        .unwrap();

    (problem, Powell { x1, x2, x3, x4 })
}

/// Single-block problem minimizing ½(10 − x)² from `x0`
pub fn quadratic_problem(x0: f64) -> (Problem, BlockHandle) {
    let mut problem = Problem::new();
    let x = problem.add_parameter_block(&[x0]).unwrap();
    problem
        .add_residual_block(Box::new(AutoDiffFactor::<_, 1>::new(Quadratic).unwrap()), None, &[x])
        .unwrap();
    (problem, x)
}

/// r(x) = √x − target, undefined for negative x
pub struct SqrtFactor {
    pub target: f64,
}

impl Factor for SqrtFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> FactorResult<(DVector<f64>, Option<DMatrix<f64>>)> {
        let x = params[0][0];
        if x < 0.0 {
            return Err(FactorError::EvaluationFailed(format!("sqrt of {x}")));
        }
        let residual = DVector::from_element(1, x.sqrt() - self.target);
        let jacobian = compute_jacobian.then(|| DMatrix::from_element(1, 1, 0.5 / x.sqrt()));
        Ok((residual, jacobian))
    }

    fn get_dimension(&self) -> usize {
        1
    }

    fn parameter_block_sizes(&self) -> Vec<usize> {
        vec![1]
    }
}
