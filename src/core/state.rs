//! Snapshot of all parameter values used by the minimizers.
//!
//! The minimizers never touch the problem's parameter blocks while they run. They work on
//! a [`ParameterState`] copied at the start and hand the last accepted state back to the
//! driver, which writes it into the problem once.

use faer::Mat;
use nalgebra::DVector;

use crate::core::layout::Layout;
use crate::core::problem::Problem;

/// Values of every parameter block, indexed by registration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterState {
    pub(crate) blocks: Vec<DVector<f64>>,
}

impl ParameterState {
    /// Copy the current values out of `problem`.
    pub fn from_problem(problem: &Problem) -> Self {
        Self {
            blocks: problem
                .parameter_blocks()
                .iter()
                .map(|block| block.values().clone())
                .collect(),
        }
    }

    pub fn block(&self, index: usize) -> &DVector<f64> {
        &self.blocks[index]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Apply `step` (one entry per layout column) to the non-constant blocks and project
    /// the result onto the blocks' bounds.
    pub fn plus(&self, problem: &Problem, layout: &Layout, step: &Mat<f64>) -> Self {
        let mut blocks = self.blocks.clone();
        for (index, values) in blocks.iter_mut().enumerate() {
            let Some(start) = layout.block_columns[index] else {
                continue;
            };
            for (i, v) in values.iter_mut().enumerate() {
                *v += step[(start + i, 0)];
            }
            if let Some(bounds) = problem.parameter_blocks()[index].bounds() {
                bounds.project(values);
            }
        }
        Self { blocks }
    }

    /// Euclidean norm over the non-constant blocks.
    pub fn variable_norm(&self, layout: &Layout) -> f64 {
        self.blocks
            .iter()
            .zip(layout.block_columns.iter())
            .filter(|(_, column)| column.is_some())
            .map(|(values, _)| values.norm_squared())
            .sum::<f64>()
            .sqrt()
    }

    /// Difference `self − other` over the non-constant blocks, in layout order.
    pub fn difference(&self, other: &ParameterState, layout: &Layout) -> Mat<f64> {
        let mut delta = Mat::<f64>::zeros(layout.num_columns(), 1);
        for (index, column) in layout.block_columns.iter().enumerate() {
            let Some(start) = column else {
                continue;
            };
            for i in 0..self.blocks[index].len() {
                delta[(start + i, 0)] = self.blocks[index][i] - other.blocks[index][i];
            }
        }
        delta
    }

    /// Infinity norm of the projected gradient `x − Π(x − g)`.
    ///
    /// Without bounds this is `‖g‖∞`. With bounds, gradient components pushing a value
    /// against its active bound do not count.
    pub fn projected_gradient_norm(
        &self,
        problem: &Problem,
        layout: &Layout,
        gradient: &Mat<f64>,
    ) -> f64 {
        let mut max_norm = 0.0_f64;
        for (index, column) in layout.block_columns.iter().enumerate() {
            let Some(start) = column else {
                continue;
            };
            let bounds = problem.parameter_blocks()[index].bounds();
            for (i, &x) in self.blocks[index].iter().enumerate() {
                let g = gradient[(start + i, 0)];
                let projected = match bounds {
                    Some(b) => (x - g).clamp(b.lower[i], b.upper[i]),
                    None => x - g,
                };
                max_norm = max_norm.max((x - projected).abs());
            }
        }
        max_norm
    }
}
