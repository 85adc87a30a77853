//! The problem graph: parameter blocks, residual blocks and the Jacobian layout.
//!
//! [`Problem`] exclusively owns both collections. Residual blocks refer to parameter blocks
//! through [`BlockHandle`] indices, so there is no shared ownership between them.
//!
//! # Example
//!
//! ```
//! use lsq_solver::core::Problem;
//! use lsq_solver::factors::PriorFactor;
//! use nalgebra::DVector;
//!
//! let mut problem = Problem::new();
//! let x = problem.add_parameter_block(&[0.5, 1.0]).unwrap();
//! let prior = PriorFactor::new(DVector::from_vec(vec![1.0, 2.0]));
//! problem
//!     .add_residual_block(Box::new(prior), None, &[x])
//!     .unwrap();
//!
//! let layout = problem.compute_layout();
//! assert_eq!(layout.num_columns(), 2);
//! assert_eq!(layout.num_rows(), 2);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::DVector;
use tracing::debug;

use crate::core::evaluator::{Evaluation, Evaluator};
use crate::core::layout::Layout;
use crate::core::loss_functions::LossFunction;
use crate::core::parameter_block::{BlockHandle, Bounds, ParameterBlock};
use crate::core::residual_block::{ResidualBlock, TermHandle};
use crate::core::state::ParameterState;
use crate::core::{CoreError, CoreResult};
use crate::factors::Factor;

static NEXT_PROBLEM_ID: AtomicU64 = AtomicU64::new(1);

/// A nonlinear least-squares problem: parameter blocks, residual blocks linking them, and
/// the per-block constant flags and bounds.
///
/// The problem owns the parameter values. `solve` reads the starting point from here and
/// writes the final point back; handles returned by the `add_*` methods are only valid for
/// the problem that issued them.
pub struct Problem {
    id: u64,
    parameter_blocks: Vec<ParameterBlock>,
    residual_blocks: Vec<ResidualBlock>,
    total_residual_dimension: usize,
    layout: Option<Layout>,
}

impl Default for Problem {
    fn default() -> Self {
        Self::new()
    }
}

impl Problem {
    pub fn new() -> Self {
        Self {
            id: NEXT_PROBLEM_ID.fetch_add(1, Ordering::Relaxed),
            parameter_blocks: Vec::new(),
            residual_blocks: Vec::new(),
            total_residual_dimension: 0,
            layout: None,
        }
    }

    /// Register a parameter block holding a copy of `values`.
    pub fn add_parameter_block(&mut self, values: &[f64]) -> CoreResult<BlockHandle> {
        self.push_parameter_block(ParameterBlock::new(values, None)?)
    }

    /// Register a parameter block with box bounds. The initial values must be feasible.
    pub fn add_bounded_parameter_block(
        &mut self,
        values: &[f64],
        bounds: Bounds,
    ) -> CoreResult<BlockHandle> {
        self.push_parameter_block(ParameterBlock::new(values, Some(bounds))?)
    }

    fn push_parameter_block(&mut self, block: ParameterBlock) -> CoreResult<BlockHandle> {
        let handle = BlockHandle {
            problem_id: self.id,
            index: self.parameter_blocks.len(),
        };
        debug!("added {} of size {}", handle, block.size());
        self.parameter_blocks.push(block);
        self.layout = None;
        Ok(handle)
    }

    /// Register a residual block evaluating `factor` on `blocks`, with an optional loss.
    ///
    /// Fails with [`CoreError::UnknownHandle`] for handles of another problem,
    /// [`CoreError::Dimension`] if the factor's declared block sizes disagree with
    /// `blocks`, and [`CoreError::DuplicateParameterBlock`] if a block is bound twice.
    pub fn add_residual_block(
        &mut self,
        factor: Box<dyn Factor>,
        loss_func: Option<Box<dyn LossFunction>>,
        blocks: &[BlockHandle],
    ) -> CoreResult<TermHandle> {
        let declared = factor.parameter_block_sizes();
        if declared.len() != blocks.len() {
            return Err(CoreError::Dimension(format!(
                "factor declares {} parameter blocks but {} were given",
                declared.len(),
                blocks.len()
            ))
            .log());
        }
        if factor.get_dimension() == 0 {
            return Err(
                CoreError::Dimension("factor declares zero residuals".to_string()).log(),
            );
        }

        let mut seen = HashSet::with_capacity(blocks.len());
        for (position, (&handle, &size)) in blocks.iter().zip(declared.iter()).enumerate() {
            let block = self.block(handle)?;
            if block.size() != size {
                return Err(CoreError::Dimension(format!(
                    "parameter {position} of the factor has size {size} but {handle} has size {}",
                    block.size()
                ))
                .log());
            }
            if !seen.insert(handle.index) {
                return Err(CoreError::DuplicateParameterBlock {
                    block: handle.index,
                }
                .log());
            }
        }

        let handle = TermHandle {
            problem_id: self.id,
            index: self.residual_blocks.len(),
        };
        self.total_residual_dimension += factor.get_dimension();
        self.residual_blocks.push(ResidualBlock::new(
            handle.index,
            blocks.to_vec(),
            factor,
            loss_func,
        ));
        self.layout = None;
        Ok(handle)
    }

    fn check_handle(&self, handle: BlockHandle) -> CoreResult<usize> {
        if handle.problem_id != self.id || handle.index >= self.parameter_blocks.len() {
            return Err(
                CoreError::UnknownHandle(format!("{handle} does not belong to this problem"))
                    .log(),
            );
        }
        Ok(handle.index)
    }

    fn block(&self, handle: BlockHandle) -> CoreResult<&ParameterBlock> {
        let index = self.check_handle(handle)?;
        Ok(&self.parameter_blocks[index])
    }

    fn block_mut(&mut self, handle: BlockHandle) -> CoreResult<&mut ParameterBlock> {
        let index = self.check_handle(handle)?;
        Ok(&mut self.parameter_blocks[index])
    }

    /// Hold `handle` fixed during optimization.
    pub fn set_constant(&mut self, handle: BlockHandle) -> CoreResult<()> {
        self.block_mut(handle)?.set_constant(true);
        self.layout = None;
        Ok(())
    }

    /// Let `handle` be optimized again.
    pub fn set_variable(&mut self, handle: BlockHandle) -> CoreResult<()> {
        self.block_mut(handle)?.set_constant(false);
        self.layout = None;
        Ok(())
    }

    pub fn is_constant(&self, handle: BlockHandle) -> CoreResult<bool> {
        Ok(self.block(handle)?.is_constant())
    }

    pub fn set_parameter_lower_bound(
        &mut self,
        handle: BlockHandle,
        index: usize,
        value: f64,
    ) -> CoreResult<()> {
        self.block_mut(handle)?.set_bound(index, value, true)
    }

    pub fn set_parameter_upper_bound(
        &mut self,
        handle: BlockHandle,
        index: usize,
        value: f64,
    ) -> CoreResult<()> {
        self.block_mut(handle)?.set_bound(index, value, false)
    }

    pub fn parameter_values(&self, handle: BlockHandle) -> CoreResult<&[f64]> {
        Ok(self.block(handle)?.values().as_slice())
    }

    /// Overwrite the values of `handle`. Sizes must match and bounds must hold.
    pub fn set_parameter_values(&mut self, handle: BlockHandle, values: &[f64]) -> CoreResult<()> {
        let block = self.block_mut(handle)?;
        if values.len() != block.size() {
            return Err(CoreError::Dimension(format!(
                "{handle} has size {} but {} values were given",
                block.size(),
                values.len()
            ))
            .log());
        }
        let values = DVector::from_column_slice(values);
        if let Some(bounds) = block.bounds() {
            if !bounds.contains(&values) {
                return Err(CoreError::InvalidBounds(format!(
                    "new values for {handle} lie outside the bounds"
                ))
                .log());
            }
        }
        block.set_values(&values);
        Ok(())
    }

    /// Deterministic column / row layout of the current structure.
    pub fn compute_layout(&self) -> Layout {
        Layout::build(
            self.id,
            self.parameter_blocks
                .iter()
                .map(|block| (block.size(), block.is_constant())),
            self.residual_blocks.iter().map(|rb| rb.dimension()),
        )
    }

    /// Cached layout, recomputed after blocks were added or their constancy changed.
    pub fn layout(&mut self) -> &Layout {
        let layout = match self.layout.take() {
            Some(layout) => layout,
            None => self.compute_layout(),
        };
        self.layout.insert(layout)
    }

    /// Evaluate cost, residuals and optionally the Jacobian at the current values.
    pub fn evaluate(&self, compute_jacobian: bool) -> CoreResult<Evaluation> {
        let layout = self.compute_layout();
        let state = ParameterState::from_problem(self);
        Evaluator::new(self, &layout).evaluate(&state, compute_jacobian)
    }

    /// Copy `state` into the parameter blocks.
    pub(crate) fn write_state(&mut self, state: &ParameterState) {
        for (block, values) in self.parameter_blocks.iter_mut().zip(state.blocks.iter()) {
            block.set_values(values);
        }
    }

    pub fn parameter_blocks(&self) -> &[ParameterBlock] {
        &self.parameter_blocks
    }

    pub fn residual_blocks(&self) -> &[ResidualBlock] {
        &self.residual_blocks
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.parameter_blocks.len()
    }

    /// Total number of scalars over all parameter blocks, constant ones included.
    pub fn num_parameters(&self) -> usize {
        self.parameter_blocks.iter().map(|b| b.size()).sum()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    pub fn num_residuals(&self) -> usize {
        self.total_residual_dimension
    }
}
