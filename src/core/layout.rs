//! Mapping between the problem graph and the global residual / parameter vectors.
//!
//! Columns are assigned by concatenating the non-constant parameter blocks in registration
//! order; rows by concatenating the residual blocks in registration order. The layout is a
//! pure function of the problem structure and the constancy flags, so two problems built
//! the same way get identical layouts.

use crate::core::parameter_block::BlockHandle;
use crate::core::residual_block::TermHandle;
use crate::core::{CoreError, CoreResult};

/// Row and column offsets of every block of one problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub(crate) problem_id: u64,
    /// First column of every parameter block, `None` for constant blocks
    pub(crate) block_columns: Vec<Option<usize>>,
    pub(crate) block_sizes: Vec<usize>,
    /// First row of every residual block
    pub(crate) term_rows: Vec<usize>,
    pub(crate) term_sizes: Vec<usize>,
    pub(crate) num_columns: usize,
    pub(crate) num_rows: usize,
}

impl Layout {
    /// Build a layout from block sizes, constancy flags and residual block sizes.
    pub(crate) fn build(
        problem_id: u64,
        blocks: impl IntoIterator<Item = (usize, bool)>,
        terms: impl IntoIterator<Item = usize>,
    ) -> Self {
        let mut block_columns = Vec::new();
        let mut block_sizes = Vec::new();
        let mut num_columns = 0;
        for (size, constant) in blocks {
            if constant {
                block_columns.push(None);
            } else {
                block_columns.push(Some(num_columns));
                num_columns += size;
            }
            block_sizes.push(size);
        }

        let mut term_rows = Vec::new();
        let mut term_sizes = Vec::new();
        let mut num_rows = 0;
        for size in terms {
            term_rows.push(num_rows);
            term_sizes.push(size);
            num_rows += size;
        }

        Self {
            problem_id,
            block_columns,
            block_sizes,
            term_rows,
            term_sizes,
            num_columns,
            num_rows,
        }
    }

    /// Number of optimized scalars (length of the step vector)
    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    /// Number of residuals (length of the stacked residual vector)
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn check_block(&self, block: BlockHandle) -> CoreResult<usize> {
        if block.problem_id != self.problem_id || block.index >= self.block_columns.len() {
            return Err(CoreError::UnknownHandle(format!(
                "{block} is not part of this layout"
            )));
        }
        Ok(block.index)
    }

    /// First column of `block`, `None` if the block is constant.
    pub fn block_column(&self, block: BlockHandle) -> CoreResult<Option<usize>> {
        let index = self.check_block(block)?;
        Ok(self.block_columns[index])
    }

    /// Column of element `element` of `block`, `None` if the block is constant.
    pub fn column_of(&self, block: BlockHandle, element: usize) -> CoreResult<Option<usize>> {
        let index = self.check_block(block)?;
        if element >= self.block_sizes[index] {
            return Err(CoreError::Dimension(format!(
                "element {element} out of range for {block} of size {}",
                self.block_sizes[index]
            )));
        }
        Ok(self.block_columns[index].map(|start| start + element))
    }

    /// Row of residual `element` of `term`.
    pub fn row_of(&self, term: TermHandle, element: usize) -> CoreResult<usize> {
        if term.problem_id != self.problem_id || term.index >= self.term_rows.len() {
            return Err(CoreError::UnknownHandle(format!(
                "{term} is not part of this layout"
            )));
        }
        if element >= self.term_sizes[term.index] {
            return Err(CoreError::Dimension(format!(
                "element {element} out of range for {term} of size {}",
                self.term_sizes[term.index]
            )));
        }
        Ok(self.term_rows[term.index] + element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(index: usize) -> BlockHandle {
        BlockHandle {
            problem_id: 1,
            index,
        }
    }

    #[test]
    fn test_constant_blocks_take_no_columns() {
        let layout = Layout::build(1, [(2, false), (3, true), (1, false)], [4, 1]);
        assert_eq!(layout.num_columns(), 3);
        assert_eq!(layout.num_rows(), 5);
        assert_eq!(layout.column_of(handle(0), 1).unwrap(), Some(1));
        assert_eq!(layout.column_of(handle(1), 0).unwrap(), None);
        assert_eq!(layout.column_of(handle(2), 0).unwrap(), Some(2));
    }

    #[test]
    fn test_rows_follow_registration_order() {
        let layout = Layout::build(1, [(1, false)], [2, 3, 1]);
        let term = |index| TermHandle {
            problem_id: 1,
            index,
        };
        assert_eq!(layout.row_of(term(0), 1).unwrap(), 1);
        assert_eq!(layout.row_of(term(1), 0).unwrap(), 2);
        assert_eq!(layout.row_of(term(2), 0).unwrap(), 5);
        assert!(layout.row_of(term(2), 1).is_err());
    }

    #[test]
    fn test_foreign_handle_is_rejected() {
        let layout = Layout::build(1, [(1, false)], [1]);
        let foreign = BlockHandle {
            problem_id: 2,
            index: 0,
        };
        assert!(matches!(
            layout.block_column(foreign),
            Err(CoreError::UnknownHandle(_))
        ));
    }
}
