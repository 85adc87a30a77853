//! Parameter blocks: the groups of scalars the solver optimizes.
//!
//! A parameter block owns its values, a constancy flag and optional per-element box
//! bounds. Blocks are created through [`Problem`](crate::core::Problem), which hands out a
//! [`BlockHandle`] used to reference the block from residual blocks and accessors.

use std::fmt;

use nalgebra::DVector;

use crate::core::{CoreError, CoreResult};

/// Opaque reference to a parameter block registered in a [`Problem`](crate::core::Problem).
///
/// The handle records which problem created it, so passing it to another problem is
/// detected and reported as [`CoreError::UnknownHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub(crate) problem_id: u64,
    pub(crate) index: usize,
}

impl BlockHandle {
    /// Registration index of the block inside its problem
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.index)
    }
}

/// Per-element box constraints `lower[i] <= x[i] <= upper[i]`.
///
/// Unbounded sides use `f64::NEG_INFINITY` / `f64::INFINITY`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

impl Bounds {
    /// Create bounds from explicit lower and upper vectors.
    pub fn new(lower: &[f64], upper: &[f64]) -> CoreResult<Self> {
        if lower.len() != upper.len() {
            return Err(CoreError::Dimension(format!(
                "lower bound has {} entries but upper bound has {}",
                lower.len(),
                upper.len()
            ))
            .log());
        }
        let invalid = (0..lower.len())
            .find(|&i| lower[i].is_nan() || upper[i].is_nan() || lower[i] > upper[i]);
        if let Some(i) = invalid {
            return Err(CoreError::InvalidBounds(format!(
                "element {i}: lower bound {} exceeds upper bound {}",
                lower[i], upper[i]
            ))
            .log());
        }
        Ok(Self {
            lower: DVector::from_column_slice(lower),
            upper: DVector::from_column_slice(upper),
        })
    }

    /// Bounds that do not constrain any of `size` elements.
    pub fn unbounded(size: usize) -> Self {
        Self {
            lower: DVector::from_element(size, f64::NEG_INFINITY),
            upper: DVector::from_element(size, f64::INFINITY),
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    /// Whether every element of `values` lies inside the box.
    pub fn contains(&self, values: &DVector<f64>) -> bool {
        values
            .iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .all(|(v, (lo, hi))| *v >= *lo && *v <= *hi)
    }

    /// Clamp `values` in place onto the box.
    pub fn project(&self, values: &mut DVector<f64>) {
        for (i, v) in values.iter_mut().enumerate() {
            *v = v.clamp(self.lower[i], self.upper[i]);
        }
    }
}

/// One variable group of the optimization problem.
#[derive(Debug, Clone)]
pub struct ParameterBlock {
    values: DVector<f64>,
    constant: bool,
    bounds: Option<Bounds>,
}

impl ParameterBlock {
    pub(crate) fn new(values: &[f64], bounds: Option<Bounds>) -> CoreResult<Self> {
        if values.is_empty() {
            return Err(
                CoreError::Dimension("parameter block size must be positive".to_string()).log(),
            );
        }
        let values = DVector::from_column_slice(values);
        if let Some(bounds) = bounds.as_ref() {
            if bounds.len() != values.len() {
                return Err(CoreError::Dimension(format!(
                    "bounds have {} entries but the parameter block has {}",
                    bounds.len(),
                    values.len()
                ))
                .log());
            }
            if !bounds.contains(&values) {
                return Err(CoreError::InvalidBounds(
                    "initial parameter values lie outside the bounds".to_string(),
                )
                .log());
            }
        }
        Ok(Self {
            values,
            constant: false,
            bounds,
        })
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub(crate) fn set_values(&mut self, values: &DVector<f64>) {
        self.values.copy_from(values);
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub(crate) fn set_constant(&mut self, constant: bool) {
        self.constant = constant;
    }

    pub fn bounds(&self) -> Option<&Bounds> {
        self.bounds.as_ref()
    }

    /// Set one side of the bound for a single element, creating unbounded bounds first
    /// if the block had none.
    pub(crate) fn set_bound(&mut self, index: usize, value: f64, lower: bool) -> CoreResult<()> {
        let size = self.size();
        if index >= size {
            return Err(CoreError::Dimension(format!(
                "bound index {index} out of range for block of size {size}"
            ))
            .log());
        }
        let current_bounds = self.bounds.clone().unwrap_or_else(|| Bounds::unbounded(size));
        let (lo, hi) = if lower {
            (value, current_bounds.upper[index])
        } else {
            (current_bounds.lower[index], value)
        };
        if value.is_nan() || lo > hi {
            return Err(CoreError::InvalidBounds(format!(
                "element {index}: lower bound {lo} exceeds upper bound {hi}"
            ))
            .log());
        }
        let current = self.values[index];
        if current < lo || current > hi {
            return Err(CoreError::InvalidBounds(format!(
                "element {index}: current value {current} lies outside [{lo}, {hi}]"
            ))
            .log());
        }
        let bounds = self.bounds.get_or_insert(current_bounds);
        if lower {
            bounds.lower[index] = value;
        } else {
            bounds.upper[index] = value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_block_is_rejected() {
        let result = ParameterBlock::new(&[], None);
        assert!(matches!(result, Err(CoreError::Dimension(_))));
    }

    #[test]
    fn test_bounds_validation() {
        assert!(Bounds::new(&[0.0, 1.0], &[1.0]).is_err());
        assert!(matches!(
            Bounds::new(&[2.0], &[1.0]),
            Err(CoreError::InvalidBounds(_))
        ));
        assert!(Bounds::new(&[0.0, f64::NEG_INFINITY], &[1.0, 5.0]).is_ok());
    }

    #[test]
    fn test_initial_values_must_be_feasible() {
        let bounds = Bounds::new(&[0.0], &[1.0]).unwrap();
        let result = ParameterBlock::new(&[2.0], Some(bounds));
        assert!(matches!(result, Err(CoreError::InvalidBounds(_))));
    }

    #[test]
    fn test_project_clamps_to_box() {
        let bounds = Bounds::new(&[-1.0, 0.0], &[1.0, 10.0]).unwrap();
        let mut values = DVector::from_vec(vec![-3.0, 4.0]);
        bounds.project(&mut values);
        assert_eq!(values[0], -1.0);
        assert_eq!(values[1], 4.0);
    }

    #[test]
    fn test_set_bound_creates_unbounded_other_side() {
        let mut block = ParameterBlock::new(&[0.5, 0.5], None).unwrap();
        block.set_bound(1, 0.0, true).unwrap();
        let bounds = block.bounds().unwrap();
        assert_eq!(bounds.lower[1], 0.0);
        assert_eq!(bounds.upper[1], f64::INFINITY);
        assert_eq!(bounds.lower[0], f64::NEG_INFINITY);
        assert!(block.set_bound(1, -1.0, false).is_err());
        assert!(block.set_bound(5, 0.0, true).is_err());
    }
}
