use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Error, Result};

pub type Dims = SmallVec<[usize; 4]>;

/// Static tensor extents in row-major order. A rank-0 shape is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: Dims,
}

impl Shape {
    pub fn new<D: AsRef<[usize]>>(dims: D) -> Self {
        Shape {
            dims: Dims::from_slice(dims.as_ref()),
        }
    }

    pub fn scalar() -> Self {
        Shape::default()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Element count, or `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    pub fn element_count_or_error(&self) -> Result<usize> {
        self.element_count()
            .ok_or_else(|| Error::config(format!("element count overflow for shape {self}")))
    }

    pub fn byte_len(&self, element_size: usize) -> Result<usize> {
        self.element_count_or_error()?
            .checked_mul(element_size)
            .ok_or_else(|| Error::config(format!("byte length overflow for shape {self}")))
    }

    /// Row-major contiguous strides in elements.
    pub fn contiguous_strides(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.dims.len()];
        let mut stride = 1usize;
        for (idx, dim) in self.dims.iter().enumerate().rev() {
            strides[idx] = stride;
            stride = stride.saturating_mul(*dim);
        }
        strides
    }

    /// Numpy-style broadcast of two shapes, `None` when incompatible.
    pub fn broadcast(&self, other: &Shape) -> Option<Shape> {
        let rank = self.rank().max(other.rank());
        let mut dims = Dims::with_capacity(rank);
        for axis in 0..rank {
            let lhs = aligned_dim(self, rank, axis);
            let rhs = aligned_dim(other, rank, axis);
            let dim = match (lhs, rhs) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => return None,
            };
            dims.push(dim);
        }
        Some(Shape { dims })
    }

    /// True when this shape broadcasts to `target` without changing `target`.
    pub fn broadcasts_to(&self, target: &Shape) -> bool {
        self.rank() <= target.rank() && self.broadcast(target).as_ref() == Some(target)
    }

    /// Strides of this shape re-indexed against the broadcast `target` shape:
    /// one entry per target axis, zero on axes that are broadcast.
    pub fn broadcast_strides(&self, target: &Shape) -> Result<Vec<usize>> {
        if !self.broadcasts_to(target) {
            return Err(Error::config(format!(
                "shape {self} does not broadcast to {target}"
            )));
        }
        let own = self.contiguous_strides();
        let offset = target.rank() - self.rank();
        let strides = (0..target.rank())
            .map(|axis| {
                if axis < offset {
                    return 0;
                }
                let local = axis - offset;
                if self.dims[local] == 1 && target.dims[axis] != 1 {
                    0
                } else {
                    own[local]
                }
            })
            .collect();
        Ok(strides)
    }

    pub fn normalize_axis(&self, axis: isize) -> Result<usize> {
        normalize_axis(axis, self.rank())
    }
}

fn aligned_dim(shape: &Shape, rank: usize, axis: usize) -> usize {
    let offset = rank - shape.rank();
    if axis < offset {
        1
    } else {
        shape.dims[axis - offset]
    }
}

/// Maps a possibly negative axis into `0..rank`.
pub fn normalize_axis(axis: isize, rank: usize) -> Result<usize> {
    let rank_i = rank as isize;
    let normalized = if axis < 0 { axis + rank_i } else { axis };
    if normalized < 0 || normalized >= rank_i {
        return Err(Error::config(format!(
            "axis {axis} out of range for rank {rank}"
        )));
    }
    Ok(normalized as usize)
}

/// Offset of `linear` (row-major index into `out_dims`) inside a tensor whose
/// strides were produced by [`Shape::broadcast_strides`].
pub fn broadcast_offset(linear: usize, out_dims: &[usize], strides: &[usize]) -> usize {
    let mut rem = linear;
    let mut offset = 0usize;
    for axis in (0..out_dims.len()).rev() {
        let dim = out_dims[axis];
        if dim == 0 {
            return 0;
        }
        offset += (rem % dim) * strides[axis];
        rem /= dim;
    }
    offset
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_aligns_trailing_axes() {
        let a = Shape::new([4, 1, 3]);
        let b = Shape::new([5, 1]);
        assert_eq!(a.broadcast(&b), Some(Shape::new([4, 5, 3])));
        assert_eq!(Shape::new([2, 3]).broadcast(&Shape::new([4, 3])), None);
    }

    #[test]
    fn broadcast_strides_zero_on_expanded_axes() {
        let target = Shape::new([2, 3, 4]);
        let strides = Shape::new([3, 1]).broadcast_strides(&target).unwrap();
        assert_eq!(strides, vec![0, 1, 0]);
        assert_eq!(broadcast_offset(23, target.dims(), &strides), 2);
    }

    #[test]
    fn broadcast_offset_matches_coordinate_walk() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..64 {
            let rank = rng.gen_range(1..=4);
            let target: Vec<usize> = (0..rank).map(|_| rng.gen_range(1..=4)).collect();
            let keep = rng.gen_range(0..=rank);
            let source: Vec<usize> = target[rank - keep..]
                .iter()
                .map(|&dim| if rng.gen_bool(0.4) { 1 } else { dim })
                .collect();
            let source_shape = Shape::new(&source);
            let strides = source_shape.broadcast_strides(&Shape::new(&target)).unwrap();
            let own = source_shape.contiguous_strides();

            let total: usize = target.iter().product();
            for linear in 0..total {
                let mut coords = vec![0usize; rank];
                let mut rem = linear;
                for axis in (0..rank).rev() {
                    coords[axis] = rem % target[axis];
                    rem /= target[axis];
                }
                let expected: usize = (0..keep)
                    .map(|local| {
                        let coord = coords[rank - keep + local];
                        if source[local] == 1 { 0 } else { coord * own[local] }
                    })
                    .sum();
                assert_eq!(
                    broadcast_offset(linear, &target, &strides),
                    expected,
                    "source {source:?} target {target:?} index {linear}"
                );
            }
        }
    }

    #[test]
    fn negative_axis_wraps_and_out_of_range_fails() {
        assert_eq!(normalize_axis(-1, 3).unwrap(), 2);
        assert!(normalize_axis(3, 3).is_err());
        assert!(normalize_axis(-4, 3).is_err());
    }
}
