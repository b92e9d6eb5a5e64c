//! Lightweight wrapper for tensor shapes and dimension bookkeeping.

use smallvec::SmallVec;

/// Upper bound on tensor rank accepted by descriptors.
pub const MAX_RANK: usize = 8;

/// Stores the dimensions of a tensor buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 6]>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    ///
    /// Panics if `dims` is empty or exceeds [`MAX_RANK`]; use [`Shape::try_new`] for
    /// caller-provided dimensions.
    pub fn new<D: AsRef<[usize]>>(dims: D) -> Self {
        match Self::try_new(dims) {
            Some(shape) => shape,
            None => panic!("shape rank must be within 1..={MAX_RANK}"),
        }
    }

    pub fn try_new<D: AsRef<[usize]>>(dims: D) -> Option<Self> {
        let dims = dims.as_ref();
        if dims.is_empty() || dims.len() > MAX_RANK {
            return None;
        }
        Some(Shape {
            dims: SmallVec::from_slice(dims),
        })
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Size of axis 1, the channel axis for channel-first layouts.
    pub fn channels(&self) -> Option<usize> {
        self.dims.get(1).copied()
    }

    /// Product of all axes after `axis`.
    pub fn inner_size(&self, axis: usize) -> usize {
        self.dims.iter().skip(axis + 1).product()
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
