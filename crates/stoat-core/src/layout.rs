use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — shape + strides + offset
//
// The layout decouples a tensor's logical shape from how its elements sit in
// flat storage, which is what makes transpose, narrow, and expand free:
// they produce a new layout over the same storage.
//
//   transpose: swap two entries of (dims, strides)
//   narrow:    shrink one dim, bump the offset by start * stride
//   expand:    grow a size-1 dim, setting its stride to 0
//
// A layout is contiguous when its strides are the row-major defaults and the
// offset is 0; kernels take a fast path on contiguous inputs and fall back
// to strided iteration otherwise.

/// Describes how a tensor's logical shape maps onto flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Contiguous (row-major) layout for a shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Layout with explicit strides and offset, for views.
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Swap two dimensions. No data movement.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut dims = self.shape.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// Slice `len` entries of dimension `dim` starting at `start`.
    /// Same storage; the offset absorbs the start.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let dim_size = self.shape.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut dims = self.shape.dims().to_vec();
        dims[dim] = len;
        Ok(Layout::new(
            Shape::new(dims),
            self.strides.clone(),
            self.offset + start * self.strides[dim],
        ))
    }

    /// Broadcast this layout to a larger shape: size-1 dims repeat (stride
    /// 0), missing leading dims repeat the whole tensor.
    pub fn expand(&self, target: &Shape) -> Result<Layout> {
        if !self.shape.broadcasts_to(target) {
            return Err(Error::ShapeMismatch {
                expected: target.clone(),
                got: self.shape.clone(),
            });
        }
        let offset_rank = target.rank() - self.rank();
        let mut strides = vec![0usize; target.rank()];
        for i in 0..self.rank() {
            if self.shape.dims()[i] == target.dims()[i + offset_rank] {
                strides[i + offset_rank] = self.strides[i];
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Flat storage index of a multi-dimensional index:
    /// offset + Σ index[i] * stride[i].
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Iterate the flat storage indices of every element in logical order.
    /// Contiguous layouts count 0,1,2,…; views jump following the strides.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Iterator yielding the flat storage index of each element of a layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        let mut idx = self.offset;
        for i in 0..self.current.len() {
            idx += self.current[i] * self.strides[i];
        }
        idx
    }

    /// Odometer step, rightmost dimension fastest.
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_counts_upward() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        let idx: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(idx, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn transpose_is_a_view() {
        let t = Layout::contiguous(Shape::from((2, 3))).transpose(0, 1).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        assert_eq!(t.strides(), &[1, 3]);
        assert!(!t.is_contiguous());
        let idx: Vec<usize> = t.strided_indices().collect();
        assert_eq!(idx, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn narrow_moves_offset() {
        let n = Layout::contiguous(Shape::from((4, 6))).narrow(1, 2, 3).unwrap();
        assert_eq!(n.dims(), &[4, 3]);
        assert_eq!(n.offset(), 2);
        assert_eq!(n.strides(), &[6, 1]);
        assert!(Layout::contiguous(Shape::from((4, 6))).narrow(1, 5, 3).is_err());
    }

    #[test]
    fn expand_repeats_with_stride_zero() {
        let e = Layout::contiguous(Shape::from((1, 4)))
            .expand(&Shape::from((3, 4)))
            .unwrap();
        assert_eq!(e.dims(), &[3, 4]);
        assert_eq!(e.strides(), &[0, 1]);
        let idx: Vec<usize> = e.strided_indices().collect();
        assert_eq!(idx, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3]);
    }
}
