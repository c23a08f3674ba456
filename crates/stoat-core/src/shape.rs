use std::fmt;

// Shape — N-dimensional extent of a tensor
//
// The shape drives three things: the element count (product of dims), the
// default row-major strides, and operand compatibility (broadcasting).
// Sequence tensors in Stoat are conventionally [batch, seq_len, features];
// a scalar loss has shape [].

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// Scalar shape (rank 0, one element).
    pub fn scalar() -> Self {
        Shape(vec![])
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar has 1.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }

    /// Row-major (C-order) strides: the last dimension is contiguous.
    ///
    /// For [2, 3, 4] the strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of one dimension, or `DimOutOfRange`.
    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0.get(d).copied().ok_or(crate::Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// Shape with dimension `d` removed (for single-dim reductions).
    pub fn without_dim(&self, d: usize) -> crate::Result<Shape> {
        if d >= self.rank() {
            return Err(crate::Error::DimOutOfRange {
                dim: d,
                rank: self.rank(),
            });
        }
        let mut dims = self.0.clone();
        dims.remove(d);
        Ok(Shape(dims))
    }

    /// Shape with dimension `d` kept as size 1 (keepdim reductions).
    pub fn with_unit_dim(&self, d: usize) -> crate::Result<Shape> {
        if d >= self.rank() {
            return Err(crate::Error::DimOutOfRange {
                dim: d,
                rank: self.rank(),
            });
        }
        let mut dims = self.0.clone();
        dims[d] = 1;
        Ok(Shape(dims))
    }

    // Broadcasting
    //
    // NumPy rules: align from the right, dims are compatible when equal or
    // one of them is 1, missing leading dims count as 1.

    /// Broadcast output shape of two operand shapes, or an error when they
    /// are incompatible.
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> crate::Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut out = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };
            if ld == rd {
                out.push(ld);
            } else if ld == 1 {
                out.push(rd);
            } else if rd == 1 {
                out.push(ld);
            } else {
                return Err(crate::Error::msg(format!(
                    "shapes {lhs} and {rhs} are not broadcast-compatible (dim {i} from right: {ld} vs {rd})"
                )));
            }
        }
        out.reverse();
        Ok(Shape(out))
    }

    /// Whether `self` broadcasts to `target` (right-aligned, 1s expand).
    pub fn broadcasts_to(&self, target: &Shape) -> bool {
        if self.rank() > target.rank() {
            return false;
        }
        let offset = target.rank() - self.rank();
        self.0
            .iter()
            .enumerate()
            .all(|(i, &d)| d == 1 || d == target.dims()[i + offset])
    }

    /// Strides for reading `self` as if it had `target` shape: broadcast
    /// dimensions (size 1 here, larger there) and missing leading dims get
    /// stride 0, repeating the single element.
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let own = self.stride_contiguous();
        let offset = target.rank() - self.rank();
        let mut out = vec![0usize; target.rank()];
        for i in 0..self.rank() {
            if self.0[i] == target.dims()[i + offset] {
                out[i + offset] = own[i];
            }
            // else: self dim is 1 → stride stays 0
        }
        out
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar() {
        let s = Shape::scalar();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert!(s.stride_contiguous().is_empty());
    }

    #[test]
    fn row_major_strides() {
        assert_eq!(Shape::from((2, 3)).stride_contiguous(), vec![3, 1]);
        assert_eq!(Shape::from((2, 3, 4)).stride_contiguous(), vec![12, 4, 1]);
    }

    #[test]
    fn broadcast_bias_over_batch() {
        // The common case: bias [4] over activations [2, 4].
        let out = Shape::broadcast_shape(&Shape::from((2, 4)), &Shape::from(4)).unwrap();
        assert_eq!(out.dims(), &[2, 4]);
        assert_eq!(
            Shape::from(4).broadcast_strides(&Shape::from((2, 4))),
            vec![0, 1]
        );
    }

    #[test]
    fn broadcast_incompatible() {
        assert!(Shape::broadcast_shape(&Shape::from(3), &Shape::from(4)).is_err());
    }

    #[test]
    fn reduced_shapes() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.without_dim(1).unwrap().dims(), &[2, 4]);
        assert_eq!(s.with_unit_dim(2).unwrap().dims(), &[2, 3, 1]);
    }
}
