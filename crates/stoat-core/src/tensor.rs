use std::sync::{Arc, RwLock};

use crate::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Tensor — an n-dimensional buffer on one device
//
// Stoat tensors are plain data: they do not track the operation that
// created them. Autodiff bookkeeping lives one level up, in WeightTensor
// and the ComputeGraph tape. This keeps the tensor layer reusable for
// things that never need gradients (corpus batches, masks, metrics).
//
// MEMORY MODEL:
//
//   Tensor        — cheap handle, Arc<TensorInner>
//   TensorInner   — layout + dtype + device + Arc<RwLock<Storage>>
//
// Views (reshape of contiguous data, transpose, narrow, expand) create a
// new TensorInner with a different layout over the SAME storage arc.
// Cloning a handle is O(1) and shares the inner.
//
// EXCLUSIVE OWNERSHIP:
//
//   A buffer may be mutated in place only when nothing else can observe
//   it: one handle, one storage reference. `is_exclusively_owned()` checks
//   exactly that (the spec's "exclusive owner may mutate" rule as a
//   refcount precondition instead of a runtime flag). Interior-mutable
//   writes that are part of the model's contract (optimizer updates,
//   gradient accumulation, sync_weights) go through the RwLock instead and
//   are visible to every view by design.

struct TensorInner<B: Backend> {
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
}

/// An n-dimensional array of numbers on a specific backend device.
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={:?})",
            self.shape(),
            self.dtype(),
            self.device()
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Constructors

    pub(crate) fn from_storage(storage: B::Storage, layout: Layout, device: B::Device) -> Self {
        let dtype = storage.dtype();
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
            }),
        }
    }

    /// A view over the same storage with a different layout.
    fn view_with_layout(&self, layout: Layout) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
            }),
        }
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    /// Token/label id tensor from u32 values.
    pub fn from_u32_slice(
        data: &[u32],
        shape: impl Into<Shape>,
        device: &B::Device,
    ) -> Result<Self> {
        let as_f64: Vec<f64> = data.iter().map(|&v| v as f64).collect();
        Self::from_f64_slice(&as_f64, shape, DType::U32, device)
    }

    pub fn rand_uniform(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    pub fn rand_normal(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// True when this handle is the only way to reach the buffer: no other
    /// handles share the inner, no views share the storage. Only then may
    /// an in-place kernel reuse the buffer.
    pub fn is_exclusively_owned(&self) -> bool {
        Arc::strong_count(&self.inner) == 1 && Arc::strong_count(&self.inner.storage) == 1
    }

    fn read_storage(&self) -> Result<std::sync::RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<std::sync::RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn check_same_device(&self, rhs: &Self) -> Result<()> {
        if self.device() != rhs.device() {
            return Err(Error::DeviceMismatch {
                lhs: self.device().name(),
                rhs: rhs.device().name(),
            });
        }
        Ok(())
    }

    fn check_same_dtype(&self, rhs: &Self) -> Result<()> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        Ok(())
    }

    // Readback

    /// Copy out as f64 in logical element order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    pub fn to_u32_vec(&self) -> Result<Vec<u32>> {
        Ok(self.to_f64_vec()?.iter().map(|&v| v as u32).collect())
    }

    /// Read a scalar tensor's single value.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.to_f64_vec()?[0])
    }

    // In-place writes through the lock
    //
    // These are the sanctioned mutation paths: every view of the storage
    // sees the new values. Used by the optimizer (parameter update),
    // sync_weights (replica refresh), and gradient accumulation.

    /// Overwrite the buffer with new values; shape and dtype unchanged.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        let expected = self.elem_count();
        if new_data.len() != expected {
            return Err(Error::msg(format!(
                "update_data_inplace: expected {} elements, got {}",
                expected,
                new_data.len()
            )));
        }
        let new_storage = B::from_f64_slice(new_data, self.dtype(), self.device())?;
        let mut guard = self.write_storage()?;
        *guard = new_storage;
        Ok(())
    }

    /// self += rhs (rhs broadcasts). Writes through self's layout, so a
    /// narrowed view accumulates into its slice of the parent buffer.
    pub fn add_assign(&self, rhs: &Self) -> Result<()> {
        self.check_same_device(rhs)?;
        self.check_same_dtype(rhs)?;
        let rhs_layout = if rhs.shape() == self.shape() {
            rhs.inner.layout.clone()
        } else {
            rhs.inner.layout.expand(self.shape())?
        };
        let rhs_guard = rhs.read_storage()?;
        let mut dst_guard = self.write_storage()?;
        B::binary_assign(
            BinaryOp::Add,
            &mut dst_guard,
            &self.inner.layout,
            &rhs_guard,
            &rhs_layout,
        )
    }

    /// self = self * mul + add.
    pub fn affine_assign(&self, mul: f64, add: f64) -> Result<()> {
        let mut guard = self.write_storage()?;
        B::affine_assign(&mut guard, &self.inner.layout, mul, add)
    }

    /// Overwrite self's elements with src's (strided copy). Shapes must
    /// match exactly.
    pub fn copy_from(&self, src: &Self) -> Result<()> {
        self.check_same_device(src)?;
        self.check_same_dtype(src)?;
        if self.shape() != src.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: src.shape().clone(),
            });
        }
        let src_guard = src.read_storage()?;
        let mut dst_guard = self.write_storage()?;
        B::copy_strided(&src_guard, &src.inner.layout, &mut dst_guard, &self.inner.layout)
    }

    // Views

    /// Reinterpret the shape; element count must be preserved. Contiguous
    /// tensors get a zero-copy view, others are copied first.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: self.elem_count(),
                got: shape.elem_count(),
                shape,
            });
        }
        if self.is_contiguous() {
            Ok(self.view_with_layout(Layout::contiguous(shape)))
        } else {
            let copied = self.contiguous()?;
            Ok(copied.view_with_layout(Layout::contiguous(shape)))
        }
    }

    /// Swap two dimensions without copying.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        Ok(self.view_with_layout(self.inner.layout.transpose(dim0, dim1)?))
    }

    /// Slice along one dimension without copying.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        Ok(self.view_with_layout(self.inner.layout.narrow(dim, start, len)?))
    }

    /// Broadcast to a larger shape without copying (stride-0 repetition).
    pub fn expand(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        Ok(self.view_with_layout(self.inner.layout.expand(&shape)?))
    }

    /// A contiguous tensor with the same values: self when already
    /// contiguous, otherwise a fresh row-major copy.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let mut dst = B::zeros(self.shape(), self.dtype(), self.device())?;
        let dst_layout = Layout::contiguous(self.shape().clone());
        {
            let src_guard = self.read_storage()?;
            B::copy_strided(&src_guard, &self.inner.layout, &mut dst, &dst_layout)?;
        }
        Ok(Self::from_storage(dst, dst_layout, self.device().clone()))
    }

    /// A deep copy with its own storage (always, even when contiguous).
    pub fn duplicate(&self) -> Result<Self> {
        let mut dst = B::zeros(self.shape(), self.dtype(), self.device())?;
        let dst_layout = Layout::contiguous(self.shape().clone());
        {
            let src_guard = self.read_storage()?;
            B::copy_strided(&src_guard, &self.inner.layout, &mut dst, &dst_layout)?;
        }
        Ok(Self::from_storage(dst, dst_layout, self.device().clone()))
    }

    // Element-wise math

    fn binary(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        self.check_same_device(rhs)?;
        self.check_same_dtype(rhs)?;
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let lhs_layout = if self.shape() == &out_shape {
            self.inner.layout.clone()
        } else {
            self.inner.layout.expand(&out_shape)?
        };
        let rhs_layout = if rhs.shape() == &out_shape {
            rhs.inner.layout.clone()
        } else {
            rhs.inner.layout.expand(&out_shape)?
        };
        let lhs_guard = self.read_storage()?;
        let rhs_guard = rhs.read_storage()?;
        let storage = B::binary_op(op, &lhs_guard, &lhs_layout, &rhs_guard, &rhs_layout)?;
        drop(lhs_guard);
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(out_shape),
            self.device().clone(),
        ))
    }

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary(rhs, BinaryOp::Mul)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary(rhs, BinaryOp::Div)
    }

    fn unary(&self, op: UnaryOp) -> Result<Self> {
        let guard = self.read_storage()?;
        let storage = B::unary_op(op, &guard, &self.inner.layout)?;
        drop(guard);
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.device().clone(),
        ))
    }

    pub fn neg(&self) -> Result<Self> {
        self.unary(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Self> {
        self.unary(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn relu(&self) -> Result<Self> {
        self.unary(UnaryOp::Relu)
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.unary(UnaryOp::Sigmoid)
    }

    pub fn tanh(&self) -> Result<Self> {
        self.unary(UnaryOp::Tanh)
    }

    pub fn square(&self) -> Result<Self> {
        self.unary(UnaryOp::Square)
    }

    /// self * mul + add, element-wise, into a fresh tensor.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let guard = self.read_storage()?;
        let storage = B::affine(&guard, &self.inner.layout, mul, add)?;
        drop(guard);
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.device().clone(),
        ))
    }

    fn cmp(&self, rhs: &Self, op: CmpOp) -> Result<Self> {
        self.check_same_device(rhs)?;
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let lhs_layout = if self.shape() == &out_shape {
            self.inner.layout.clone()
        } else {
            self.inner.layout.expand(&out_shape)?
        };
        let rhs_layout = if rhs.shape() == &out_shape {
            rhs.inner.layout.clone()
        } else {
            rhs.inner.layout.expand(&out_shape)?
        };
        let lhs_guard = self.read_storage()?;
        let rhs_guard = rhs.read_storage()?;
        let storage = B::cmp_op(op, &lhs_guard, &lhs_layout, &rhs_guard, &rhs_layout)?;
        drop(lhs_guard);
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(out_shape),
            self.device().clone(),
        ))
    }

    /// Element-wise ==, as a U32 0/1 mask.
    pub fn eq_mask(&self, rhs: &Self) -> Result<Self> {
        self.cmp(rhs, CmpOp::Eq)
    }

    /// Element-wise >=, as a U32 0/1 mask.
    pub fn ge_mask(&self, rhs: &Self) -> Result<Self> {
        self.cmp(rhs, CmpOp::Ge)
    }

    /// Element-wise <, as a U32 0/1 mask.
    pub fn lt_mask(&self, rhs: &Self) -> Result<Self> {
        self.cmp(rhs, CmpOp::Lt)
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if dtype == self.dtype() {
            return Ok(self.clone());
        }
        let guard = self.read_storage()?;
        let storage = B::to_dtype(&guard, &self.inner.layout, dtype, self.device())?;
        drop(guard);
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.device().clone(),
        ))
    }

    // Reductions

    /// Sum/max one dimension away; `keep_dim` leaves a size-1 dim behind.
    fn reduce(&self, op: ReduceOp, dim: usize, keep_dim: bool) -> Result<Self> {
        let guard = self.read_storage()?;
        let storage = B::reduce_op(op, &guard, &self.inner.layout, dim)?;
        drop(guard);
        let shape = if keep_dim {
            self.shape().with_unit_dim(dim)?
        } else {
            self.shape().without_dim(dim)?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            self.device().clone(),
        ))
    }

    pub fn sum_dim(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce(ReduceOp::Sum, dim, keep_dim)
    }

    pub fn max_dim(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce(ReduceOp::Max, dim, keep_dim)
    }

    /// Sum of every element, as a scalar tensor.
    pub fn sum_all(&self) -> Result<Self> {
        let mut acc = self.clone();
        while acc.rank() > 0 {
            acc = acc.sum_dim(0, false)?;
        }
        Ok(acc)
    }

    /// Mean of every element, as a scalar tensor.
    pub fn mean_all(&self) -> Result<Self> {
        let n = self.elem_count() as f64;
        self.sum_all()?.affine(1.0 / n, 0.0)
    }

    /// Reduce by summation down to `target` (the reverse of broadcasting):
    /// extra leading dims are summed away, and dims that are 1 in the
    /// target are summed keeping the unit dim. Used to route gradients
    /// back through broadcast operands (e.g. a bias that was expanded over
    /// the batch).
    pub fn sum_to_shape(&self, target: &Shape) -> Result<Self> {
        let mut acc = self.clone();
        while acc.rank() > target.rank() {
            acc = acc.sum_dim(0, false)?;
        }
        for d in 0..target.rank() {
            if target.dims()[d] == 1 && acc.dims()[d] != 1 {
                acc = acc.sum_dim(d, true)?;
            }
        }
        if acc.shape() != target {
            return Err(Error::ShapeMismatch {
                expected: target.clone(),
                got: acc.shape().clone(),
            });
        }
        Ok(acc)
    }

    /// Index of the max along the last dimension, as a U32 tensor with the
    /// last dim removed.
    pub fn argmax_last_dim(&self) -> Result<Self> {
        if self.rank() == 0 {
            return Err(Error::DimOutOfRange { dim: 0, rank: 0 });
        }
        let guard = self.read_storage()?;
        let storage = B::argmax_last_dim(&guard, &self.inner.layout)?;
        drop(guard);
        let shape = self.shape().without_dim(self.rank() - 1)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            self.device().clone(),
        ))
    }

    // Matmul

    /// Matrix multiply. Accepts [m,k]@[k,n] or batched [b,m,k]@[b,k,n];
    /// operands are made contiguous as needed.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        self.check_same_device(rhs)?;
        self.check_same_dtype(rhs)?;
        let (lhs, rhs_c) = (self.contiguous()?, rhs.contiguous()?);
        let (b, m, k, n, out_shape) = match (lhs.rank(), rhs_c.rank()) {
            (2, 2) => {
                let (m, k1) = (lhs.dims()[0], lhs.dims()[1]);
                let (k2, n) = (rhs_c.dims()[0], rhs_c.dims()[1]);
                if k1 != k2 {
                    return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
                }
                (1, m, k1, n, Shape::from((m, n)))
            }
            (3, 3) => {
                let (b1, m, k1) = (lhs.dims()[0], lhs.dims()[1], lhs.dims()[2]);
                let (b2, k2, n) = (rhs_c.dims()[0], rhs_c.dims()[1], rhs_c.dims()[2]);
                if b1 != b2 || k1 != k2 {
                    return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
                }
                (b1, m, k1, n, Shape::from((b1, m, n)))
            }
            _ => {
                return Err(Error::msg(format!(
                    "matmul expects rank 2 or rank 3 operands, got {} and {}",
                    lhs.rank(),
                    rhs_c.rank()
                )))
            }
        };
        let lhs_guard = lhs.read_storage()?;
        let rhs_guard = rhs_c.read_storage()?;
        let storage = B::matmul(&lhs_guard, &rhs_guard, (b, m, n, k), self.device())?;
        drop(lhs_guard);
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(out_shape),
            self.device().clone(),
        ))
    }

    // Index ops

    /// Row lookup: self is a [rows, cols] table, ids is a U32 id tensor of
    /// shape [n]; result is [n, cols]. The embedding forward.
    pub fn index_select(&self, ids: &Self) -> Result<Self> {
        self.check_same_device(ids)?;
        if ids.dtype() != DType::U32 {
            return Err(Error::DTypeMismatch {
                expected: DType::U32,
                got: ids.dtype(),
            });
        }
        if self.rank() != 2 || ids.rank() != 1 {
            return Err(Error::msg(format!(
                "index_select expects a [rows, cols] table and [n] ids, got {} and {}",
                self.shape(),
                ids.shape()
            )));
        }
        let table = self.contiguous()?;
        let table_guard = table.read_storage()?;
        let ids_guard = ids.read_storage()?;
        let storage = B::index_select(
            &table_guard,
            &table.inner.layout,
            &ids_guard,
            &ids.inner.layout,
        )?;
        drop(table_guard);
        let shape = Shape::from((ids.dims()[0], self.dims()[1]));
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            self.device().clone(),
        ))
    }

    /// Scatter-add rows: self[ids[i]] += src[i]. The embedding backward;
    /// repeated ids accumulate additively.
    pub fn index_add(&self, ids: &Self, src: &Self) -> Result<()> {
        self.check_same_device(ids)?;
        self.check_same_device(src)?;
        let ids_guard = ids.read_storage()?;
        let src_guard = src.read_storage()?;
        let mut dst_guard = self.write_storage()?;
        B::index_add(
            &mut dst_guard,
            &self.inner.layout,
            &ids_guard,
            &ids.inner.layout,
            &src_guard,
            &src.inner.layout,
        )
    }
}

#[cfg(test)]
mod tests {
    // Tensor math is covered against the CPU backend in stoat-cpu; the
    // layout/view logic has its own tests in layout.rs.
}
