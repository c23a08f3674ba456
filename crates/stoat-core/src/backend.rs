use std::fmt;

use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;

// Backend — the kernel interface Stoat's graph layer is written against
//
// The graph and the trainer never touch raw buffers; every numeric kernel
// goes through this trait. A backend supplies a Device type (which carries
// the allocator/budget) and a Storage type (the flat buffer), plus the
// element-wise, reduction, matmul, and index kernels the tagger needs.
//
// Keeping the kernels behind a trait means the autodiff tape and the
// multi-device orchestration are testable with the CPU backend alone, and a
// GPU backend can be added as a separate crate without touching stoat-core.

/// Identifies one compute device (e.g. "cpu:0", "cpu:1").
///
/// Devices compare by identity: two tensors may only meet in an operation
/// when their devices are equal. The device owns the allocation budget, so
/// there are no global allocator tables.
pub trait BackendDevice: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Human-readable name, used in logs and error messages.
    fn name(&self) -> String;
}

/// A flat buffer of tensor data living on one device.
pub trait BackendStorage: Send + Sync + 'static {
    fn dtype(&self) -> DType;

    /// Number of elements in the buffer.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Kernel op enums
//
// The enums parameterize the backend entry points (one trait method per
// category) and are also what the tape records: knowing which binary op ran
// forward determines the gradient rule to replay backward.

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Exp,
    Log,
    Sqrt,
    Relu,
    Sigmoid,
    Tanh,
    Square,
}

/// Reductions along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// Comparisons; produce a U32 mask of 0/1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ge,
    Lt,
}

/// The compute backend: allocation plus the kernel set.
///
/// All kernels take storage + layout; the layout encodes strides and
/// offsets, so views and broadcast operands need no copies. Kernels
/// allocate their outputs on the same device as their inputs and fail with
/// `Error::OutOfMemory` when the device's budget is exhausted.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    // Allocation

    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Build storage from a flat f64 slice, converting to the target dtype.
    /// f64 is the interchange type: it represents every f32 and u32 exactly.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Uniform values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Normal values (mean 0, std 1).
    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    // Readback

    /// Copy out as f64, honoring strides (logical element order).
    fn to_f64_vec(storage: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    // Element-wise kernels

    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// In-place binary: dst[i] = op(dst[i], rhs[i]). The caller must hold
    /// the only reference to `dst` (exclusive ownership is checked a level
    /// above, in `Tensor`).
    fn binary_assign(
        op: BinaryOp,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<()>;

    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// In-place unary: dst[i] = op(dst[i]).
    fn unary_assign(op: UnaryOp, dst: &mut Self::Storage, dst_layout: &Layout) -> Result<()>;

    /// result = input * mul + add, element-wise.
    fn affine(input: &Self::Storage, layout: &Layout, mul: f64, add: f64)
        -> Result<Self::Storage>;

    /// In-place affine: dst = dst * mul + add.
    fn affine_assign(dst: &mut Self::Storage, dst_layout: &Layout, mul: f64, add: f64)
        -> Result<()>;

    fn cmp_op(
        op: CmpOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// Convert between dtypes (e.g. a U32 mask to F32 for multiplication).
    fn to_dtype(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage>;

    // Reductions

    /// Reduce one dimension away; output shape is the input shape without
    /// `dim`.
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dim: usize,
    ) -> Result<Self::Storage>;

    /// Index of the maximum along the last dimension, as U32.
    fn argmax_last_dim(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    // Matmul

    /// Batched matrix multiply: [b, m, k] @ [b, k, n] → [b, m, n].
    /// Plain 2-D matmul is the b == 1 case. Inputs must be contiguous;
    /// `bmnk` is (batch, m, n, k).
    fn matmul(
        lhs: &Self::Storage,
        rhs: &Self::Storage,
        bmnk: (usize, usize, usize, usize),
        device: &Self::Device,
    ) -> Result<Self::Storage>;

    // Index kernels (embedding lookup and its gradient)

    /// Select rows of a [rows, cols] table: out[i] = input[ids[i]].
    fn index_select(
        input: &Self::Storage,
        layout: &Layout,
        ids: &Self::Storage,
        ids_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// Scatter-add rows: dst[ids[i]] += src[i]. The gradient of
    /// `index_select`; repeated ids accumulate.
    fn index_add(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        ids: &Self::Storage,
        ids_layout: &Layout,
        src: &Self::Storage,
        src_layout: &Layout,
    ) -> Result<()>;

    // Data movement

    /// Strided copy: write every logical element of src into the
    /// corresponding position of dst. Shapes must match; either side may be
    /// a view. Used by contiguous(), concat, and narrow's backward.
    fn copy_strided(
        src: &Self::Storage,
        src_layout: &Layout,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
    ) -> Result<()>;
}
