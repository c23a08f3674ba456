//! # stoat-cpu
//!
//! CPU backend for Stoat. Storage is a dtype-tagged `Vec`; kernels honor
//! arbitrary strides through `Layout`, with contiguous fast paths
//! parallelized by rayon and matmul delegated to `matrixmultiply`.
//!
//! Devices are cheap handles: `CpuDevice::new(i)` is worker `i`. A device
//! may carry a [`MemoryBudget`]; every allocation reserves its bytes and
//! releases them when the storage drops, so an over-large batch fails with
//! `Error::OutOfMemory` instead of thrashing the host.

use std::sync::Arc;

use rand::Rng;
use rayon::prelude::*;

use stoat_core::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp};
use stoat_core::{DType, Error, Layout, Result, Shape, Tensor};

mod budget;

pub use budget::MemoryBudget;

/// Below this element count, parallel dispatch costs more than it saves.
const PAR_THRESHOLD: usize = 32 * 1024;

// Device

/// One CPU worker slot, identified by index.
#[derive(Debug, Clone)]
pub struct CpuDevice {
    index: usize,
    budget: Option<Arc<MemoryBudget>>,
}

impl CpuDevice {
    pub fn new(index: usize) -> Self {
        CpuDevice {
            index,
            budget: None,
        }
    }

    /// A device whose allocations are capped at `limit` bytes.
    pub fn with_budget(index: usize, limit: usize) -> Self {
        CpuDevice {
            index,
            budget: Some(MemoryBudget::new(format!("cpu:{index}"), limit)),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn budget(&self) -> Option<&Arc<MemoryBudget>> {
        self.budget.as_ref()
    }
}

impl PartialEq for CpuDevice {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        format!("cpu:{}", self.index)
    }
}

// Storage

#[derive(Debug)]
enum Data {
    F32(Vec<f32>),
    F64(Vec<f64>),
    U32(Vec<u32>),
}

impl Data {
    fn len(&self) -> usize {
        match self {
            Data::F32(v) => v.len(),
            Data::F64(v) => v.len(),
            Data::U32(v) => v.len(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            Data::F32(_) => DType::F32,
            Data::F64(_) => DType::F64,
            Data::U32(_) => DType::U32,
        }
    }
}

/// Flat CPU buffer plus its budget reservation.
#[derive(Debug)]
pub struct CpuStorage {
    data: Data,
    budget: Option<Arc<MemoryBudget>>,
    bytes: usize,
}

impl CpuStorage {
    /// Reserve the bytes for `len` elements of `dtype` against the budget,
    /// then build the storage with `fill`. Reservation happens first so an
    /// over-budget request fails before any allocation.
    fn build(
        dtype: DType,
        len: usize,
        budget: Option<Arc<MemoryBudget>>,
        fill: impl FnOnce() -> Data,
    ) -> Result<Self> {
        let bytes = len * dtype.size_in_bytes();
        if let Some(b) = &budget {
            b.reserve(bytes)?;
        }
        Ok(CpuStorage {
            data: fill(),
            budget,
            bytes,
        })
    }

    fn f32(&self) -> Result<&[f32]> {
        match &self.data {
            Data::F32(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: other.dtype(),
            }),
        }
    }

    fn f64(&self) -> Result<&[f64]> {
        match &self.data {
            Data::F64(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F64,
                got: other.dtype(),
            }),
        }
    }

    fn u32(&self) -> Result<&[u32]> {
        match &self.data {
            Data::U32(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::U32,
                got: other.dtype(),
            }),
        }
    }
}

impl Drop for CpuStorage {
    fn drop(&mut self) {
        if let Some(b) = &self.budget {
            b.release(self.bytes);
        }
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        self.data.dtype()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

// Generic kernels over one element type

fn zip_map<T: Copy + Send + Sync>(
    a: &[T],
    la: &Layout,
    b: &[T],
    lb: &Layout,
    f: impl Fn(T, T) -> T + Send + Sync,
) -> Vec<T> {
    if la.is_contiguous() && lb.is_contiguous() {
        let n = la.elem_count();
        let (a, b) = (&a[..n], &b[..n]);
        if n >= PAR_THRESHOLD {
            return a
                .par_iter()
                .zip(b.par_iter())
                .map(|(&x, &y)| f(x, y))
                .collect();
        }
        return a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect();
    }
    la.strided_indices()
        .zip(lb.strided_indices())
        .map(|(i, j)| f(a[i], b[j]))
        .collect()
}

fn zip_assign<T: Copy>(
    dst: &mut [T],
    ld: &Layout,
    rhs: &[T],
    lr: &Layout,
    f: impl Fn(T, T) -> T,
) {
    for (di, ri) in ld.strided_indices().zip(lr.strided_indices()) {
        dst[di] = f(dst[di], rhs[ri]);
    }
}

fn map<T: Copy + Send + Sync>(a: &[T], la: &Layout, f: impl Fn(T) -> T + Send + Sync) -> Vec<T> {
    if la.is_contiguous() {
        let n = la.elem_count();
        let a = &a[..n];
        if n >= PAR_THRESHOLD {
            return a.par_iter().map(|&x| f(x)).collect();
        }
        return a.iter().map(|&x| f(x)).collect();
    }
    la.strided_indices().map(|i| f(a[i])).collect()
}

fn map_assign<T: Copy>(dst: &mut [T], ld: &Layout, f: impl Fn(T) -> T) {
    for i in ld.strided_indices() {
        dst[i] = f(dst[i]);
    }
}

fn binary_fn<T>(op: BinaryOp) -> fn(T, T) -> T
where
    T: Copy
        + std::ops::Add<Output = T>
        + std::ops::Sub<Output = T>
        + std::ops::Mul<Output = T>
        + std::ops::Div<Output = T>,
{
    match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::Div => |a, b| a / b,
    }
}

fn unary_f64(op: UnaryOp) -> fn(f64) -> f64 {
    match op {
        UnaryOp::Neg => |x| -x,
        UnaryOp::Exp => f64::exp,
        UnaryOp::Log => f64::ln,
        UnaryOp::Sqrt => f64::sqrt,
        UnaryOp::Relu => |x| if x > 0.0 { x } else { 0.0 },
        UnaryOp::Sigmoid => |x| 1.0 / (1.0 + (-x).exp()),
        UnaryOp::Tanh => f64::tanh,
        UnaryOp::Square => |x| x * x,
    }
}

fn unary_f32(op: UnaryOp) -> fn(f32) -> f32 {
    match op {
        UnaryOp::Neg => |x| -x,
        UnaryOp::Exp => f32::exp,
        UnaryOp::Log => f32::ln,
        UnaryOp::Sqrt => f32::sqrt,
        UnaryOp::Relu => |x| if x > 0.0 { x } else { 0.0 },
        UnaryOp::Sigmoid => |x| 1.0 / (1.0 + (-x).exp()),
        UnaryOp::Tanh => f32::tanh,
        UnaryOp::Square => |x| x * x,
    }
}

/// Reduce one dimension away. `init` seeds the accumulator, `fold` merges.
fn reduce_dim<T: Copy>(
    input: &[T],
    layout: &Layout,
    dim: usize,
    init: T,
    fold: impl Fn(T, T) -> T,
) -> Vec<T> {
    let dims = layout.dims();
    let out_len = layout.elem_count() / dims[dim].max(1);
    let mut out = vec![init; out_len];

    // Walk the input in logical order, tracking the multi-index; the
    // output slot is the flat row-major index with `dim` removed.
    let rank = dims.len();
    let mut idx = vec![0usize; rank];
    for flat in layout.strided_indices() {
        let mut o = 0usize;
        for d in 0..rank {
            if d != dim {
                o = o * dims[d] + idx[d];
            }
        }
        out[o] = fold(out[o], input[flat]);
        // odometer advance, rightmost fastest
        for d in (0..rank).rev() {
            idx[d] += 1;
            if idx[d] < dims[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    out
}

fn argmax_rows<T: Copy + PartialOrd>(input: &[T], layout: &Layout) -> Vec<u32> {
    let last = layout.dims()[layout.rank() - 1];
    let rows = layout.elem_count() / last.max(1);
    let mut out = Vec::with_capacity(rows);
    let mut iter = layout.strided_indices();
    for _ in 0..rows {
        let mut best_val = input[iter.next().expect("layout element count")];
        let mut best_arg = 0u32;
        for c in 1..last {
            let v = input[iter.next().expect("layout element count")];
            if v > best_val {
                best_val = v;
                best_arg = c as u32;
            }
        }
        out.push(best_arg);
    }
    out
}

/// Gather any storage into an f64 vec in logical order.
fn gather_f64(storage: &CpuStorage, layout: &Layout) -> Vec<f64> {
    match &storage.data {
        Data::F32(v) => layout.strided_indices().map(|i| v[i] as f64).collect(),
        Data::F64(v) => layout.strided_indices().map(|i| v[i]).collect(),
        Data::U32(v) => layout.strided_indices().map(|i| v[i] as f64).collect(),
    }
}

// Backend implementation

/// The CPU compute backend.
#[derive(Debug, Clone)]
pub struct CpuBackend;

/// Convenience alias used throughout the higher crates.
pub type CpuTensor = Tensor<CpuBackend>;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        let n = shape.elem_count();
        CpuStorage::build(dtype, n, device.budget.clone(), || match dtype {
            DType::F32 => Data::F32(vec![0.0; n]),
            DType::F64 => Data::F64(vec![0.0; n]),
            DType::U32 => Data::U32(vec![0; n]),
        })
    }

    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        let n = shape.elem_count();
        CpuStorage::build(dtype, n, device.budget.clone(), || match dtype {
            DType::F32 => Data::F32(vec![val as f32; n]),
            DType::F64 => Data::F64(vec![val; n]),
            DType::U32 => Data::U32(vec![val as u32; n]),
        })
    }

    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        CpuStorage::build(dtype, data.len(), device.budget.clone(), || match dtype {
            DType::F32 => Data::F32(data.iter().map(|&v| v as f32).collect()),
            DType::F64 => Data::F64(data.to_vec()),
            DType::U32 => Data::U32(data.iter().map(|&v| v as u32).collect()),
        })
    }

    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        let n = shape.elem_count();
        let mut rng = rand::thread_rng();
        match dtype {
            DType::F32 => CpuStorage::build(dtype, n, device.budget.clone(), || {
                Data::F32((0..n).map(|_| rng.gen::<f32>()).collect())
            }),
            DType::F64 => CpuStorage::build(dtype, n, device.budget.clone(), || {
                Data::F64((0..n).map(|_| rng.gen::<f64>()).collect())
            }),
            DType::U32 => Err(Error::msg("rand_uniform: u32 tensors are not random")),
        }
    }

    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        let n = shape.elem_count();
        let mut rng = rand::thread_rng();
        // Box–Muller from two uniforms; one sample per element is plenty
        // for initialization purposes.
        let mut sample = move || -> f64 {
            let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
            let u2: f64 = rng.gen::<f64>();
            (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
        };
        match dtype {
            DType::F32 => CpuStorage::build(dtype, n, device.budget.clone(), move || {
                Data::F32((0..n).map(|_| sample() as f32).collect())
            }),
            DType::F64 => CpuStorage::build(dtype, n, device.budget.clone(), move || {
                Data::F64((0..n).map(|_| sample()).collect())
            }),
            DType::U32 => Err(Error::msg("rand_normal: u32 tensors are not random")),
        }
    }

    fn to_f64_vec(storage: &Self::Storage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(gather_f64(storage, layout))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage> {
        let n = lhs_layout.elem_count();
        match (&lhs.data, &rhs.data) {
            (Data::F32(a), Data::F32(b)) => {
                CpuStorage::build(DType::F32, n, lhs.budget.clone(), || {
                    Data::F32(zip_map(a, lhs_layout, b, rhs_layout, binary_fn::<f32>(op)))
                })
            }
            (Data::F64(a), Data::F64(b)) => {
                CpuStorage::build(DType::F64, n, lhs.budget.clone(), || {
                    Data::F64(zip_map(a, lhs_layout, b, rhs_layout, binary_fn::<f64>(op)))
                })
            }
            _ => Err(Error::DTypeMismatch {
                expected: lhs.dtype(),
                got: rhs.dtype(),
            }),
        }
    }

    fn binary_assign(
        op: BinaryOp,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<()> {
        match (&mut dst.data, &rhs.data) {
            (Data::F32(d), Data::F32(r)) => {
                zip_assign(d, dst_layout, r, rhs_layout, binary_fn::<f32>(op));
                Ok(())
            }
            (Data::F64(d), Data::F64(r)) => {
                zip_assign(d, dst_layout, r, rhs_layout, binary_fn::<f64>(op));
                Ok(())
            }
            (d, r) => Err(Error::DTypeMismatch {
                expected: d.dtype(),
                got: r.dtype(),
            }),
        }
    }

    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage> {
        let n = layout.elem_count();
        match &input.data {
            Data::F32(v) => CpuStorage::build(DType::F32, n, input.budget.clone(), || {
                Data::F32(map(v, layout, unary_f32(op)))
            }),
            Data::F64(v) => CpuStorage::build(DType::F64, n, input.budget.clone(), || {
                Data::F64(map(v, layout, unary_f64(op)))
            }),
            Data::U32(_) => Err(Error::msg(format!("unary op {op:?} on u32 tensor"))),
        }
    }

    fn unary_assign(op: UnaryOp, dst: &mut Self::Storage, dst_layout: &Layout) -> Result<()> {
        match &mut dst.data {
            Data::F32(v) => {
                map_assign(v, dst_layout, unary_f32(op));
                Ok(())
            }
            Data::F64(v) => {
                map_assign(v, dst_layout, unary_f64(op));
                Ok(())
            }
            Data::U32(_) => Err(Error::msg(format!("unary op {op:?} on u32 tensor"))),
        }
    }

    fn affine(
        input: &Self::Storage,
        layout: &Layout,
        mul: f64,
        add: f64,
    ) -> Result<Self::Storage> {
        let n = layout.elem_count();
        match &input.data {
            Data::F32(v) => {
                let (m, a) = (mul as f32, add as f32);
                CpuStorage::build(DType::F32, n, input.budget.clone(), || {
                    Data::F32(map(v, layout, |x| x * m + a))
                })
            }
            Data::F64(v) => CpuStorage::build(DType::F64, n, input.budget.clone(), || {
                Data::F64(map(v, layout, |x| x * mul + add))
            }),
            Data::U32(_) => Err(Error::msg("affine on u32 tensor")),
        }
    }

    fn affine_assign(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        mul: f64,
        add: f64,
    ) -> Result<()> {
        match &mut dst.data {
            Data::F32(v) => {
                let (m, a) = (mul as f32, add as f32);
                map_assign(v, dst_layout, |x| x * m + a);
                Ok(())
            }
            Data::F64(v) => {
                map_assign(v, dst_layout, |x| x * mul + add);
                Ok(())
            }
            Data::U32(_) => Err(Error::msg("affine on u32 tensor")),
        }
    }

    fn cmp_op(
        op: CmpOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage> {
        let n = lhs_layout.elem_count();
        let a = gather_f64(lhs, lhs_layout);
        let b = gather_f64(rhs, rhs_layout);
        let f: fn(f64, f64) -> bool = match op {
            CmpOp::Eq => |x, y| x == y,
            CmpOp::Ge => |x, y| x >= y,
            CmpOp::Lt => |x, y| x < y,
        };
        CpuStorage::build(DType::U32, n, lhs.budget.clone(), || {
            Data::U32(
                a.iter()
                    .zip(b.iter())
                    .map(|(&x, &y)| u32::from(f(x, y)))
                    .collect(),
            )
        })
    }

    fn to_dtype(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let data = gather_f64(input, layout);
        Self::from_f64_slice(&data, dtype, device)
    }

    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dim: usize,
    ) -> Result<Self::Storage> {
        if dim >= layout.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: layout.rank(),
            });
        }
        let out_len = layout.elem_count() / layout.dims()[dim].max(1);
        match (&input.data, op) {
            (Data::F32(v), ReduceOp::Sum) => {
                CpuStorage::build(DType::F32, out_len, input.budget.clone(), || {
                    Data::F32(reduce_dim(v, layout, dim, 0.0f32, |a, b| a + b))
                })
            }
            (Data::F32(v), ReduceOp::Max) => {
                CpuStorage::build(DType::F32, out_len, input.budget.clone(), || {
                    Data::F32(reduce_dim(v, layout, dim, f32::NEG_INFINITY, f32::max))
                })
            }
            (Data::F64(v), ReduceOp::Sum) => {
                CpuStorage::build(DType::F64, out_len, input.budget.clone(), || {
                    Data::F64(reduce_dim(v, layout, dim, 0.0f64, |a, b| a + b))
                })
            }
            (Data::F64(v), ReduceOp::Max) => {
                CpuStorage::build(DType::F64, out_len, input.budget.clone(), || {
                    Data::F64(reduce_dim(v, layout, dim, f64::NEG_INFINITY, f64::max))
                })
            }
            (Data::U32(_), _) => Err(Error::msg("reduce on u32 tensor")),
        }
    }

    fn argmax_last_dim(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage> {
        let last = layout.dims()[layout.rank() - 1];
        let rows = layout.elem_count() / last.max(1);
        match &input.data {
            Data::F32(v) => CpuStorage::build(DType::U32, rows, input.budget.clone(), || {
                Data::U32(argmax_rows(v, layout))
            }),
            Data::F64(v) => CpuStorage::build(DType::U32, rows, input.budget.clone(), || {
                Data::U32(argmax_rows(v, layout))
            }),
            Data::U32(v) => CpuStorage::build(DType::U32, rows, input.budget.clone(), || {
                Data::U32(argmax_rows(v, layout))
            }),
        }
    }

    fn matmul(
        lhs: &Self::Storage,
        rhs: &Self::Storage,
        bmnk: (usize, usize, usize, usize),
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let (b, m, n, k) = bmnk;
        match (&lhs.data, &rhs.data) {
            (Data::F32(a), Data::F32(bb)) => {
                CpuStorage::build(DType::F32, b * m * n, device.budget.clone(), || {
                    let mut out = vec![0.0f32; b * m * n];
                    for batch in 0..b {
                        let (ao, bo, co) = (batch * m * k, batch * k * n, batch * m * n);
                        unsafe {
                            matrixmultiply::sgemm(
                                m,
                                k,
                                n,
                                1.0,
                                a[ao..].as_ptr(),
                                k as isize,
                                1,
                                bb[bo..].as_ptr(),
                                n as isize,
                                1,
                                0.0,
                                out[co..].as_mut_ptr(),
                                n as isize,
                                1,
                            );
                        }
                    }
                    Data::F32(out)
                })
            }
            (Data::F64(a), Data::F64(bb)) => {
                CpuStorage::build(DType::F64, b * m * n, device.budget.clone(), || {
                    let mut out = vec![0.0f64; b * m * n];
                    for batch in 0..b {
                        let (ao, bo, co) = (batch * m * k, batch * k * n, batch * m * n);
                        unsafe {
                            matrixmultiply::dgemm(
                                m,
                                k,
                                n,
                                1.0,
                                a[ao..].as_ptr(),
                                k as isize,
                                1,
                                bb[bo..].as_ptr(),
                                n as isize,
                                1,
                                0.0,
                                out[co..].as_mut_ptr(),
                                n as isize,
                                1,
                            );
                        }
                    }
                    Data::F64(out)
                })
            }
            _ => Err(Error::DTypeMismatch {
                expected: lhs.dtype(),
                got: rhs.dtype(),
            }),
        }
    }

    fn index_select(
        input: &Self::Storage,
        layout: &Layout,
        ids: &Self::Storage,
        ids_layout: &Layout,
    ) -> Result<Self::Storage> {
        let (rows, cols) = (layout.dims()[0], layout.dims()[1]);
        let ids_vec = ids.u32()?;
        let picked: Vec<u32> = ids_layout.strided_indices().map(|i| ids_vec[i]).collect();
        for &id in &picked {
            if id as usize >= rows {
                return Err(Error::msg(format!(
                    "index_select: id {id} out of range for table with {rows} rows"
                )));
            }
        }
        let n = picked.len() * cols;
        match &input.data {
            Data::F32(v) => CpuStorage::build(DType::F32, n, input.budget.clone(), || {
                let mut out = Vec::with_capacity(n);
                for &id in &picked {
                    let r = id as usize * cols;
                    out.extend_from_slice(&v[r..r + cols]);
                }
                Data::F32(out)
            }),
            Data::F64(v) => CpuStorage::build(DType::F64, n, input.budget.clone(), || {
                let mut out = Vec::with_capacity(n);
                for &id in &picked {
                    let r = id as usize * cols;
                    out.extend_from_slice(&v[r..r + cols]);
                }
                Data::F64(out)
            }),
            Data::U32(_) => Err(Error::msg("index_select on u32 table")),
        }
    }

    fn index_add(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        ids: &Self::Storage,
        ids_layout: &Layout,
        src: &Self::Storage,
        src_layout: &Layout,
    ) -> Result<()> {
        let rows = dst_layout.dims()[0];
        let cols = dst_layout.dims()[1];
        let ids_vec = ids.u32()?;
        let picked: Vec<u32> = ids_layout.strided_indices().map(|i| ids_vec[i]).collect();
        for &id in &picked {
            if id as usize >= rows {
                return Err(Error::msg(format!(
                    "index_add: id {id} out of range for table with {rows} rows"
                )));
            }
        }
        match (&mut dst.data, &src.data) {
            (Data::F32(d), Data::F32(s)) => {
                for (i, &id) in picked.iter().enumerate() {
                    for c in 0..cols {
                        let di = dst_layout.flat_index(&[id as usize, c]);
                        let si = src_layout.flat_index(&[i, c]);
                        d[di] += s[si];
                    }
                }
                Ok(())
            }
            (Data::F64(d), Data::F64(s)) => {
                for (i, &id) in picked.iter().enumerate() {
                    for c in 0..cols {
                        let di = dst_layout.flat_index(&[id as usize, c]);
                        let si = src_layout.flat_index(&[i, c]);
                        d[di] += s[si];
                    }
                }
                Ok(())
            }
            (d, s) => Err(Error::DTypeMismatch {
                expected: d.dtype(),
                got: s.dtype(),
            }),
        }
    }

    fn copy_strided(
        src: &Self::Storage,
        src_layout: &Layout,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
    ) -> Result<()> {
        match (&src.data, &mut dst.data) {
            (Data::F32(s), Data::F32(d)) => {
                for (si, di) in src_layout.strided_indices().zip(dst_layout.strided_indices()) {
                    d[di] = s[si];
                }
                Ok(())
            }
            (Data::F64(s), Data::F64(d)) => {
                for (si, di) in src_layout.strided_indices().zip(dst_layout.strided_indices()) {
                    d[di] = s[si];
                }
                Ok(())
            }
            (Data::U32(s), Data::U32(d)) => {
                for (si, di) in src_layout.strided_indices().zip(dst_layout.strided_indices()) {
                    d[di] = s[si];
                }
                Ok(())
            }
            (s, d) => Err(Error::DTypeMismatch {
                expected: d.dtype(),
                got: s.dtype(),
            }),
        }
    }
}
