use stoat_core::{Backend, DType, Result, Shape, Tensor};

// Parameter initialization
//
// Kaiming-style uniform U(-k, k) for recurrent/linear weights, Xavier for
// projections feeding softmax, and small-std normal for embeddings.

/// U(-k, k).
pub fn uniform<B: Backend>(
    shape: impl Into<Shape>,
    k: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Tensor::<B>::rand_uniform(shape, dtype, device)?.affine(2.0 * k, -k)
}

/// Glorot/Xavier uniform: U(-a, a) with a = sqrt(6 / (fan_in + fan_out)).
pub fn xavier_uniform<B: Backend>(
    fan_in: usize,
    fan_out: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let a = (6.0 / (fan_in + fan_out) as f64).sqrt();
    uniform::<B>((fan_in, fan_out), a, dtype, device)
}

/// N(0, std).
pub fn normal<B: Backend>(
    shape: impl Into<Shape>,
    std: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Tensor::<B>::rand_normal(shape, dtype, device)?.affine(std, 0.0)
}
