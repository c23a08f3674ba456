use stoat_core::{Backend, ComputeGraph, DType, Result, Tensor, WeightTensor};

use crate::module::NetModule;

// LayerNorm — normalize over the last (feature) dimension
//
// y = (x - mean) / sqrt(var + eps) * gamma + beta, per position. The
// graph op saves the normalized activations and inverse std on the tape
// for the backward pass.

/// Layer normalization with learned gain and bias.
pub struct LayerNorm<B: Backend> {
    gamma: WeightTensor<B>,
    beta: WeightTensor<B>,
    eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    pub fn new(name: &str, dim: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        Ok(LayerNorm {
            gamma: WeightTensor::parameter(
                format!("{name}.gamma"),
                Tensor::<B>::full(dim, 1.0, dtype, device)?,
            ),
            beta: WeightTensor::parameter(
                format!("{name}.beta"),
                Tensor::<B>::zeros(dim, dtype, device)?,
            ),
            eps: 1e-5,
        })
    }
}

impl<B: Backend> NetModule<B> for LayerNorm<B> {
    fn forward(&self, graph: &ComputeGraph<B>, x: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        graph.layer_norm(x, &self.gamma, &self.beta, self.eps)
    }

    fn parameters(&self) -> Vec<WeightTensor<B>> {
        vec![self.gamma.clone(), self.beta.clone()]
    }
}
