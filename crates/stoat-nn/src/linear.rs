use stoat_core::{Backend, ComputeGraph, DType, Result, Tensor, WeightTensor};

use crate::init;
use crate::module::NetModule;

// Linear — fully-connected layer: y = x @ W + b
//
// The weight is stored [in_features, out_features] so the forward pass is
// a single plain matmul with no transpose. Rank-3 sequence inputs
// [batch, seq, in] are flattened to [batch*seq, in] and restored after.

/// Fully-connected layer.
pub struct Linear<B: Backend> {
    weight: WeightTensor<B>,
    bias: Option<WeightTensor<B>>,
    in_features: usize,
    out_features: usize,
}

impl<B: Backend> Linear<B> {
    /// Kaiming-uniform initialized layer. `name` prefixes the parameter
    /// names (`{name}.weight`, `{name}.bias`).
    pub fn new(
        name: &str,
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let k = (1.0 / in_features as f64).sqrt();
        let weight = WeightTensor::parameter(
            format!("{name}.weight"),
            init::uniform::<B>((in_features, out_features), k, dtype, device)?,
        );
        let bias = if use_bias {
            Some(WeightTensor::parameter(
                format!("{name}.bias"),
                Tensor::<B>::zeros(out_features, dtype, device)?,
            ))
        } else {
            None
        };
        Ok(Linear {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl<B: Backend> NetModule<B> for Linear<B> {
    fn forward(&self, graph: &ComputeGraph<B>, x: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        let dims = x.weight().dims().to_vec();
        let flat = if dims.len() == 3 {
            graph.reshape(x, (dims[0] * dims[1], dims[2]))?
        } else {
            x.clone()
        };
        let out = match &self.bias {
            Some(bias) => graph.affine_transform(&flat, &self.weight, bias)?,
            None => graph.matmul(&flat, &self.weight)?,
        };
        if dims.len() == 3 {
            graph.reshape(&out, (dims[0], dims[1], self.out_features))
        } else {
            Ok(out)
        }
    }

    fn parameters(&self) -> Vec<WeightTensor<B>> {
        let mut params = vec![self.weight.clone()];
        if let Some(b) = &self.bias {
            params.push(b.clone());
        }
        params
    }
}
