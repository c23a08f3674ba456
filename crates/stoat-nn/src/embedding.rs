use stoat_core::{Backend, ComputeGraph, DType, Result, Tensor, WeightTensor};

use crate::init;

// Embedding — id → vector lookup table
//
// Forward is a differentiable row gather; backward scatter-adds into the
// table's gradient, so ids appearing several times in one batch (or a
// table shared between two lookups) accumulate correctly.

/// Lookup table of `num_embeddings × dim` vectors.
pub struct Embedding<B: Backend> {
    table: WeightTensor<B>,
    num_embeddings: usize,
    dim: usize,
}

impl<B: Backend> Embedding<B> {
    pub fn new(
        name: &str,
        num_embeddings: usize,
        dim: usize,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let table = WeightTensor::parameter(
            format!("{name}.table"),
            init::normal::<B>((num_embeddings, dim), 0.02, dtype, device)?,
        );
        Ok(Embedding {
            table,
            num_embeddings,
            dim,
        })
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Look up rows for a flat U32 id tensor of shape [n] → [n, dim].
    pub fn lookup(&self, graph: &ComputeGraph<B>, ids: &Tensor<B>) -> Result<WeightTensor<B>> {
        graph.index_select(&self.table, ids)
    }

    pub fn parameters(&self) -> Vec<WeightTensor<B>> {
        vec![self.table.clone()]
    }
}
