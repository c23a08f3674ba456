use stoat_core::{Backend, ComputeGraph, DType, Error, Result, WeightTensor};

use crate::linear::Linear;
use crate::module::NetModule;

// Multi-Head Self-Attention
//
// scores = Q @ Kᵀ / √d_head (+ additive padding mask) → softmax → @ V,
// per head, then the heads are re-merged and projected.
//
// SHAPES:
//   x:    [batch, seq, d_model]
//   Q/K/V projections keep d_model, then split into heads:
//     [batch, seq, d_model] → [batch, seq, h, d_head] → [batch, h, seq, d_head]
//     → [batch*h, seq, d_head] for the batched matmuls
//   mask: additive [batch, 1, 1, seq] (0 keep, −1e9 drop), expanded over
//         heads and query positions before the softmax
//
// The whole block records into a sub-graph so its (many) intermediates
// release when the block returns, independent of the caller's scope.

/// Multi-head self-attention over a padded batch of sequences.
pub struct MultiHeadAttention<B: Backend> {
    w_q: Linear<B>,
    w_k: Linear<B>,
    w_v: Linear<B>,
    w_o: Linear<B>,
    num_heads: usize,
    head_dim: usize,
    d_model: usize,
    dropout_p: f64,
}

impl<B: Backend> MultiHeadAttention<B> {
    pub fn new(
        name: &str,
        d_model: usize,
        num_heads: usize,
        dropout_p: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        if d_model % num_heads != 0 {
            return Err(Error::msg(format!(
                "d_model {d_model} is not divisible by {num_heads} heads"
            )));
        }
        Ok(MultiHeadAttention {
            w_q: Linear::new(&format!("{name}.w_q"), d_model, d_model, true, dtype, device)?,
            w_k: Linear::new(&format!("{name}.w_k"), d_model, d_model, true, dtype, device)?,
            w_v: Linear::new(&format!("{name}.w_v"), d_model, d_model, true, dtype, device)?,
            w_o: Linear::new(&format!("{name}.w_o"), d_model, d_model, true, dtype, device)?,
            num_heads,
            head_dim: d_model / num_heads,
            d_model,
            dropout_p,
        })
    }

    /// Split [batch, seq, d_model] into [batch*heads, seq, head_dim].
    fn split_heads(
        &self,
        g: &ComputeGraph<B>,
        x: &WeightTensor<B>,
        batch: usize,
        seq: usize,
    ) -> Result<WeightTensor<B>> {
        let x = g.reshape(x, vec![batch, seq, self.num_heads, self.head_dim])?;
        let x = g.transpose(&x, 1, 2)?;
        g.reshape(&x, vec![batch * self.num_heads, seq, self.head_dim])
    }

    /// Attend over `x`, with an optional additive mask [batch, 1, 1, seq].
    pub fn forward_masked(
        &self,
        graph: &ComputeGraph<B>,
        x: &WeightTensor<B>,
        mask: Option<&WeightTensor<B>>,
    ) -> Result<WeightTensor<B>> {
        let g = graph.sub_graph("mha");
        let dims = x.weight().dims();
        let (batch, seq) = (dims[0], dims[1]);

        let q = self.split_heads(&g, &self.w_q.forward(&g, x)?, batch, seq)?;
        let k = self.split_heads(&g, &self.w_k.forward(&g, x)?, batch, seq)?;
        let v = self.split_heads(&g, &self.w_v.forward(&g, x)?, batch, seq)?;

        // [b*h, seq, seq]
        let kt = g.transpose(&k, 1, 2)?;
        let scores = g.mul_batch(&q, &kt)?;
        let scores = g.mul_scalar(&scores, 1.0 / (self.head_dim as f64).sqrt())?;

        let scores = match mask {
            Some(m) => {
                let m = g.expand(m, vec![batch, self.num_heads, seq, seq])?;
                let m = g.reshape(&m, vec![batch * self.num_heads, seq, seq])?;
                g.add(&scores, &m)?
            }
            None => scores,
        };

        let probs = g.softmax(&scores)?;
        let probs = g.dropout(&probs, self.dropout_p)?;

        // Merge heads back: [b*h, seq, d_head] → [b, seq, d_model]
        let ctx = g.mul_batch(&probs, &v)?;
        let ctx = g.reshape(&ctx, vec![batch, self.num_heads, seq, self.head_dim])?;
        let ctx = g.transpose(&ctx, 1, 2)?;
        let ctx = g.reshape(&ctx, vec![batch, seq, self.d_model])?;
        self.w_o.forward(&g, &ctx)
    }
}

impl<B: Backend> NetModule<B> for MultiHeadAttention<B> {
    fn forward(&self, graph: &ComputeGraph<B>, x: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.forward_masked(graph, x, None)
    }

    fn parameters(&self) -> Vec<WeightTensor<B>> {
        let mut params = self.w_q.parameters();
        params.extend(self.w_k.parameters());
        params.extend(self.w_v.parameters());
        params.extend(self.w_o.parameters());
        params
    }
}
