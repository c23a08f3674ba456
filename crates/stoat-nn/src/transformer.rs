use stoat_core::{Backend, ComputeGraph, DType, Result, WeightTensor};

use crate::attention::MultiHeadAttention;
use crate::dropout::Dropout;
use crate::layernorm::LayerNorm;
use crate::linear::Linear;
use crate::module::NetModule;

// Transformer encoder — pre-norm residual blocks
//
//   x = x + dropout(attn(ln1(x), mask))
//   x = x + dropout(ff2(relu(ff1(ln2(x)))))
//
// plus a final LayerNorm after the stack. Pre-norm keeps gradients well
// conditioned without a warmup-critical schedule, which matters on the
// small corpora taggers are often trained on.

/// One pre-norm encoder block.
pub struct TransformerEncoderLayer<B: Backend> {
    attn: MultiHeadAttention<B>,
    ln1: LayerNorm<B>,
    ln2: LayerNorm<B>,
    ff1: Linear<B>,
    ff2: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> TransformerEncoderLayer<B> {
    pub fn new(
        name: &str,
        d_model: usize,
        num_heads: usize,
        d_ff: usize,
        dropout_p: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        Ok(TransformerEncoderLayer {
            attn: MultiHeadAttention::new(
                &format!("{name}.attn"),
                d_model,
                num_heads,
                dropout_p,
                dtype,
                device,
            )?,
            ln1: LayerNorm::new(&format!("{name}.ln1"), d_model, dtype, device)?,
            ln2: LayerNorm::new(&format!("{name}.ln2"), d_model, dtype, device)?,
            ff1: Linear::new(&format!("{name}.ff1"), d_model, d_ff, true, dtype, device)?,
            ff2: Linear::new(&format!("{name}.ff2"), d_ff, d_model, true, dtype, device)?,
            dropout: Dropout::new(dropout_p),
        })
    }

    pub fn forward_masked(
        &self,
        graph: &ComputeGraph<B>,
        x: &WeightTensor<B>,
        mask: Option<&WeightTensor<B>>,
    ) -> Result<WeightTensor<B>> {
        let g = graph.sub_graph("encoder_layer");

        let normed = self.ln1.forward(&g, x)?;
        let attended = self.attn.forward_masked(&g, &normed, mask)?;
        let attended = self.dropout.forward(&g, &attended)?;
        let x = g.add(x, &attended)?;

        let normed = self.ln2.forward(&g, &x)?;
        let hidden = g.relu(&self.ff1.forward(&g, &normed)?)?;
        let hidden = self.ff2.forward(&g, &hidden)?;
        let hidden = self.dropout.forward(&g, &hidden)?;
        g.add(&x, &hidden)
    }
}

impl<B: Backend> NetModule<B> for TransformerEncoderLayer<B> {
    fn forward(&self, graph: &ComputeGraph<B>, x: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.forward_masked(graph, x, None)
    }

    fn parameters(&self) -> Vec<WeightTensor<B>> {
        let mut params = self.ln1.parameters();
        params.extend(self.attn.parameters());
        params.extend(self.ln2.parameters());
        params.extend(self.ff1.parameters());
        params.extend(self.ff2.parameters());
        params
    }
}

/// A stack of encoder blocks with a closing LayerNorm.
pub struct TransformerEncoder<B: Backend> {
    layers: Vec<TransformerEncoderLayer<B>>,
    final_ln: LayerNorm<B>,
}

impl<B: Backend> TransformerEncoder<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        num_layers: usize,
        d_model: usize,
        num_heads: usize,
        d_ff: usize,
        dropout_p: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|i| {
                TransformerEncoderLayer::new(
                    &format!("{name}.layer{i}"),
                    d_model,
                    num_heads,
                    d_ff,
                    dropout_p,
                    dtype,
                    device,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(TransformerEncoder {
            layers,
            final_ln: LayerNorm::new(&format!("{name}.final_ln"), d_model, dtype, device)?,
        })
    }

    pub fn forward_masked(
        &self,
        graph: &ComputeGraph<B>,
        x: &WeightTensor<B>,
        mask: Option<&WeightTensor<B>>,
    ) -> Result<WeightTensor<B>> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward_masked(graph, &x, mask)?;
        }
        self.final_ln.forward(graph, &x)
    }
}

impl<B: Backend> NetModule<B> for TransformerEncoder<B> {
    fn forward(&self, graph: &ComputeGraph<B>, x: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.forward_masked(graph, x, None)
    }

    fn parameters(&self) -> Vec<WeightTensor<B>> {
        let mut params = Vec::new();
        for layer in &self.layers {
            params.extend(layer.parameters());
        }
        params.extend(self.final_ln.parameters());
        params
    }
}
