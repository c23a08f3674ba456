use serde::{Deserialize, Serialize};

use stoat_core::{Backend, ComputeGraph, DType, Error, Result, Tensor, WeightTensor};
use stoat_data::{CorpusBatch, PAD_ID};

use crate::dropout::Dropout;
use crate::embedding::Embedding;
use crate::linear::Linear;
use crate::loss::sequence_cross_entropy;
use crate::module::NetModule;
use crate::rnn::BiLstmEncoder;
use crate::transformer::TransformerEncoder;

// SequenceTagger — the full POS/NER model
//
//   token embedding (+ learned positional embedding for the transformer)
//   → dropout → encoder (Transformer or BiLSTM) → label projection
//
// The same forward code serves three callers: training (loss over a
// backprop graph), validation (loss over an inference graph), and
// prediction (argmax over an inference graph). Dropout disappears on
// inference graphs by construction.

/// Which encoder the tagger uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderKind {
    Transformer,
    BiLstm,
}

/// Model hyperparameters. Everything the checkpoint needs to rebuild the
/// network at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggerConfig {
    pub vocab_size: usize,
    pub label_size: usize,
    pub encoder: EncoderKind,
    /// Embedding width; also the transformer model width.
    pub d_model: usize,
    /// Transformer: attention heads per layer.
    pub num_heads: usize,
    /// Encoder depth (transformer layers; ignored by the single-layer
    /// BiLSTM encoder).
    pub num_layers: usize,
    /// Transformer: feed-forward inner width.
    pub d_ff: usize,
    /// BiLSTM: hidden size per direction.
    pub lstm_hidden: usize,
    /// Longest sequence the positional table covers.
    pub max_seq_len: usize,
    pub dropout: f64,
    pub label_smoothing: f64,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        TaggerConfig {
            vocab_size: 0,
            label_size: 0,
            encoder: EncoderKind::Transformer,
            d_model: 128,
            num_heads: 4,
            num_layers: 2,
            d_ff: 512,
            lstm_hidden: 128,
            max_seq_len: 256,
            dropout: 0.1,
            label_smoothing: 0.0,
        }
    }
}

enum Encoder<B: Backend> {
    Transformer(TransformerEncoder<B>),
    BiLstm(BiLstmEncoder<B>),
}

/// Sequence-labeling network: embeddings, encoder, label projection.
pub struct SequenceTagger<B: Backend> {
    config: TaggerConfig,
    embedding: Embedding<B>,
    positional: Option<Embedding<B>>,
    encoder: Encoder<B>,
    projection: Linear<B>,
    dropout: Dropout,
    device: B::Device,
    dtype: DType,
}

impl<B: Backend> SequenceTagger<B> {
    pub fn new(config: TaggerConfig, dtype: DType, device: &B::Device) -> Result<Self> {
        if config.vocab_size == 0 || config.label_size == 0 {
            return Err(Error::msg("tagger config needs vocab_size and label_size"));
        }
        let embedding = Embedding::new("embedding", config.vocab_size, config.d_model, dtype, device)?;
        let (positional, encoder, enc_out) = match config.encoder {
            EncoderKind::Transformer => {
                let pos = Embedding::new("positional", config.max_seq_len, config.d_model, dtype, device)?;
                let enc = TransformerEncoder::new(
                    "encoder",
                    config.num_layers,
                    config.d_model,
                    config.num_heads,
                    config.d_ff,
                    config.dropout,
                    dtype,
                    device,
                )?;
                (Some(pos), Encoder::Transformer(enc), config.d_model)
            }
            EncoderKind::BiLstm => {
                let enc = BiLstmEncoder::new(
                    "encoder",
                    config.d_model,
                    config.lstm_hidden,
                    dtype,
                    device,
                )?;
                let out = enc.output_size();
                (None, Encoder::BiLstm(enc), out)
            }
        };
        Ok(SequenceTagger {
            projection: Linear::new("projection", enc_out, config.label_size, true, dtype, device)?,
            dropout: Dropout::new(config.dropout),
            embedding,
            positional,
            encoder,
            config,
            device: device.clone(),
            dtype,
        })
    }

    pub fn config(&self) -> &TaggerConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Ordered, stable parameter list. Replicas of the same config return
    /// the same order — sync, reduction, and checkpoints depend on it.
    pub fn parameters(&self) -> Vec<WeightTensor<B>> {
        let mut params = self.embedding.parameters();
        if let Some(pos) = &self.positional {
            params.extend(pos.parameters());
        }
        match &self.encoder {
            Encoder::Transformer(enc) => params.extend(enc.parameters()),
            Encoder::BiLstm(enc) => params.extend(enc.parameters()),
        }
        params.extend(self.projection.parameters());
        params
    }

    /// Additive attention mask from the batch's true lengths:
    /// 0 where a key position is real, −1e9 where it is padding.
    fn padding_mask(&self, g: &ComputeGraph<B>, batch: &CorpusBatch) -> Result<WeightTensor<B>> {
        let (b, t) = (batch.batch_size, batch.seq_len);
        let mut data = vec![0.0f64; b * t];
        for (row, &len) in batch.lengths.iter().enumerate() {
            for col in len..t {
                data[row * t + col] = -1e9;
            }
        }
        g.constant(
            "padding_mask",
            Tensor::<B>::from_f64_slice(&data, vec![b, 1, 1, t], self.dtype, &self.device)?,
        )
    }

    /// Per-position label scores: [batch*seq, label_size].
    pub fn forward_logits(
        &self,
        g: &ComputeGraph<B>,
        batch: &CorpusBatch,
    ) -> Result<WeightTensor<B>> {
        let (b, t) = (batch.batch_size, batch.seq_len);
        if t > self.config.max_seq_len {
            return Err(Error::msg(format!(
                "sequence length {t} exceeds the configured maximum {}",
                self.config.max_seq_len
            )));
        }

        let token_ids = Tensor::<B>::from_u32_slice(&batch.tokens, b * t, &self.device)?;
        let mut x = self.embedding.lookup(g, &token_ids)?;

        if let Some(pos) = &self.positional {
            let pos_ids: Vec<u32> = (0..b)
                .flat_map(|_| (0..t as u32).collect::<Vec<_>>())
                .collect();
            let pos_ids = Tensor::<B>::from_u32_slice(&pos_ids, b * t, &self.device)?;
            let p = pos.lookup(g, &pos_ids)?;
            x = g.add(&x, &p)?;
        }

        let x = g.reshape(&x, (b, t, self.config.d_model))?;
        let x = self.dropout.forward(g, &x)?;

        let encoded = match &self.encoder {
            Encoder::Transformer(enc) => {
                let mask = self.padding_mask(g, batch)?;
                enc.forward_masked(g, &x, Some(&mask))?
            }
            Encoder::BiLstm(enc) => enc.forward(g, &x)?,
        };

        let enc_dim = encoded.weight().dims()[2];
        let flat = g.reshape(&encoded, (b * t, enc_dim))?;
        self.projection.forward(g, &flat)
    }

    /// Scalar training/validation loss plus the token count it averages.
    pub fn loss(&self, g: &ComputeGraph<B>, batch: &CorpusBatch) -> Result<(WeightTensor<B>, usize)> {
        let logits = self.forward_logits(g, batch)?;
        sequence_cross_entropy(g, &logits, &batch.labels, PAD_ID, self.config.label_smoothing)
    }

    /// Greedy decode: argmax label id per position, flat [batch*seq].
    /// Padded positions are returned as PAD_ID.
    pub fn predict(&self, g: &ComputeGraph<B>, batch: &CorpusBatch) -> Result<Vec<u32>> {
        let logits = self.forward_logits(g, batch)?;
        let mut ids = logits.weight().argmax_last_dim()?.to_u32_vec()?;
        for (row, &len) in batch.lengths.iter().enumerate() {
            for col in len..batch.seq_len {
                ids[row * batch.seq_len + col] = PAD_ID;
            }
        }
        Ok(ids)
    }
}
