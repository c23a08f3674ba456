//! # stoat-nn
//!
//! Layers and models over Stoat's compute graph: Linear, Embedding,
//! Dropout, LayerNorm, multi-head attention, Transformer encoder blocks,
//! LSTM/BiLSTM, sequence losses, and the [`SequenceTagger`] model the
//! trainer drives.

pub mod attention;
pub mod dropout;
pub mod embedding;
pub mod init;
pub mod layernorm;
pub mod linear;
pub mod loss;
pub mod module;
pub mod rnn;
pub mod tagger;
pub mod transformer;

pub use attention::MultiHeadAttention;
pub use dropout::Dropout;
pub use embedding::Embedding;
pub use layernorm::LayerNorm;
pub use linear::Linear;
pub use loss::{sequence_cross_entropy, token_accuracy};
pub use module::NetModule;
pub use rnn::{BiLstmEncoder, LstmCell};
pub use tagger::{EncoderKind, SequenceTagger, TaggerConfig};
pub use transformer::{TransformerEncoder, TransformerEncoderLayer};
