//! # stoat-data
//!
//! Data plumbing for sequence labeling: vocabularies with fixed
//! `<pad>`/`<unk>` specials, `token/LABEL` corpus files, and rectangular
//! padded [`CorpusBatch`]es with the split operation the trainer's OOM
//! recovery relies on.

pub mod corpus;
pub mod vocab;

pub use corpus::{Corpus, CorpusBatch, Sentence};
pub use vocab::{Vocab, PAD, PAD_ID, UNK, UNK_ID};
