use std::fs;
use std::path::Path;

use rand::seq::SliceRandom;

use stoat_core::{Error, Result};

use crate::vocab::{Vocab, PAD_ID};

// Corpus — sequence-labeling sentences and their batch assembly
//
// The on-disk format is one sentence per line, whitespace-separated
// `token/LABEL` pairs (the common POS-tagging layout):
//
//   The/DT cat/NN sat/VBD ./.
//
// Batches are rectangular: sentences are bucketed by length (sorting a
// shuffled corpus by length keeps buckets random between epochs while
// minimizing padding), padded to the bucket's longest sentence, and
// emitted as flat u32 matrices ready for the device.

/// One tokenized, labeled sentence.
#[derive(Debug, Clone)]
pub struct Sentence {
    pub tokens: Vec<String>,
    pub labels: Vec<String>,
}

impl Sentence {
    /// Parse a `token/LABEL token/LABEL …` line. The separator is the LAST
    /// slash, so tokens containing slashes survive.
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        let mut labels = Vec::new();
        for pair in line.split_whitespace() {
            let split = pair
                .rfind('/')
                .ok_or_else(|| Error::msg(format!("malformed token/LABEL pair: {pair:?}")))?;
            tokens.push(pair[..split].to_string());
            labels.push(pair[split + 1..].to_string());
        }
        if tokens.is_empty() {
            return Err(Error::msg("empty sentence line"));
        }
        Ok(Sentence { tokens, labels })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// A labeled corpus plus the vocabularies derived from it.
#[derive(Debug, Clone)]
pub struct Corpus {
    pub sentences: Vec<Sentence>,
    pub tokens: Vocab,
    pub labels: Vocab,
}

impl Corpus {
    pub fn from_sentences(sentences: Vec<Sentence>) -> Self {
        let tokens = Vocab::from_sequences(sentences.iter().map(|s| s.tokens.as_slice()));
        let labels = Vocab::from_sequences(sentences.iter().map(|s| s.labels.as_slice()));
        Corpus {
            sentences,
            tokens,
            labels,
        }
    }

    /// Read a `token/LABEL` file, one sentence per line, skipping blanks.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let sentences = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(Sentence::parse)
            .collect::<Result<Vec<_>>>()?;
        if sentences.is_empty() {
            return Err(Error::msg("corpus file contains no sentences"));
        }
        Ok(Self::from_sentences(sentences))
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    /// Assemble shuffled, length-bucketed batches of at most `batch_size`
    /// sentences. Every epoch gets a fresh shuffle; the stable sort by
    /// length afterwards keeps padding low without freezing bucket
    /// contents.
    pub fn batches(&self, batch_size: usize, rng: &mut impl rand::Rng) -> Vec<CorpusBatch> {
        assert!(batch_size > 0, "batch_size must be positive");
        let mut order: Vec<usize> = (0..self.sentences.len()).collect();
        order.shuffle(rng);
        order.sort_by_key(|&i| self.sentences[i].len());

        order
            .chunks(batch_size)
            .map(|chunk| {
                let sents: Vec<&Sentence> = chunk.iter().map(|&i| &self.sentences[i]).collect();
                CorpusBatch::assemble(&sents, &self.tokens, &self.labels)
            })
            .collect()
    }
}

/// One rectangular mini-batch: `batch_size × seq_len` token and label id
/// matrices, padded with `<pad>`. Immutable; built per step, consumed by
/// one forward pass.
#[derive(Debug, Clone)]
pub struct CorpusBatch {
    pub batch_size: usize,
    pub seq_len: usize,
    /// Flat row-major `[batch_size × seq_len]` token ids.
    pub tokens: Vec<u32>,
    /// Flat row-major `[batch_size × seq_len]` label ids.
    pub labels: Vec<u32>,
    /// True (unpadded) length of each row.
    pub lengths: Vec<usize>,
}

impl CorpusBatch {
    pub fn assemble(sentences: &[&Sentence], tokens: &Vocab, labels: &Vocab) -> Self {
        let batch_size = sentences.len();
        let seq_len = sentences.iter().map(|s| s.len()).max().unwrap_or(0);
        let mut tok_ids = vec![PAD_ID; batch_size * seq_len];
        let mut lab_ids = vec![PAD_ID; batch_size * seq_len];
        let mut lengths = Vec::with_capacity(batch_size);
        for (row, sent) in sentences.iter().enumerate() {
            lengths.push(sent.len());
            for (col, (tok, lab)) in sent.tokens.iter().zip(sent.labels.iter()).enumerate() {
                tok_ids[row * seq_len + col] = tokens.id(tok);
                lab_ids[row * seq_len + col] = labels.id(lab);
            }
        }
        CorpusBatch {
            batch_size,
            seq_len,
            tokens: tok_ids,
            labels: lab_ids,
            lengths,
        }
    }

    /// Total unpadded token count.
    pub fn token_count(&self) -> usize {
        self.lengths.iter().sum()
    }

    /// Split into `parts` smaller batches along the sentence axis, for the
    /// trainer's OOM recovery. Parts may be one sentence smaller than each
    /// other; empty parts are dropped.
    pub fn split(&self, parts: usize) -> Vec<CorpusBatch> {
        let parts = parts.clamp(1, self.batch_size.max(1));
        let chunk = self.batch_size.div_ceil(parts);
        (0..self.batch_size)
            .step_by(chunk.max(1))
            .map(|start| {
                let end = (start + chunk).min(self.batch_size);
                let rows = end - start;
                CorpusBatch {
                    batch_size: rows,
                    seq_len: self.seq_len,
                    tokens: self.tokens[start * self.seq_len..end * self.seq_len].to_vec(),
                    labels: self.labels[start * self.seq_len..end * self.seq_len].to_vec(),
                    lengths: self.lengths[start..end].to_vec(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn toy() -> Corpus {
        let lines = [
            "the/DT cat/NN sat/VBD",
            "a/DT dog/NN ran/VBD fast/RB",
            "birds/NNS fly/VBP",
        ];
        Corpus::from_sentences(lines.iter().map(|l| Sentence::parse(l).unwrap()).collect())
    }

    #[test]
    fn parse_keeps_last_slash() {
        let s = Sentence::parse("either/or/CC next/JJ").unwrap();
        assert_eq!(s.tokens, vec!["either/or", "next"]);
        assert_eq!(s.labels, vec!["CC", "JJ"]);
    }

    #[test]
    fn batches_are_padded_rectangles() {
        let corpus = toy();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let batches = corpus.batches(2, &mut rng);
        assert_eq!(batches.iter().map(|b| b.batch_size).sum::<usize>(), 3);
        for b in &batches {
            assert_eq!(b.tokens.len(), b.batch_size * b.seq_len);
            assert_eq!(b.labels.len(), b.batch_size * b.seq_len);
            for (row, &len) in b.lengths.iter().enumerate() {
                for col in len..b.seq_len {
                    assert_eq!(b.tokens[row * b.seq_len + col], PAD_ID);
                }
            }
        }
    }

    #[test]
    fn split_covers_all_rows() {
        let corpus = toy();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let batch = corpus.batches(3, &mut rng).remove(0);
        let parts = batch.split(2);
        assert_eq!(parts.iter().map(|p| p.batch_size).sum::<usize>(), batch.batch_size);
        let parts = batch.split(16); // more parts than rows → one row each
        assert!(parts.iter().all(|p| p.batch_size == 1));
    }
}
