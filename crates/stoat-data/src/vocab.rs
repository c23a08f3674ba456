use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// Vocab — string ↔ id mapping for tokens and labels
//
// Two specials sit at fixed positions: <pad> at 0 (batch padding) and
// <unk> at 1 (out-of-vocabulary tokens). Label vocabularies reuse the same
// type; padded label positions are masked out of the loss by id, so <pad>
// keeps slot 0 there too.

pub const PAD: &str = "<pad>";
pub const UNK: &str = "<unk>";

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;

/// String ↔ id vocabulary with fixed <pad>/<unk> specials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocab {
    items: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, u32>,
}

impl Vocab {
    /// Build from unique items (specials are prepended automatically).
    pub fn new(items: impl IntoIterator<Item = String>) -> Self {
        let mut v = Vocab {
            items: vec![PAD.to_string(), UNK.to_string()],
            index: HashMap::new(),
        };
        for item in items {
            if !v.index.contains_key(&item) && item != PAD && item != UNK {
                v.index.insert(item.clone(), v.items.len() as u32);
                v.items.push(item);
            }
        }
        v.rebuild_index();
        v
    }

    /// Collect the vocabulary of an iterator of token sequences.
    pub fn from_sequences<'a>(seqs: impl IntoIterator<Item = &'a [String]>) -> Self {
        let mut seen = Vec::new();
        let mut dedup = HashMap::new();
        for seq in seqs {
            for tok in seq {
                if !dedup.contains_key(tok) {
                    dedup.insert(tok.clone(), ());
                    seen.push(tok.clone());
                }
            }
        }
        Self::new(seen)
    }

    /// Re-derive the lookup index from the item list (after deserializing).
    pub fn rebuild_index(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Id of a token, falling back to <unk>.
    pub fn id(&self, item: &str) -> u32 {
        self.index.get(item).copied().unwrap_or(UNK_ID)
    }

    /// Token of an id, or <unk> for an out-of-range id.
    pub fn item(&self, id: u32) -> &str {
        self.items.get(id as usize).map_or(UNK, |s| s.as_str())
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specials_are_fixed() {
        let v = Vocab::new(["the".to_string(), "cat".to_string()]);
        assert_eq!(v.id(PAD), PAD_ID);
        assert_eq!(v.id(UNK), UNK_ID);
        assert_eq!(v.id("the"), 2);
        assert_eq!(v.id("missing"), UNK_ID);
        assert_eq!(v.item(3), "cat");
    }

    #[test]
    fn duplicates_collapse() {
        let v = Vocab::new(["a".to_string(), "a".to_string(), "b".to_string()]);
        assert_eq!(v.len(), 4); // pad, unk, a, b
    }
}
