//! Token sequence chunking for embedding generation
//!
//! Splits long token sequences into windows no longer than the model's
//! sequence length. Chunks are views: they share the parent sequence's
//! storage and copy nothing.

use std::ops::Deref;
use std::sync::Arc;

/// Immutable, cheaply clonable sequence of token IDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    ids: Arc<[i64]>,
}

impl TokenSequence {
    pub fn new(ids: Vec<i64>) -> Self {
        Self { ids: ids.into() }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.ids
    }
}

impl Default for TokenSequence {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl From<Vec<i64>> for TokenSequence {
    fn from(ids: Vec<i64>) -> Self {
        Self::new(ids)
    }
}

impl FromIterator<i64> for TokenSequence {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

impl Deref for TokenSequence {
    type Target = [i64];

    fn deref(&self) -> &[i64] {
        &self.ids
    }
}

impl AsRef<[i64]> for TokenSequence {
    fn as_ref(&self) -> &[i64] {
        &self.ids
    }
}

/// A contiguous window `[start, end)` of a [`TokenSequence`]
#[derive(Debug, Clone)]
pub struct Chunk {
    source: Arc<[i64]>,
    start: usize,
    end: usize,
}

impl Chunk {
    /// Offset of the first token in the parent sequence
    pub fn start(&self) -> usize {
        self.start
    }

    /// Offset one past the last token in the parent sequence
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.source[self.start..self.end]
    }
}

impl Deref for Chunk {
    type Target = [i64];

    fn deref(&self) -> &[i64] {
        self.as_slice()
    }
}

impl AsRef<[i64]> for Chunk {
    fn as_ref(&self) -> &[i64] {
        self.as_slice()
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Chunk {}

/// Split `ids` into consecutive, non-overlapping chunks of `max_seq_len`
///
/// Every chunk but the last is exactly `max_seq_len` long. Empty input
/// yields no chunks. A `max_seq_len` of zero is treated as one.
pub fn chunk(ids: &TokenSequence, max_seq_len: usize) -> Vec<Chunk> {
    let width = max_seq_len.max(1);
    let len = ids.len();

    (0..len)
        .step_by(width)
        .map(|start| Chunk {
            source: Arc::clone(&ids.ids),
            start,
            end: (start + width).min(len),
        })
        .collect()
}
