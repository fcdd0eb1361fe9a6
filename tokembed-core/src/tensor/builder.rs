//! Padded input and empty output tensor construction
//!
//! Chunks longer than `seq_len` are truncated: only the first `seq_len` IDs
//! reach the model and the rest are dropped without an error.

use super::{AllocationTracker, IoSet, TensorBuffer};
use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, Result};

/// Builds [`IoSet`]s of a fixed sequence length and embedding dimension
#[derive(Debug, Clone)]
pub struct TensorBuilder {
    seq_len: usize,
    embed_dim: usize,
    max_elements: usize,
    tracker: AllocationTracker,
}

impl TensorBuilder {
    pub fn new(seq_len: usize, embed_dim: usize) -> Self {
        Self {
            seq_len,
            embed_dim,
            max_elements: usize::MAX,
            tracker: AllocationTracker::new(),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(config.seq_len, config.embed_dim).with_max_elements(config.max_buffer_elements)
    }

    /// Cap the element count of any single buffer
    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = max_elements;
        self
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    /// Build the tensors for one sequence (batch size 1)
    pub fn build_single(&self, ids: &[i64]) -> Result<IoSet> {
        self.build_batch(&[ids])
    }

    /// Build the tensors for a batch of chunks, one row per chunk
    ///
    /// If any allocation fails, the buffers created so far are dropped before
    /// the error is returned.
    pub fn build_batch<C: AsRef<[i64]>>(&self, chunks: &[C]) -> Result<IoSet> {
        let batch_size = chunks.len();
        if batch_size == 0 {
            return Err(EmbeddingError::Allocation("batch is empty".to_string()));
        }

        let input_shape = [batch_size, self.seq_len];
        let mut input_ids = self.allocate::<i64>(&input_shape)?;
        let mut attention_mask = self.allocate::<i64>(&input_shape)?;

        for (row, chunk) in chunks.iter().enumerate() {
            let ids = chunk.as_ref();
            let n = ids.len().min(self.seq_len);
            let offset = row * self.seq_len;

            input_ids.as_mut_slice()[offset..offset + n].copy_from_slice(&ids[..n]);
            attention_mask.as_mut_slice()[offset..offset + n].fill(1);
        }

        let token_embeddings =
            self.allocate::<f32>(&[batch_size, self.seq_len, self.embed_dim])?;
        let sentence_embedding = self.allocate::<f32>(&[batch_size, self.embed_dim])?;

        Ok(IoSet {
            batch_size,
            input_ids,
            attention_mask,
            token_embeddings,
            sentence_embedding,
        })
    }

    fn allocate<T: Clone + Default>(&self, shape: &[usize]) -> Result<TensorBuffer<T>> {
        TensorBuffer::zeroed(&self.tracker, shape, self.max_elements)
    }
}
