//! Tensor buffers exchanged with the inference engine
//!
//! Every buffer holds a lease on an [`AllocationTracker`]. Dropping the buffer
//! returns the lease, so a tracker that reads zero proves that no buffer from
//! any call is still alive.

pub mod builder;

pub use builder::TensorBuilder;

use crate::embeddings::EmbeddingVector;
use crate::error::{EmbeddingError, Result};
use ndarray::{ArrayView2, ArrayViewD, Ix2, IxDyn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Input tensor carrying padded token IDs
pub const INPUT_IDS: &str = "input_ids";
/// Input tensor marking real tokens (1) and padding (0)
pub const ATTENTION_MASK: &str = "attention_mask";
/// Per-token output, shaped `[batch, seq_len, embed_dim]`
pub const TOKEN_EMBEDDINGS: &str = "token_embeddings";
/// Pooled output, shaped `[batch, embed_dim]`
pub const SENTENCE_EMBEDDING: &str = "sentence_embedding";

/// Counts tensor buffers that were allocated and not yet released
#[derive(Debug, Clone, Default)]
pub struct AllocationTracker {
    live: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers currently alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Buffers ever allocated through this tracker
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn lease(&self) -> Lease {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        Lease {
            live: Arc::clone(&self.live),
        }
    }
}

#[derive(Debug)]
struct Lease {
    live: Arc<AtomicUsize>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Rectangular buffer: a shape plus a flat, row-major element array
#[derive(Debug)]
pub struct TensorBuffer<T> {
    shape: Vec<usize>,
    data: Vec<T>,
    _lease: Lease,
}

impl<T: Clone + Default> TensorBuffer<T> {
    /// Allocate a zeroed buffer of the given shape
    pub(crate) fn zeroed(
        tracker: &AllocationTracker,
        shape: &[usize],
        max_elements: usize,
    ) -> Result<Self> {
        let len = element_count(shape)?;
        if len > max_elements {
            return Err(EmbeddingError::Allocation(format!(
                "tensor {:?} needs {} elements, limit is {}",
                shape, len, max_elements
            )));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            EmbeddingError::Allocation(format!("tensor {:?}: {}", shape, e))
        })?;
        data.resize(len, T::default());

        Ok(Self {
            shape: shape.to_vec(),
            data,
            _lease: tracker.lease(),
        })
    }
}

impl<T> TensorBuffer<T> {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// View the buffer as a 2-D array, failing if its rank is not 2
    pub fn view2(&self) -> Result<ArrayView2<'_, T>> {
        ArrayViewD::from_shape(IxDyn(&self.shape), self.data.as_slice())
            .and_then(|view| view.into_dimensionality::<Ix2>())
            .map_err(|e| {
                EmbeddingError::ShapeAssertion(format!("tensor {:?}: {}", self.shape, e))
            })
    }
}

fn element_count(shape: &[usize]) -> Result<usize> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(EmbeddingError::Allocation(format!(
            "invalid tensor shape {:?}",
            shape
        )));
    }
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| {
            EmbeddingError::Allocation(format!("tensor shape {:?} overflows", shape))
        })
}

/// Input and output buffers bound to one inference call
///
/// The set owns all four buffers; dropping it releases each of them once.
#[derive(Debug)]
pub struct IoSet {
    batch_size: usize,
    input_ids: TensorBuffer<i64>,
    attention_mask: TensorBuffer<i64>,
    token_embeddings: TensorBuffer<f32>,
    sentence_embedding: TensorBuffer<f32>,
}

impl IoSet {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn input_ids(&self) -> &TensorBuffer<i64> {
        &self.input_ids
    }

    pub fn attention_mask(&self) -> &TensorBuffer<i64> {
        &self.attention_mask
    }

    pub fn token_embeddings(&self) -> &TensorBuffer<f32> {
        &self.token_embeddings
    }

    pub fn sentence_embedding(&self) -> &TensorBuffer<f32> {
        &self.sentence_embedding
    }

    /// Inputs in contract order: `input_ids`, `attention_mask`
    pub fn inputs(&self) -> [&TensorBuffer<i64>; 2] {
        [&self.input_ids, &self.attention_mask]
    }

    /// Outputs in contract order: `token_embeddings`, `sentence_embedding`
    pub fn outputs_mut(&mut self) -> [&mut TensorBuffer<f32>; 2] {
        [&mut self.token_embeddings, &mut self.sentence_embedding]
    }

    /// Copy one sentence embedding per batch row out of the output buffer
    pub fn sentence_embeddings(&self, embed_dim: usize) -> Result<Vec<EmbeddingVector>> {
        let view = self.sentence_embedding.view2()?;
        if view.dim() != (self.batch_size, embed_dim) {
            return Err(EmbeddingError::ShapeAssertion(format!(
                "{} has shape {:?}, expected [{}, {}]",
                SENTENCE_EMBEDDING,
                view.shape(),
                self.batch_size,
                embed_dim
            )));
        }
        Ok(view.outer_iter().map(|row| row.to_vec()).collect())
    }
}
