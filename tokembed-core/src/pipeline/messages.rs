//! Worker to collector message types

use crate::embeddings::EmbeddingVector;
use crate::error::{EmbeddingError, Result};

/// Outcome for one chunk, tagged with its index in the caller's chunk list
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub index: usize,
    pub result: Result<EmbeddingVector>,
}

impl WorkerReport {
    pub fn success(index: usize, vector: EmbeddingVector) -> Self {
        Self {
            index,
            result: Ok(vector),
        }
    }

    pub fn failure(index: usize, error: EmbeddingError) -> Self {
        Self {
            index,
            result: Err(error),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }
}
