//! Deterministic in-memory inference engine for testing

use super::{InferenceEngine, ModelContract};
use crate::error::{EmbeddingError, Result};
use crate::tensor::IoSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    runs: AtomicUsize,
}

/// Mock engine (returns deterministic embeddings)
///
/// The sentence embedding of a row depends only on that row's real tokens,
/// so the same chunk yields the same vector whatever batch it is run in.
/// Clones share their counters.
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    counters: Arc<Counters>,
    fail_open: bool,
    poison_token: Option<i64>,
    panic_token: Option<i64>,
    malformed_output: bool,
    delay: Option<Duration>,
}

/// Handle returned by [`MockEngine::open`]
#[derive(Debug)]
pub struct MockHandle {
    pub contract: ModelContract,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `open` fail as if the model file were missing
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Make `run` fail for any batch containing `token` as a real token
    pub fn failing_on_token(mut self, token: i64) -> Self {
        self.poison_token = Some(token);
        self
    }

    /// Make `run` panic for any batch containing `token` as a real token
    pub fn panicking_on_token(mut self, token: i64) -> Self {
        self.panic_token = Some(token);
        self
    }

    /// Make `run` reject every batch as if the output had the wrong shape
    pub fn with_malformed_output(mut self) -> Self {
        self.malformed_output = true;
        self
    }

    /// Sleep before each successful run, between one and four times `delay`
    /// depending on the batch's first token, so concurrent runs finish out of
    /// order
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Successful and failed runs alike
    pub fn runs(&self) -> usize {
        self.counters.runs.load(Ordering::SeqCst)
    }

    /// The sentence embedding this engine produces for one chunk
    pub fn expected_embedding(ids: &[i64], seq_len: usize, embed_dim: usize) -> Vec<f32> {
        let ids = &ids[..ids.len().min(seq_len)];
        let checksum: i64 = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| id.wrapping_mul(i as i64 + 1))
            .fold(0i64, i64::wrapping_add);
        let base = (checksum % 100_000) as f32;

        (0..embed_dim)
            .map(|d| base + ids.len() as f32 * 0.5 + d as f32 * 0.25)
            .collect()
    }

    fn pause(&self, io: &IoSet) {
        if let Some(delay) = self.delay {
            let first = io.input_ids().as_slice().first().copied().unwrap_or(0);
            let factor = 4 - first.rem_euclid(4) as u32;
            thread::sleep(delay * factor);
        }
    }
}

impl InferenceEngine for MockEngine {
    type Handle = MockHandle;

    fn open(&self, contract: &ModelContract) -> Result<MockHandle> {
        if self.fail_open {
            return Err(EmbeddingError::Configuration(format!(
                "model file not found at {}",
                contract.model_path.display()
            )));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockHandle {
            contract: contract.clone(),
        })
    }

    fn run(&self, _handle: &MockHandle, io: &mut IoSet) -> Result<()> {
        self.counters.runs.fetch_add(1, Ordering::SeqCst);

        let ids = io.input_ids().view2()?;
        let mask = io.attention_mask().view2()?;
        let (batch, seq_len) = ids.dim();
        let embed_dim = io.sentence_embedding().shape().last().copied().unwrap_or(0);

        let mut rows = Vec::with_capacity(batch);
        for (row_ids, row_mask) in ids.outer_iter().zip(mask.outer_iter()) {
            let real: Vec<i64> = row_ids
                .iter()
                .zip(row_mask.iter())
                .filter(|&(_, &m)| m == 1)
                .map(|(&id, _)| id)
                .collect();

            if let Some(poison) = self.poison_token {
                if real.contains(&poison) {
                    return Err(EmbeddingError::Engine(format!(
                        "mock failure on token {}",
                        poison
                    )));
                }
            }
            if let Some(token) = self.panic_token {
                if real.contains(&token) {
                    panic!("mock panic on token {}", token);
                }
            }
            rows.push(real);
        }

        if self.malformed_output {
            return Err(EmbeddingError::ShapeAssertion(format!(
                "sentence_embedding has shape [{}, {}], expected [{}, {}]",
                batch,
                embed_dim + 1,
                batch,
                embed_dim
            )));
        }

        // Failures above return without waiting
        self.pause(io);

        let [token_embeddings, sentence_embedding] = io.outputs_mut();

        for (row, real) in rows.iter().enumerate() {
            let token_offset = row * seq_len * embed_dim;
            for (pos, &id) in real.iter().enumerate() {
                let start = token_offset + pos * embed_dim;
                token_embeddings.as_mut_slice()[start..start + embed_dim].fill(id as f32);
            }

            let embedding = Self::expected_embedding(real, seq_len, embed_dim);
            let start = row * embed_dim;
            sentence_embedding.as_mut_slice()[start..start + embed_dim]
                .copy_from_slice(&embedding);
        }

        Ok(())
    }

    fn close(&self, _handle: MockHandle) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}
