//! Embedding service: one model session, sequential and concurrent batches

use super::chunker::{chunk, Chunk, TokenSequence};
use super::{EmbeddingResult, EmbeddingVector};
use crate::config::EmbeddingConfig;
use crate::engine::{InferenceEngine, InferenceSession, ModelContract, OrtEngine};
use crate::error::{EmbeddingError, Result};
use crate::pipeline::{self, WorkerContext};
use crate::tensor::TensorBuilder;
use tracing::{debug, info};

/// Turns token sequences into sentence embeddings
///
/// A service is `Open` from construction until [`close`](Self::close) (or
/// drop). Every `generate*` call on a closed service fails with
/// [`EmbeddingError::SessionClosed`].
pub struct EmbeddingService<E: InferenceEngine = OrtEngine> {
    config: EmbeddingConfig,
    context: WorkerContext<E>,
}

impl EmbeddingService<OrtEngine> {
    /// Open the ONNX model at `config.model_path`
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        Self::with_engine(config, OrtEngine::new())
    }
}

impl<E: InferenceEngine> EmbeddingService<E> {
    pub fn with_engine(config: EmbeddingConfig, engine: E) -> Result<Self> {
        config.validate()?;

        let session = InferenceSession::open(engine, ModelContract::new(&config.model_path))?;
        let builder = TensorBuilder::from_config(&config);
        info!(
            seq_len = config.seq_len,
            embed_dim = config.embed_dim,
            "Embedding service ready"
        );

        Ok(Self {
            config,
            context: WorkerContext::new(session, builder),
        })
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    pub fn session(&self) -> &InferenceSession<E> {
        self.context.session()
    }

    pub fn is_open(&self) -> bool {
        self.context.session().is_open()
    }

    /// Split `ids` into chunks of the configured sequence length
    pub fn chunk_text(&self, ids: &TokenSequence) -> Vec<Chunk> {
        chunk(ids, self.config.seq_len)
    }

    /// Embed a single sequence; IDs past `seq_len` are dropped
    pub fn generate(&self, ids: &[i64]) -> Result<EmbeddingVector> {
        self.ensure_open()?;

        let builder = self.context.builder();
        let mut io = builder.build_single(ids)?;
        self.context.session().run(&mut io)?;

        io.sentence_embeddings(builder.embed_dim())?
            .pop()
            .ok_or_else(|| {
                EmbeddingError::ShapeAssertion("model returned no embedding".to_string())
            })
    }

    /// Embed all chunks with a single inference call
    pub fn generate_batch<C: AsRef<[i64]>>(&self, chunks: &[C]) -> Result<EmbeddingResult> {
        self.ensure_open()?;
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let result =
            pipeline::embed_chunks(self.context.session(), self.context.builder(), chunks)?;
        debug!(chunks = result.len(), "Batch embedded");
        Ok(result)
    }

    /// Embed chunks with one worker thread per sub-batch of `sub_batch_size`
    ///
    /// The result is in input order whatever order the workers finish in. A
    /// `sub_batch_size` of zero runs everything as one sub-batch.
    pub fn generate_batch_concurrently<C>(
        &self,
        chunks: &[C],
        sub_batch_size: usize,
    ) -> Result<EmbeddingResult>
    where
        C: AsRef<[i64]> + Clone + Send + 'static,
    {
        self.ensure_open()?;
        pipeline::run_concurrent(&self.context, chunks, sub_batch_size)
    }

    /// Concurrent workers that have not finished yet
    pub fn in_flight_workers(&self) -> usize {
        self.context.in_flight()
    }

    /// Tensor buffers currently allocated and not yet released
    pub fn live_buffers(&self) -> usize {
        self.context.builder().tracker().live()
    }

    /// Release the model session; later calls are no-ops
    pub fn close(&self) {
        self.context.session().close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(EmbeddingError::SessionClosed)
        }
    }
}

impl<E: InferenceEngine> Drop for EmbeddingService<E> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::write_word_tokenizer;
    use crate::codec::Codec;
    use crate::engine::MockEngine;
    use std::thread;
    use std::time::{Duration, Instant};

    const SEQ_LEN: usize = 4;
    const DIM: usize = 6;

    fn config() -> EmbeddingConfig {
        EmbeddingConfig::new("models/mock.onnx")
            .with_seq_len(SEQ_LEN)
            .with_embed_dim(DIM)
    }

    fn service(engine: MockEngine) -> EmbeddingService<MockEngine> {
        EmbeddingService::with_engine(config(), engine).unwrap()
    }

    fn chunks(n: i64) -> Vec<Vec<i64>> {
        (0..n)
            .map(|i| (0..(i % SEQ_LEN as i64) + 1).map(|j| i * 10 + j + 1).collect())
            .collect()
    }

    fn wait_for_workers(service: &EmbeddingService<MockEngine>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while service.in_flight_workers() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_generate_single() {
        let service = service(MockEngine::new());

        let vector = service.generate(&[3, 1, 4]).unwrap();

        assert_eq!(vector, MockEngine::expected_embedding(&[3, 1, 4], SEQ_LEN, DIM));
    }

    #[test]
    fn test_generate_truncates() {
        let service = service(MockEngine::new());

        let long = service.generate(&[1, 2, 3, 4, 5, 6]).unwrap();
        let short = service.generate(&[1, 2, 3, 4]).unwrap();

        assert_eq!(long, short);
    }

    #[test]
    fn test_generate_batch_order() {
        let service = service(MockEngine::new());
        let input = chunks(5);

        let result = service.generate_batch(&input).unwrap();

        assert_eq!(result.len(), 5);
        for (chunk, vector) in input.iter().zip(&result) {
            assert_eq!(vector, &MockEngine::expected_embedding(chunk, SEQ_LEN, DIM));
        }
        assert_eq!(service.live_buffers(), 0);
    }

    #[test]
    fn test_sequential_matches_single_sub_batch() {
        let engine = MockEngine::new();
        let service = service(engine.clone());
        let input = chunks(6);

        let sequential = service.generate_batch(&input).unwrap();
        let concurrent = service
            .generate_batch_concurrently(&input, input.len())
            .unwrap();

        assert_eq!(sequential, concurrent);
        assert_eq!(engine.runs(), 2);
    }

    #[test]
    fn test_uneven_sub_batches_match_sequential() {
        let engine = MockEngine::new();
        let service = service(engine.clone());
        let input = chunks(7);

        let sequential = service.generate_batch(&input).unwrap();
        let concurrent = service.generate_batch_concurrently(&input, 3).unwrap();

        assert_eq!(concurrent.len(), 7);
        assert_eq!(sequential, concurrent);
        // 1 sequential run + sub-batches of 3, 3 and 1
        assert_eq!(engine.runs(), 4);
    }

    #[test]
    fn test_out_of_order_completion() {
        let service = service(MockEngine::new().with_delay(Duration::from_millis(10)));
        let input: Vec<Vec<i64>> = (0..8).map(|i| vec![i, i + 100]).collect();

        let sequential = service.generate_batch(&input).unwrap();
        let concurrent = service.generate_batch_concurrently(&input, 1).unwrap();

        assert_eq!(sequential, concurrent);
    }

    #[test]
    fn test_zero_sub_batch_size_runs_once() {
        let engine = MockEngine::new();
        let service = service(engine.clone());

        let result = service.generate_batch_concurrently(&chunks(5), 0).unwrap();

        assert_eq!(result.len(), 5);
        assert_eq!(engine.runs(), 1);
    }

    #[test]
    fn test_concurrent_with_chunk_views() {
        let service = service(MockEngine::new());
        let ids: TokenSequence = (1..=10).collect();
        let views = service.chunk_text(&ids);

        let result = service.generate_batch_concurrently(&views, 2).unwrap();

        assert_eq!(views.len(), 3);
        assert_eq!(
            result[2],
            MockEngine::expected_embedding(&[9, 10], SEQ_LEN, DIM)
        );
    }

    #[test]
    fn test_failing_sub_batch_returns_error_without_leaks() {
        // Healthy sub-batches sleep at least 200ms; the failing one fails at once
        let engine = MockEngine::new()
            .failing_on_token(999)
            .with_delay(Duration::from_millis(200));
        let service = service(engine);
        let mut input = chunks(12);
        input[7] = vec![999];

        let result = service.generate_batch_concurrently(&input, 2);

        assert!(matches!(result, Err(EmbeddingError::Engine(_))));
        assert!(service.in_flight_workers() > 0);

        wait_for_workers(&service);
        assert_eq!(service.in_flight_workers(), 0);
        assert_eq!(service.live_buffers(), 0);
    }

    #[test]
    fn test_sequential_failure_propagates() {
        let service = service(MockEngine::new().failing_on_token(999));

        let result = service.generate_batch(&[vec![1i64], vec![999]]);

        assert!(matches!(result, Err(EmbeddingError::Engine(_))));
        assert_eq!(service.live_buffers(), 0);
    }

    #[test]
    fn test_malformed_output_propagates() {
        let service = service(MockEngine::new().with_malformed_output());
        let input = chunks(5);

        let sequential = service.generate_batch(&input);
        assert!(matches!(sequential, Err(EmbeddingError::ShapeAssertion(_))));
        assert_eq!(service.live_buffers(), 0);

        let concurrent = service.generate_batch_concurrently(&input, 2);
        assert!(matches!(concurrent, Err(EmbeddingError::ShapeAssertion(_))));
        wait_for_workers(&service);
        assert_eq!(service.live_buffers(), 0);
    }

    #[test]
    fn test_allocation_limit_propagates() {
        let config = config().with_max_buffer_elements(SEQ_LEN * DIM);
        let service = EmbeddingService::with_engine(config, MockEngine::new()).unwrap();

        // token_embeddings for two rows exceeds the cap
        let result = service.generate_batch(&[vec![1i64], vec![2]]);

        assert!(matches!(result, Err(EmbeddingError::Allocation(_))));
        assert_eq!(service.live_buffers(), 0);
    }

    #[test]
    fn test_empty_input() {
        let engine = MockEngine::new();
        let service = service(engine.clone());
        let empty: Vec<Vec<i64>> = Vec::new();

        assert!(service.generate_batch(&empty).unwrap().is_empty());
        assert!(service.generate_batch_concurrently(&empty, 4).unwrap().is_empty());
        assert_eq!(engine.runs(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let engine = MockEngine::new();
        let result = EmbeddingService::with_engine(config().with_seq_len(0), engine.clone());

        assert!(matches!(result, Err(EmbeddingError::Configuration(_))));
        assert_eq!(engine.opens(), 0);
    }

    #[test]
    fn test_open_failure() {
        let result = EmbeddingService::with_engine(config(), MockEngine::new().failing_open());
        assert!(matches!(result, Err(EmbeddingError::Configuration(_))));
    }

    #[test]
    fn test_generate_after_close() {
        let service = service(MockEngine::new());
        service.close();

        assert!(!service.is_open());
        assert_eq!(service.generate(&[1]), Err(EmbeddingError::SessionClosed));
        assert_eq!(
            service.generate_batch(&[vec![1i64]]),
            Err(EmbeddingError::SessionClosed)
        );
        assert_eq!(
            service.generate_batch_concurrently(&[vec![1i64]], 1),
            Err(EmbeddingError::SessionClosed)
        );
    }

    #[test]
    fn test_double_close_releases_once() {
        let engine = MockEngine::new();
        let service = service(engine.clone());

        service.close();
        service.close();
        drop(service);

        assert_eq!(engine.closes(), 1);
    }

    #[test]
    fn test_end_to_end_with_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_word_tokenizer(dir.path(), &["the", "quick", "brown", "fox", "jumps"]);
        let codec = Codec::load(&path).unwrap();
        let service = service(MockEngine::new());

        let ids = codec.encode("the quick brown fox jumps over the fox").unwrap();
        let views = service.chunk_text(&ids);
        let result = service.generate_batch_concurrently(&views, 1).unwrap();

        assert_eq!(ids.as_slice(), &[1, 2, 3, 4, 5, 0, 1, 4]);
        assert_eq!(result.len(), 2);
        assert_eq!(
            result[1],
            MockEngine::expected_embedding(&[5, 0, 1, 4], SEQ_LEN, DIM)
        );
    }
}
