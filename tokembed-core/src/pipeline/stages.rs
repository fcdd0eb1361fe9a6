//! Worker implementations for the concurrent pass

use super::messages::WorkerReport;
use crate::embeddings::EmbeddingVector;
use crate::engine::{InferenceEngine, InferenceSession};
use crate::error::Result;
use crate::tensor::TensorBuilder;
use crossbeam_channel::Sender;
use tracing::{debug, error, warn};

/// A run of consecutive chunks starting at `start` in the caller's list
#[derive(Debug, Clone)]
pub struct SubBatch<C> {
    pub start: usize,
    pub chunks: Vec<C>,
}

impl<C> SubBatch<C> {
    pub fn new(start: usize, chunks: Vec<C>) -> Self {
        Self { start, chunks }
    }

    /// Index one past the last chunk
    pub fn end(&self) -> usize {
        self.start + self.chunks.len()
    }
}

/// Build, run and slice one batch
///
/// The `IoSet` is dropped before this returns, on success and on error.
pub fn embed_chunks<E, C>(
    session: &InferenceSession<E>,
    builder: &TensorBuilder,
    chunks: &[C],
) -> Result<Vec<EmbeddingVector>>
where
    E: InferenceEngine,
    C: AsRef<[i64]>,
{
    let mut io = builder.build_batch(chunks)?;
    debug!(batch_size = io.batch_size(), "Created tensors");

    session.run(&mut io)?;
    let vectors = io.sentence_embeddings(builder.embed_dim())?;

    drop(io);
    debug!(batch_size = vectors.len(), "Released tensors");
    Ok(vectors)
}

/// Embed one sub-batch and report every chunk to the collector
///
/// Sends exactly `batch.chunks.len()` reports unless the collector has
/// already gone away. A failure is reported once per chunk.
pub fn embed_worker<E, C>(
    session: &InferenceSession<E>,
    builder: &TensorBuilder,
    batch: SubBatch<C>,
    tx: Sender<WorkerReport>,
) where
    E: InferenceEngine,
    C: AsRef<[i64]>,
{
    let (start, end) = (batch.start, batch.end());
    debug!(start, end, "Worker started");

    let reports: Vec<WorkerReport> = match embed_chunks(session, builder, &batch.chunks) {
        Ok(vectors) => {
            debug!(start, end, "Inference complete");
            vectors
                .into_iter()
                .enumerate()
                .map(|(offset, vector)| WorkerReport::success(start + offset, vector))
                .collect()
        }
        Err(e) => {
            error!(start, end, error = %e, "Sub-batch failed");
            (start..end)
                .map(|index| WorkerReport::failure(index, e.clone()))
                .collect()
        }
    };

    for report in reports {
        let index = report.index;
        if tx.send(report).is_err() {
            // Collector already returned
            warn!(start, end, index, "Collector gone, discarding reports");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockEngine, ModelContract};
    use crate::error::EmbeddingError;
    use crossbeam_channel::bounded;

    fn setup(engine: MockEngine) -> (InferenceSession<MockEngine>, TensorBuilder) {
        let session = InferenceSession::open(engine, ModelContract::new("m.onnx")).unwrap();
        (session, TensorBuilder::new(4, 3))
    }

    #[test]
    fn test_sub_batch_end() {
        let batch = SubBatch::new(6, vec![vec![1i64], vec![2], vec![3]]);
        assert_eq!(batch.end(), 9);
    }

    #[test]
    fn test_embed_chunks_releases_buffers() {
        let (session, builder) = setup(MockEngine::new());

        let vectors = embed_chunks(&session, &builder, &[vec![1i64, 2], vec![3]]).unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], MockEngine::expected_embedding(&[3], 4, 3));
        assert_eq!(builder.tracker().live(), 0);
        assert_eq!(builder.tracker().total(), 4);
    }

    #[test]
    fn test_worker_reports_global_indices() {
        let (session, builder) = setup(MockEngine::new());
        let (tx, rx) = bounded(2);

        embed_worker(&session, &builder, SubBatch::new(4, vec![vec![5i64], vec![6]]), tx);

        let reports: Vec<WorkerReport> = rx.iter().collect();
        let indices: Vec<usize> = reports.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![4, 5]);
        assert_eq!(
            reports[1].result,
            Ok(MockEngine::expected_embedding(&[6], 4, 3))
        );
    }

    #[test]
    fn test_worker_reports_failure_per_chunk() {
        let (session, builder) = setup(MockEngine::new().failing_on_token(9));
        let (tx, rx) = bounded(3);

        embed_worker(
            &session,
            &builder,
            SubBatch::new(0, vec![vec![1i64], vec![9], vec![2]]),
            tx,
        );

        let reports: Vec<WorkerReport> = rx.iter().collect();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.is_failure()));
        assert!(matches!(reports[0].result, Err(EmbeddingError::Engine(_))));
        assert_eq!(builder.tracker().live(), 0);
    }

    #[test]
    fn test_worker_survives_missing_collector() {
        let (session, builder) = setup(MockEngine::new());
        let (tx, rx) = bounded(2);
        drop(rx);

        embed_worker(&session, &builder, SubBatch::new(0, vec![vec![1i64], vec![2]]), tx);

        assert_eq!(builder.tracker().live(), 0);
    }
}
