//! Concurrent fan-out of sub-batches over one inference session
//!
//! Each sub-batch gets its own worker thread and reports per-chunk results
//! over a crossbeam channel to a collector that restores input order:
//! 1. Partition - consecutive sub-batches of a fixed width
//! 2. Workers - build, run and slice one sub-batch each
//! 3. Collect - place each vector at its original index
//!
//! The number of workers is not capped and workers are never cancelled. When
//! the collector returns early on an error, the remaining workers run to
//! completion and release their own buffers.

pub mod messages;
pub mod stages;

pub use messages::WorkerReport;
pub use stages::{embed_chunks, SubBatch};

use crate::embeddings::EmbeddingResult;
use crate::engine::{InferenceEngine, InferenceSession};
use crate::error::{EmbeddingError, Result};
use crate::tensor::TensorBuilder;
use crossbeam_channel::bounded;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// Split `len` items into consecutive ranges of `width`
///
/// The last range may be shorter. A `width` of zero yields one range
/// covering everything.
pub fn partition(len: usize, width: usize) -> Vec<Range<usize>> {
    let width = if width == 0 { len.max(1) } else { width };
    (0..len)
        .step_by(width)
        .map(|start| start..(start + width).min(len))
        .collect()
}

/// Shared state every worker needs
pub struct WorkerContext<E: InferenceEngine> {
    session: Arc<InferenceSession<E>>,
    builder: Arc<TensorBuilder>,
    in_flight: Arc<AtomicUsize>,
}

impl<E: InferenceEngine> Clone for WorkerContext<E> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            builder: Arc::clone(&self.builder),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<E: InferenceEngine> WorkerContext<E> {
    pub fn new(session: InferenceSession<E>, builder: TensorBuilder) -> Self {
        Self {
            session: Arc::new(session),
            builder: Arc::new(builder),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn session(&self) -> &InferenceSession<E> {
        &self.session
    }

    pub fn builder(&self) -> &TensorBuilder {
        &self.builder
    }

    /// Workers spawned by [`run_concurrent`] that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Counts a worker as running until dropped
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Embed `chunks` with one worker thread per sub-batch of `sub_batch_size`
///
/// Returns one vector per chunk in input order, or the first error any
/// worker reports.
pub fn run_concurrent<E, C>(
    context: &WorkerContext<E>,
    chunks: &[C],
    sub_batch_size: usize,
) -> Result<EmbeddingResult>
where
    E: InferenceEngine,
    C: AsRef<[i64]> + Clone + Send + 'static,
{
    let total = chunks.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    // Capacity for every report, so no worker ever blocks on send
    let (tx, rx) = bounded::<WorkerReport>(total);

    let ranges = partition(total, sub_batch_size);
    debug!(chunks = total, workers = ranges.len(), "Spawning workers");

    for range in ranges {
        let batch = SubBatch::new(range.start, chunks[range.clone()].to_vec());
        let worker = context.clone();
        let tx = tx.clone();
        let guard = InFlight::enter(&context.in_flight);

        thread::Builder::new()
            .name(format!("tokembed-worker-{}", range.start))
            .spawn(move || {
                let _guard = guard;
                stages::embed_worker(&worker.session, &worker.builder, batch, tx);
            })
            .map_err(|e| EmbeddingError::WorkerLost(format!("failed to spawn worker: {}", e)))?;
    }
    // Workers hold the only senders now
    drop(tx);

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; total];
    for _ in 0..total {
        let report = rx.recv().map_err(|_| {
            EmbeddingError::WorkerLost("worker exited without reporting".to_string())
        })?;
        let vector = report.result?;
        slots[report.index] = Some(vector);
    }

    let result = slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| EmbeddingError::WorkerLost(format!("no report for chunk {}", index)))
        })
        .collect::<Result<EmbeddingResult>>()?;

    info!(chunks = total, "All batches processed successfully");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockEngine, ModelContract};
    use std::time::{Duration, Instant};

    fn context(engine: MockEngine) -> WorkerContext<MockEngine> {
        let session = InferenceSession::open(engine, ModelContract::new("m.onnx")).unwrap();
        WorkerContext::new(session, TensorBuilder::new(4, 3))
    }

    fn chunks(n: i64) -> Vec<Vec<i64>> {
        (0..n).map(|i| vec![i + 1, i * 3 + 2]).collect()
    }

    fn wait_for_workers(context: &WorkerContext<MockEngine>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while context.in_flight() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_partition_uneven() {
        assert_eq!(partition(7, 3), vec![0..3, 3..6, 6..7]);
    }

    #[test]
    fn test_partition_even() {
        assert_eq!(partition(6, 2), vec![0..2, 2..4, 4..6]);
    }

    #[test]
    fn test_partition_wider_than_input() {
        assert_eq!(partition(2, 10), vec![0..2]);
    }

    #[test]
    fn test_partition_zero_width() {
        assert_eq!(partition(5, 0), vec![0..5]);
        assert!(partition(0, 0).is_empty());
    }

    #[test]
    fn test_run_concurrent_preserves_order() {
        let context = context(MockEngine::new());
        let input = chunks(7);

        let result = run_concurrent(&context, &input, 3).unwrap();

        assert_eq!(result.len(), 7);
        for (chunk, vector) in input.iter().zip(&result) {
            assert_eq!(vector, &MockEngine::expected_embedding(chunk, 4, 3));
        }
    }

    #[test]
    fn test_run_concurrent_empty() {
        let engine = MockEngine::new();
        let context = context(engine.clone());

        let result = run_concurrent::<_, Vec<i64>>(&context, &[], 2).unwrap();

        assert!(result.is_empty());
        assert_eq!(engine.runs(), 0);
    }

    #[test]
    fn test_run_concurrent_one_worker_per_sub_batch() {
        let engine = MockEngine::new();
        let context = context(engine.clone());

        run_concurrent(&context, &chunks(10), 4).unwrap();

        assert_eq!(engine.runs(), 3);
    }

    #[test]
    fn test_failure_releases_every_buffer() {
        let engine = MockEngine::new()
            .failing_on_token(5)
            .with_delay(Duration::from_millis(5));
        let context = context(engine);
        let mut input = chunks(9);
        input[4] = vec![5];

        let result = run_concurrent(&context, &input, 2);
        assert!(matches!(result, Err(EmbeddingError::Engine(_))));

        wait_for_workers(&context);
        assert_eq!(context.in_flight(), 0);
        assert_eq!(context.builder().tracker().live(), 0);
    }

    #[test]
    fn test_worker_panic_reports_worker_lost() {
        let context = context(MockEngine::new().panicking_on_token(77));
        let input = vec![vec![1i64], vec![77], vec![3], vec![4]];

        let started = Instant::now();
        let result = run_concurrent(&context, &input, 1);

        assert!(matches!(result, Err(EmbeddingError::WorkerLost(_))));
        assert!(started.elapsed() < Duration::from_secs(5));

        wait_for_workers(&context);
        assert_eq!(context.in_flight(), 0);
        assert_eq!(context.builder().tracker().live(), 0);
    }

    #[test]
    fn test_malformed_output_propagates() {
        let context = context(MockEngine::new().with_malformed_output());

        let result = run_concurrent(&context, &chunks(5), 2);

        assert!(matches!(result, Err(EmbeddingError::ShapeAssertion(_))));
        wait_for_workers(&context);
        assert_eq!(context.builder().tracker().live(), 0);
    }
}
