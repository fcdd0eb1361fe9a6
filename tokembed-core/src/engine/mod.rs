//! Inference engine abstraction
//!
//! Provides a trait for inference backends with implementations for:
//! - OrtEngine: ONNX Runtime through the `ort` crate
//! - MockEngine: deterministic in-memory engine for testing
//!
//! [`InferenceSession`] owns the engine handle for the lifetime of a service
//! and releases it exactly once.

pub mod mock;
pub mod onnx;

pub use mock::MockEngine;
pub use onnx::OrtEngine;

use crate::error::{EmbeddingError, Result};
use crate::tensor::{IoSet, ATTENTION_MASK, INPUT_IDS, SENTENCE_EMBEDDING, TOKEN_EMBEDDINGS};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

/// Model file plus the fixed tensor names it is run with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelContract {
    pub model_path: PathBuf,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
}

impl ModelContract {
    /// Contract for a sentence-embedding model with the standard tensor names
    pub fn new(model_path: impl AsRef<Path>) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            input_names: vec![INPUT_IDS.to_string(), ATTENTION_MASK.to_string()],
            output_names: vec![TOKEN_EMBEDDINGS.to_string(), SENTENCE_EMBEDDING.to_string()],
        }
    }
}

/// Trait for inference backends
///
/// `run` may be called from several threads at once with the same handle.
/// Backends that cannot run concurrently on one handle must serialize
/// internally.
pub trait InferenceEngine: Send + Sync + 'static {
    /// Execution context bound to one model
    type Handle: Send + Sync + 'static;

    /// Load the model and create an execution context
    fn open(&self, contract: &ModelContract) -> Result<Self::Handle>;

    /// Run inference, filling the output buffers of `io` in place
    ///
    /// After an error the outputs are in an undefined state.
    fn run(&self, handle: &Self::Handle, io: &mut IoSet) -> Result<()>;

    /// Release the execution context
    fn close(&self, handle: Self::Handle);
}

/// A live execution context: `open` once, `run` many times, `close` once
pub struct InferenceSession<E: InferenceEngine> {
    engine: E,
    contract: ModelContract,
    handle: RwLock<Option<E::Handle>>,
}

impl<E: InferenceEngine> InferenceSession<E> {
    pub fn open(engine: E, contract: ModelContract) -> Result<Self> {
        let handle = engine.open(&contract)?;
        info!(model = %contract.model_path.display(), "Opened inference session");

        Ok(Self {
            engine,
            contract,
            handle: RwLock::new(Some(handle)),
        })
    }

    /// Run one inference call; blocks until the engine returns
    pub fn run(&self, io: &mut IoSet) -> Result<()> {
        let guard = self
            .handle
            .read()
            .map_err(|_| EmbeddingError::Engine("session lock poisoned".to_string()))?;
        let handle = guard.as_ref().ok_or(EmbeddingError::SessionClosed)?;
        self.engine.run(handle, io)
    }

    /// Release the execution context; later calls are no-ops
    ///
    /// Waits for runs already in progress to finish.
    pub fn close(&self) {
        let taken = match self.handle.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = taken {
            self.engine.close(handle);
            info!(model = %self.contract.model_path.display(), "Closed inference session");
        }
    }

    pub fn is_open(&self) -> bool {
        match self.handle.read() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    pub fn contract(&self) -> &ModelContract {
        &self.contract
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }
}

impl<E: InferenceEngine> Drop for InferenceSession<E> {
    fn drop(&mut self) {
        self.close();
    }
}
