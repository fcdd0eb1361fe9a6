//! Error type shared by every layer of the embedding core

use thiserror::Error;

/// Errors that can occur while chunking, building tensors or running inference
///
/// The enum is `Clone` because a failed sub-batch reports the same error once
/// for every chunk it owns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Inference failed: {0}")]
    Engine(String),

    #[error("Unexpected output tensor: {0}")]
    ShapeAssertion(String),

    #[error("Inference session is closed")]
    SessionClosed,

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Worker lost: {0}")]
    WorkerLost(String),
}

impl EmbeddingError {
    /// True for failures raised by the inference engine itself
    pub fn is_engine_failure(&self) -> bool {
        matches!(self, Self::Engine(_) | Self::ShapeAssertion(_))
    }
}

impl From<ort::Error> for EmbeddingError {
    fn from(e: ort::Error) -> Self {
        Self::Engine(e.to_string())
    }
}

impl From<std::io::Error> for EmbeddingError {
    fn from(e: std::io::Error) -> Self {
        Self::Configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;
