pub mod codec;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod tensor;

pub use codec::Codec;
pub use config::EmbeddingConfig;
pub use embeddings::{
    chunk, Chunk, EmbeddingResult, EmbeddingService, EmbeddingVector, TokenSequence,
};
pub use engine::{InferenceEngine, InferenceSession, MockEngine, ModelContract, OrtEngine};
pub use error::{EmbeddingError, Result};
pub use tensor::{IoSet, TensorBuilder};
