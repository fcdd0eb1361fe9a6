//! Embeddings module
//!
//! Splits token sequences into bounded chunks and turns them into sentence
//! embeddings through batched inference.

pub mod chunker;
pub mod service;

pub use chunker::{chunk, Chunk, TokenSequence};
pub use service::EmbeddingService;

/// One sentence embedding, `embed_dim` values long
pub type EmbeddingVector = Vec<f32>;

/// Embeddings aligned by index with the chunks they were computed from
pub type EmbeddingResult = Vec<EmbeddingVector>;
