//! Embedding service configuration

use crate::error::{EmbeddingError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default maximum sequence length (tokens per chunk)
pub const DEFAULT_SEQ_LEN: usize = 512;

/// Default sentence embedding dimension
pub const DEFAULT_EMBED_DIM: usize = 768;

/// Default ceiling on the element count of a single tensor buffer
pub const DEFAULT_MAX_BUFFER_ELEMENTS: usize = 1 << 31;

/// Environment variable holding the ONNX model path
pub const ENV_MODEL_PATH: &str = "TOKEMBED_MODEL";
/// Environment variable overriding the sequence length
pub const ENV_SEQ_LEN: &str = "TOKEMBED_SEQ_LEN";
/// Environment variable overriding the embedding dimension
pub const ENV_EMBED_DIM: &str = "TOKEMBED_EMBED_DIM";

/// Configuration for the embedding service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Path to the ONNX model file
    pub model_path: PathBuf,
    /// Maximum sequence length; longer chunks are truncated
    pub seq_len: usize,
    /// Sentence embedding dimension produced by the model
    pub embed_dim: usize,
    /// Largest number of elements a single tensor buffer may hold
    pub max_buffer_elements: usize,
}

impl EmbeddingConfig {
    /// Create a config for the given model with default dimensions
    pub fn new(model_path: impl AsRef<Path>) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_seq_len(mut self, seq_len: usize) -> Self {
        self.seq_len = seq_len;
        self
    }

    pub fn with_embed_dim(mut self, embed_dim: usize) -> Self {
        self.embed_dim = embed_dim;
        self
    }

    pub fn with_max_buffer_elements(mut self, max: usize) -> Self {
        self.max_buffer_elements = max;
        self
    }

    /// Build a config from `TOKEMBED_*` environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (used by `from_env`)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_MODEL_PATH) {
            config.model_path = PathBuf::from(path);
        }
        if let Some(value) = lookup(ENV_SEQ_LEN) {
            config.seq_len = parse_dimension(ENV_SEQ_LEN, &value)?;
        }
        if let Some(value) = lookup(ENV_EMBED_DIM) {
            config.embed_dim = parse_dimension(ENV_EMBED_DIM, &value)?;
        }

        Ok(config)
    }

    /// Load a config from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            EmbeddingError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            EmbeddingError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Check that the config can back a service
    pub fn validate(&self) -> Result<()> {
        if self.model_path.as_os_str().is_empty() {
            return Err(EmbeddingError::Configuration(
                "model path is empty".to_string(),
            ));
        }
        if self.seq_len == 0 {
            return Err(EmbeddingError::Configuration(
                "seq_len must be greater than zero".to_string(),
            ));
        }
        if self.embed_dim == 0 {
            return Err(EmbeddingError::Configuration(
                "embed_dim must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/model.onnx"),
            seq_len: DEFAULT_SEQ_LEN,
            embed_dim: DEFAULT_EMBED_DIM,
            max_buffer_elements: DEFAULT_MAX_BUFFER_ELEMENTS,
        }
    }
}

fn parse_dimension(key: &str, value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|e| {
        EmbeddingError::Configuration(format!("{}={:?} is not a valid size: {}", key, value, e))
    })
}

/// Get the default models directory
pub fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("tokembed").join("models"))
        .unwrap_or_else(|| PathBuf::from(".tokembed/models"))
}

/// Pick a sub-batch width that spreads `chunk_count` chunks over the CPUs
pub fn default_sub_batch_size(chunk_count: usize) -> usize {
    let cpus = num_cpus::get().max(1);
    chunk_count.div_ceil(cpus).max(1)
}
