//! Text to token ID encoding
//!
//! Tokenizers are loaded through a process-wide registry keyed by path. The
//! first load of a path decides the outcome for the whole process: later
//! callers share the same tokenizer, or receive the same error without a
//! retry. The registry lock is only held to find a path's slot; loading
//! happens outside it, so a slow file never blocks other paths.

use crate::embeddings::TokenSequence;
use crate::error::{EmbeddingError, Result};
use once_cell::sync::{Lazy, OnceCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;
use tracing::{info, warn};

type LoadResult = std::result::Result<Arc<Tokenizer>, EmbeddingError>;

static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Arc<OnceCell<LoadResult>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Load a tokenizer once per process, caching the result for `path`
pub fn load_tokenizer(path: impl AsRef<Path>) -> Result<Arc<Tokenizer>> {
    let path = path.as_ref();
    let slot = {
        let mut registry = match REGISTRY.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(registry.entry(registry_key(path)).or_default())
    };

    slot.get_or_init(|| read_tokenizer(path)).clone()
}

/// Resolve the directory part so spellings of one file share a slot
///
/// The file name itself is kept as given, which makes the key the same
/// before and after the file exists.
fn registry_key(path: &Path) -> PathBuf {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return path.to_path_buf();
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };

    match parent.canonicalize() {
        Ok(dir) => dir.join(name),
        Err(_) => path.to_path_buf(),
    }
}

fn read_tokenizer(path: &Path) -> LoadResult {
    if path.as_os_str().is_empty() {
        return Err(EmbeddingError::Configuration(
            "tokenizer path is empty".to_string(),
        ));
    }
    if !path.exists() {
        let err = EmbeddingError::Configuration(format!(
            "tokenizer file not found at {}",
            path.display()
        ));
        warn!(error = %err, "Tokenizer load failed");
        return Err(err);
    }

    let tokenizer = Tokenizer::from_file(path).map_err(|e| {
        EmbeddingError::Configuration(format!(
            "failed to load tokenizer {}: {}",
            path.display(),
            e
        ))
    })?;
    info!(path = %path.display(), "Loaded tokenizer");
    Ok(Arc::new(tokenizer))
}

/// Encodes text into token IDs
#[derive(Clone)]
pub struct Codec {
    tokenizer: Arc<Tokenizer>,
    add_special_tokens: bool,
}

impl Codec {
    /// Create a codec backed by the shared tokenizer at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            tokenizer: load_tokenizer(path)?,
            add_special_tokens: false,
        })
    }

    /// Let the tokenizer's post-processor add its special tokens
    pub fn with_special_tokens(mut self, add: bool) -> Self {
        self.add_special_tokens = add;
        self
    }

    pub fn tokenizer(&self) -> &Arc<Tokenizer> {
        &self.tokenizer
    }

    pub fn encode(&self, text: &str) -> Result<TokenSequence> {
        let encoding = self
            .tokenizer
            .encode(text, self.add_special_tokens)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        Ok(encoding
            .get_ids()
            .iter()
            .map(|&id| i64::from(id))
            .collect())
    }
}
