use anyhow::Context;
use std::path::{Path, PathBuf};
use tokembed_core::config::default_sub_batch_size;
use tokembed_core::{Codec, EmbeddingConfig, EmbeddingResult, EmbeddingService};
use tracing::info;

pub struct EmbedOptions {
    pub concurrent: bool,
    pub sub_batch: Option<usize>,
    pub output: Option<PathBuf>,
}

pub async fn run(
    input: &Path,
    tokenizer: &Path,
    config: EmbeddingConfig,
    options: EmbedOptions,
) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let embed_dim = config.embed_dim;
    let tokenizer = tokenizer.to_path_buf();
    let concurrent = options.concurrent;
    let sub_batch = options.sub_batch;
    let embeddings = tokio::task::spawn_blocking(move || {
        embed_text(&text, &tokenizer, config, concurrent, sub_batch)
    })
    .await??;

    println!("Embeddings: {}", embeddings.len());
    println!("Dimension:  {}", embed_dim);

    if let Some(output) = options.output {
        let json = serde_json::to_string_pretty(&embeddings)?;
        tokio::fs::write(&output, json)
            .await
            .with_context(|| format!("Failed to write {}", output.display()))?;
        println!("Wrote {}", output.display());
    }

    Ok(())
}

/// Blocking part: load model and tokenizer, then run inference
fn embed_text(
    text: &str,
    tokenizer: &Path,
    config: EmbeddingConfig,
    concurrent: bool,
    sub_batch: Option<usize>,
) -> anyhow::Result<EmbeddingResult> {
    let service = EmbeddingService::new(config).context("Failed to open model")?;
    let codec = Codec::load(tokenizer).context("Failed to load tokenizer")?;

    let ids = codec.encode(text)?;
    let chunks = service.chunk_text(&ids);
    info!(tokens = ids.len(), chunks = chunks.len(), concurrent, "Embedding input");

    let embeddings = if concurrent {
        let width = sub_batch.unwrap_or_else(|| default_sub_batch_size(chunks.len()));
        service.generate_batch_concurrently(&chunks, width)?
    } else {
        service.generate_batch(&chunks)?
    };

    service.close();
    Ok(embeddings)
}
