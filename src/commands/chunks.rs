use anyhow::Context;
use std::path::Path;
use tokembed_core::{chunk, Codec, TokenSequence};

pub async fn run(input: &Path, tokenizer: &Path, seq_len: usize) -> anyhow::Result<()> {
    anyhow::ensure!(seq_len > 0, "--seq-len must be greater than zero");

    let text = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let tokenizer = tokenizer.to_path_buf();
    let ids = tokio::task::spawn_blocking(move || -> tokembed_core::Result<TokenSequence> {
        Codec::load(&tokenizer)?.encode(&text)
    })
    .await??;

    let chunks = chunk(&ids, seq_len);

    println!("Tokens: {}", ids.len());
    println!("Chunks: {}", chunks.len());
    for (i, c) in chunks.iter().enumerate() {
        println!("  #{:<4} [{}..{}) {} tokens", i, c.start(), c.end(), c.len());
    }

    Ok(())
}
