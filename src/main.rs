mod commands;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokembed_core::config::{
    default_models_dir, EmbeddingConfig, ENV_EMBED_DIM, ENV_MODEL_PATH, ENV_SEQ_LEN,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tokembed")]
#[command(about = "Chunk long token sequences and embed them", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the ONNX model
    #[arg(long, global = true, env = ENV_MODEL_PATH)]
    model: Option<PathBuf>,

    /// Path to tokenizer.json (defaults to the model's directory)
    #[arg(long, global = true, env = "TOKEMBED_TOKENIZER")]
    tokenizer: Option<PathBuf>,

    /// JSON config file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Maximum tokens per chunk
    #[arg(long, global = true, env = ENV_SEQ_LEN)]
    seq_len: Option<usize>,

    /// Embedding dimension produced by the model
    #[arg(long, global = true, env = ENV_EMBED_DIM)]
    embed_dim: Option<usize>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tokenize a file and show how it splits into chunks
    Chunks {
        /// Text file to tokenize
        input: PathBuf,
    },

    /// Tokenize, chunk and embed a file
    Embed {
        /// Text file to embed
        input: PathBuf,

        /// Run sub-batches on parallel workers
        #[arg(long)]
        concurrent: bool,

        /// Chunks per worker (defaults to spreading over all CPUs)
        #[arg(long, requires = "concurrent")]
        sub_batch: Option<usize>,

        /// Write the embeddings as JSON
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

/// Map `LOG_LEVEL` to a filter level; unknown or missing values mean info
fn log_level(value: Option<&str>) -> &'static str {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("debug") => "debug",
        Some("warn") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = std::env::var("LOG_LEVEL").ok();
            EnvFilter::new(log_level(level.as_deref()))
        })
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<EmbeddingConfig> {
    let mut config = match &cli.config {
        Some(path) => EmbeddingConfig::from_file(path)?,
        None => EmbeddingConfig::new(default_models_dir().join("model.onnx")),
    };

    if let Some(model) = &cli.model {
        config.model_path = model.clone();
    }
    if let Some(seq_len) = cli.seq_len {
        config.seq_len = seq_len;
    }
    if let Some(embed_dim) = cli.embed_dim {
        config.embed_dim = embed_dim;
    }

    Ok(config)
}

fn tokenizer_path(cli: &Cli, config: &EmbeddingConfig) -> PathBuf {
    cli.tokenizer.clone().unwrap_or_else(|| {
        config
            .model_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("tokenizer.json")
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Variables already set in the environment win over .env
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let tokenizer = tokenizer_path(&cli, &config);

    match cli.command {
        Commands::Chunks { input } => {
            commands::chunks::run(&input, &tokenizer, config.seq_len).await?;
        }
        Commands::Embed {
            input,
            concurrent,
            sub_batch,
            output,
        } => {
            let options = commands::embed::EmbedOptions {
                concurrent,
                sub_batch,
                output,
            };
            commands::embed::run(&input, &tokenizer, config, options).await?;
        }
    }

    Ok(())
}
