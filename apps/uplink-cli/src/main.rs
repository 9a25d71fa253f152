//! Uplink command-line uploader entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "uplink", version, about = "Resumable chunked uploads to an HTTP endpoint")]
struct Cli {
    /// Configuration file (default: ~/.config/uplink/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Chunk upload endpoint URL.
    #[arg(long)]
    endpoint: Option<String>,

    /// Bearer token for the endpoint.
    #[arg(long)]
    token: Option<String>,

    /// Chunk size in bytes.
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Files uploaded at the same time.
    #[arg(long)]
    parallel_files: Option<usize>,

    /// Chunks in flight per file.
    #[arg(long)]
    parallel_chunks: Option<usize>,

    /// Files and folders to upload.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

impl Cli {
    /// Command-line values take precedence over the file.
    fn apply(&self, config: &mut config::Config) {
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if let Some(n) = self.parallel_files {
            config.parallel_files = n;
        }
        if let Some(n) = self.parallel_chunks {
            config.parallel_chunks = n;
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting uplink");

    let mut config = config::Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    tracing::info!(endpoint = %config.endpoint, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(app::run(config, cli.paths))?;

    tracing::info!(
        completed = summary.completed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "uploads finished"
    );
    if summary.failed > 0 {
        anyhow::bail!("{} upload(s) failed", summary.failed);
    }
    Ok(())
}
