//! livedoc-session - runs one live page session over stdin/stdout.
//!
//! Reads one JSON envelope per line on stdin and writes one response per line
//! on stdout. Logs go to stderr.

use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use livedoc_core::session::SessionHandle;
use livedoc_core::state::Page;
use livedoc_core::{Config, Runtime};

#[derive(Debug, Parser)]
#[command(name = "livedoc-session", about = "Serve one live documentation session over stdio")]
struct Cli {
    /// Source and action configuration (.yaml, .yml or .json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pre-parsed page (JSON)
    #[arg(long)]
    page: PathBuf,

    /// Identity attributed to actions (overrides config and LIVEDOC_OPERATOR)
    #[arg(long)]
    operator: Option<String>,

    /// Allow exec sources and exec actions
    #[arg(long)]
    allow_exec: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    livedoc_core::observability::init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    config.apply_env_overrides();
    if let Some(operator) = cli.operator {
        config.runtime.operator = Some(operator);
    }
    config.runtime.allow_exec |= cli.allow_exec;

    let page: Page = serde_json::from_str(&std::fs::read_to_string(&cli.page)?)?;
    let runtime = Runtime::from_config(&config)?;

    let cancel = CancellationToken::new();
    let SessionHandle {
        id,
        inbound,
        mut outbound,
        task,
    } = runtime.session(&page)?.spawn(cancel.clone());
    tracing::info!(session = %id, page = %page.title, "serving session on stdio");

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = outbound.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                cancel.cancel();
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    if inbound.send(line).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    drop(inbound);

    let stats = task.await?;
    writer.await??;
    runtime.shutdown().await?;
    tracing::info!(processed = stats.processed, failed = stats.failed, "done");
    Ok(())
}
