//! Stand-in server used by the waddle-fixture integration tests.
//!
//! Binds the requested listeners, echoes whatever connected clients send and
//! exits once stdin is closed, which is how the harness asks fixtures to
//! stop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Echo server that stops on stdin EOF
#[derive(Parser, Debug)]
#[command(name = "fixture-listener")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML file with `listen` and `unix` address lists
    #[arg(long)]
    config: Option<PathBuf>,

    /// TCP address to listen on (repeatable)
    #[arg(long)]
    listen: Vec<String>,

    /// Unix socket path to listen on (repeatable)
    #[arg(long)]
    unix: Vec<PathBuf>,

    /// Wait this long before binding anything
    #[arg(long, default_value_t = 0)]
    bind_delay_ms: u64,

    /// Exit status to report after stdin closes
    #[arg(long, default_value_t = 0)]
    exit_code: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    listen: Vec<String>,
    unix: Vec<PathBuf>,
}

impl FileConfig {
    fn load(path: &PathBuf) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut tcp = cli.listen;
    let mut unix = cli.unix;
    if let Some(path) = &cli.config {
        let file = FileConfig::load(path)?;
        tcp.extend(file.listen);
        unix.extend(file.unix);
    }

    if cli.bind_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(cli.bind_delay_ms)).await;
    }

    for addr in tcp {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        println!("listening tcp {}", listener.local_addr()?);
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!(%peer, "Accepted TCP connection");
                tokio::spawn(echo(stream));
            }
        });
    }

    for path in unix {
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        println!("listening unix {}", path.display());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                debug!("Accepted Unix connection");
                tokio::spawn(echo(stream));
            }
        });
    }

    let mut stdin = tokio::io::stdin();
    let mut buf = Vec::new();
    stdin.read_to_end(&mut buf).await?;
    println!("stdin closed, exiting");
    info!(exit_code = cli.exit_code, "Shutting down");

    std::process::exit(cli.exit_code);
}

async fn echo<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    if let Err(error) = tokio::io::copy(&mut reader, &mut writer).await {
        debug!(%error, "Echo connection closed");
    }
}
