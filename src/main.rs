use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{GatewayConfig, LoggingConfig};
use turnstile::gateway::Gateway;
use turnstile::ratelimit::RequestParts;
use turnstile::TurnstileError;

/// Replay newline-delimited JSON requests through a gateway's rate limiters.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Gateway descriptor (YAML or JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Log filter, overriding the descriptor
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

/// One replayed request.
#[derive(Debug, Deserialize)]
struct ReplayEntry {
    endpoint: String,
    #[serde(flatten)]
    request: RequestParts,
}

#[derive(Debug, Serialize)]
struct Decision<'a> {
    endpoint: &'a str,
    status: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = GatewayConfig::from_file(&args.config)?;

    init_tracing(&args, &config.logging);

    info!("Starting turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(config = %args.config.display(), endpoints = config.endpoints.len(), "Configuration loaded");

    let gateway = Arc::new(Gateway::from_config(&config));
    let sweepers = gateway.spawn_sweepers();
    info!(sweepers = sweepers.len(), "Idle bucket sweepers started");

    tokio::select! {
        result = replay(&gateway) => result?,
        _ = shutdown_signal() => {}
    }

    for sweeper in sweepers {
        sweeper.abort();
    }

    info!("turnstile stopped");
    Ok(())
}

fn init_tracing(args: &Args, logging: &LoggingConfig) {
    let level = args.log_level.as_deref().unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Decisions go to stdout, so logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if args.json_logs || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Read requests from stdin until EOF, writing one decision per line.
async fn replay(gateway: &Gateway) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let (endpoint, status) = match serde_json::from_str::<ReplayEntry>(&line) {
            Ok(entry) => {
                let status = match gateway.dispatch(&entry.endpoint, &entry.request).await {
                    Ok(()) => 200,
                    Err(e) => status_code(&e),
                };
                (entry.endpoint, status)
            }
            Err(e) => {
                warn!(error = %e, "Skipping unreadable request");
                (String::new(), 400)
            }
        };

        let mut out = serde_json::to_vec(&Decision {
            endpoint: &endpoint,
            status,
        })?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
    }

    stdout.flush().await?;
    info!("Input exhausted");
    Ok(())
}

fn status_code(err: &TurnstileError) -> u16 {
    match err {
        TurnstileError::Limited(_) => 429,
        TurnstileError::UnknownRoute(_) => 404,
        TurnstileError::Cancelled => 499,
        _ => 500,
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
