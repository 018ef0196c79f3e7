use std::time::SystemTime;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::error::TurnstileError;
use turnstile::ratelimit::{
    Decision, Engine, Evictor, IdentityExtractor, PolicyTable, RateLimiterBackend, RequestMeta,
};

/// Line-oriented front end: one JSON request per stdin line, one JSON
/// decision per stdout line.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Engine configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Policy table; overrides `limiter.policies_path`
    #[arg(short, long)]
    policies: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

const DEFAULT_POLICIES: &str = "config/policies.yaml";

/// What gets written back for each request.
#[derive(Debug, Serialize)]
struct Response {
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Response {
    fn from_decision(decision: &Decision) -> Self {
        let headers = decision.headers();
        Self {
            status: if decision.allowed { 200 } else { 429 },
            key: Some(decision.key.to_string()),
            limit: Some(headers.limit),
            remaining: Some(headers.remaining),
            reset: Some(headers.reset),
            error: None,
        }
    }

    fn from_error(err: &TurnstileError) -> Self {
        let status = match err {
            TurnstileError::MissingIdentity => 401,
            TurnstileError::Unresolved { .. } => 404,
            TurnstileError::StoreUnavailable(_) => 503,
            TurnstileError::Config(_) | TurnstileError::Io(_) => 500,
        };
        Self::failure(status, err.to_string())
    }

    fn failure(status: u16, error: String) -> Self {
        Self {
            status,
            key: None,
            limit: None,
            remaining: None,
            reset: None,
            error: Some(error),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries decisions
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("Starting Turnstile rate limiting engine");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;

    let policies_path = args
        .policies
        .or_else(|| config.limiter.policies_path.clone())
        .unwrap_or_else(|| DEFAULT_POLICIES.to_string());
    let policies = PolicyTable::from_file(&policies_path)
        .with_context(|| format!("Failed to load policies from {}", policies_path))?;
    info!(
        policies = policies.len(),
        backend = ?config.limiter.backend,
        strategy = ?config.limiter.strategy,
        "Configuration loaded"
    );

    let engine = Engine::from_config(policies, &config);
    let evictor = Evictor::new(engine.state.clone(), &config.eviction).spawn();
    let extractor = IdentityExtractor::from_config(&config.identity);

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next() => line,
        };

        let line = match line {
            Some(line) => line.context("Failed to read stdin")?,
            None => {
                info!("End of input, shutting down");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RequestMeta>(&line) {
            Ok(request) => {
                match engine.backend.check_request(&extractor, &request, SystemTime::now()).await {
                    Ok(decision) => {
                        debug!(key = %decision.key, allowed = decision.allowed, "Decision");
                        Response::from_decision(&decision)
                    }
                    Err(e) => Response::from_error(&e),
                }
            }
            Err(e) => {
                warn!(error = %e, "Malformed request line");
                Response::failure(400, format!("malformed request: {}", e))
            }
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    evictor.shutdown().await;
    info!("Turnstile stopped");
    Ok(())
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
