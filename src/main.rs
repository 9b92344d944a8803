use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::{Algorithm, RateLimiter, ReaperHandle, Verdict};

/// Admission-control toolbox: replay keys against a limiter or fire concurrent
/// bursts at one key.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read keys from stdin and print one JSON verdict per line.
    ///
    /// With --limit every line is an admission key. Without it every line is
    /// `<subject> <action>` resolved through the policy table.
    Replay {
        /// Admissions per window
        #[arg(long)]
        limit: Option<u64>,

        /// Window length in seconds
        #[arg(long, default_value_t = 60)]
        window_secs: u64,

        /// Algorithm override
        #[arg(long)]
        algorithm: Option<Algorithm>,

        /// Policy file, overriding limiter.policies_path
        #[arg(long)]
        policies: Option<String>,
    },

    /// Fire concurrent checks at one key and report the totals.
    Burst {
        /// Admission key
        #[arg(long, default_value = "burst:action")]
        key: String,

        /// Number of concurrent checks
        #[arg(long, default_value_t = 100)]
        concurrency: usize,

        /// Admissions per window
        #[arg(long, default_value_t = 10)]
        limit: u64,

        /// Window length in seconds
        #[arg(long, default_value_t = 60)]
        window_secs: u64,

        /// Algorithm override
        #[arg(long)]
        algorithm: Option<Algorithm>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = TurnstileConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Replay {
            limit,
            window_secs,
            algorithm,
            policies,
        } => {
            if let Some(algorithm) = algorithm {
                config.limiter.algorithm = algorithm;
            }
            if policies.is_some() {
                config.limiter.policies_path = policies;
            }

            let limiter = RateLimiter::from_config(&config.limiter)?;
            info!(algorithm = %limiter.algorithm(), "Rate limiter initialized");

            let reaper = start_reaper(&limiter, &config)?;

            tokio::select! {
                result = replay(&limiter, limit, Duration::from_secs(window_secs)) => result?,
                _ = shutdown_signal() => {}
            }

            if let Some(reaper) = reaper {
                reaper.shutdown().await;
            }
        }
        Command::Burst {
            key,
            concurrency,
            limit,
            window_secs,
            algorithm,
        } => {
            if let Some(algorithm) = algorithm {
                config.limiter.algorithm = algorithm;
            }

            let limiter = Arc::new(RateLimiter::from_config(&config.limiter)?);
            let window = Duration::from_secs(window_secs);
            let summary = burst(limiter, key, concurrency, limit, window).await?;
            println!("{}", summary);
        }
    }

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // stdout carries verdicts; logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn start_reaper(
    limiter: &RateLimiter,
    config: &TurnstileConfig,
) -> anyhow::Result<Option<ReaperHandle>> {
    if !config.reaper.enabled {
        return Ok(None);
    }

    let handle = limiter.spawn_reaper(config.reaper.interval(), config.reaper.grace_period())?;
    Ok(Some(handle))
}

async fn replay(limiter: &RateLimiter, limit: Option<u64>, window: Duration) -> anyhow::Result<()> {
    if limit.is_none() && limiter.policies().is_empty() {
        anyhow::bail!("either --limit or a policy file is required");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, outcome) = match limit {
            Some(limit) => (line.to_string(), limiter.check(line, limit, window)),
            None => {
                let mut parts = line.split_whitespace();
                let subject = parts.next().unwrap_or_default();
                let action = parts.next().unwrap_or_default();
                (
                    format!("{}:{}", subject, action),
                    limiter.check_action(subject, action),
                )
            }
        };

        let output = match outcome {
            Ok(verdict) => verdict_json(&key, &verdict),
            Err(e) => json!({ "key": key, "error": e.to_string() }),
        };
        println!("{}", output);
    }

    Ok(())
}

async fn burst(
    limiter: Arc<RateLimiter>,
    key: String,
    concurrency: usize,
    limit: u64,
    window: Duration,
) -> anyhow::Result<serde_json::Value> {
    let tasks: Vec<_> = (0..concurrency)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let key = key.clone();
            tokio::spawn(async move { limiter.check(&key, limit, window) })
        })
        .collect();

    let mut allowed = 0usize;
    let mut denied = 0usize;
    for result in futures::future::join_all(tasks).await {
        if result??.allowed {
            allowed += 1;
        } else {
            denied += 1;
        }
    }

    Ok(json!({
        "key": key,
        "algorithm": limiter.algorithm().as_str(),
        "concurrency": concurrency,
        "limit": limit,
        "allowed": allowed,
        "denied": denied,
    }))
}

fn verdict_json(key: &str, verdict: &Verdict) -> serde_json::Value {
    json!({
        "key": key,
        "allowed": verdict.allowed,
        "remaining": verdict.remaining,
        "limit": verdict.limit,
        "retry_after_ms": verdict.retry_after.map(|d| d.as_millis() as u64),
        "retry_after_secs": verdict.retry_after_secs(),
        "reset_after_ms": verdict.reset_after.as_millis() as u64,
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
