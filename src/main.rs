use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ursa::config::{LogFormat, LoggingConfig, UrsaConfig};
use ursa::ratelimit::{RateConfig, RateLimiter, Reaper, SystemClock};

/// Ursa rate limiting layer.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Service configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rate limit rules file, overriding `rate_limiting.rules_path`
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Validate configuration and rules, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = UrsaConfig::load(args.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging);

    info!("Starting Ursa rate limiter");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rules_path = args
        .rules
        .or_else(|| config.rate_limiting.rules_path.clone())
        .context("no rules file given; pass --rules or set rate_limiting.rules_path")?;
    let rules = RateConfig::from_file(&rules_path)
        .with_context(|| format!("loading rules from {}", rules_path.display()))?;
    let reaper_settings = config.reaper.settings();
    reaper_settings.validate()?;

    if args.check {
        info!(rules = %rules_path.display(), "Configuration is valid");
        return Ok(());
    }

    let limiter = Arc::new(RateLimiter::with_options(
        rules,
        Arc::new(SystemClock),
        config.rate_limiting.max_memoized_paths,
    ));
    info!(
        routes = limiter.config().routes().len(),
        strategies = limiter.config().strategies().len(),
        "Rate limiter initialized"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = if config.reaper.enabled {
        Some(Reaper::for_limiter(&limiter, reaper_settings)?.spawn(shutdown_rx))
    } else {
        warn!("Idle reaper disabled; rate limit state will grow without bound");
        None
    };

    shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    if let Some(reaper) = reaper {
        reaper.await.context("reaper task failed")?;
    }

    info!(
        boxes = limiter.box_count(),
        buckets = limiter.bucket_count(),
        "Ursa rate limiter stopped"
    );
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
