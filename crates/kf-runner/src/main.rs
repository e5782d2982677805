//! # kf-runner
//!
//! Entry point for the kline feed.
//!
//! Loads a JSON configuration file, builds the feed context and either
//! streams the configured symbols until Ctrl+C or runs a single race fetch.
//!
//! # Usage
//!
//! ```bash
//! kf-runner config.json --log-level info stream --status-every 60
//! kf-runner config.json fetch --symbol BTC/USDT --interval 1h --limit 100
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kf_core::Interval;
use kf_core::store::MemoryStore;
use kf_md::context::FeedContext;
use tracing::{info, warn};

/// Real-time crypto candlestick feed.
#[derive(Parser)]
#[command(name = "kf-runner", about = "Real-time crypto candlestick feed")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Stream the configured symbols until Ctrl+C (default).
    Stream {
        /// Seconds between status log lines (0 disables).
        #[arg(long, default_value_t = 60)]
        status_every: u64,
    },
    /// Race-fetch historical candles and print them as JSON.
    Fetch {
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1m")]
        interval: Interval,
        #[arg(long, default_value_t = 100)]
        limit: u32,
        /// Start time, epoch milliseconds.
        #[arg(long)]
        start: Option<u64>,
        /// End time, epoch milliseconds.
        #[arg(long)]
        end: Option<u64>,
        /// Prefer a source returning at least this many candles.
        #[arg(long)]
        min_count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = kf_core::config::load_config(&cli.config)?;

    // 2. Initialize logging
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    kf_core::logging::init_logging(
        &cli.log_level,
        log_dir.as_deref(),
        &config.module_name(),
        cli.json_logs || config.json_logs(),
    );
    info!("kf-runner starting: config={}, log_level={}", cli.config.display(), cli.log_level);

    // 3. Build the context
    let store = Arc::new(MemoryStore::new());
    let ctx = FeedContext::from_config(&config, store.clone())?;

    match cli.command.unwrap_or(Command::Stream { status_every: 60 }) {
        Command::Stream { status_every } => stream(&ctx, status_every).await?,
        Command::Fetch { symbol, interval, limit, start, end, min_count } => {
            let result = match min_count {
                Some(n) if start.is_none() && end.is_none() => {
                    ctx.fetch_sufficient(&symbol, interval, limit, Some(n)).await?
                }
                _ => ctx.fetch_candlesticks(&symbol, interval, limit, start, end).await?,
            };
            info!("fetched {} candles from {} in {}ms", result.len(), result.exchange, result.fetch_time_ms);
            println!("{}", serde_json::to_string_pretty(&result).context("serializing fetch result")?);
        }
    }

    info!("kf-runner stopped, {} candle rows stored", store.len());
    Ok(())
}

async fn stream(ctx: &FeedContext, status_every: u64) -> Result<()> {
    ctx.start().await?;
    if ctx.get_stream_manager().await.is_none() {
        warn!("no stream.symbols configured; nothing to stream");
    }
    info!("streaming started, press Ctrl+C to stop");

    let period = Duration::from_secs(status_every.max(1));
    let mut status_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutdown signal received");
                break;
            }
            _ = status_tick.tick(), if status_every > 0 => {
                if let Some(manager) = ctx.get_stream_manager().await {
                    match manager.get_status().await {
                        Ok(status) => info!("status: {}", serde_json::to_string(&status)?),
                        Err(e) => warn!("status unavailable: {e}"),
                    }
                }
            }
        }
    }

    ctx.stop().await;
    let stats = ctx.buffer_stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
