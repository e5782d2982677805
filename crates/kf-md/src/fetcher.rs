//! Concurrent first-success fetch across exchange adapters.
//!
//! ```text
//!              ┌─► binance.fetch() ──┐
//! FetchRequest ├─► okx.fetch()     ──┼─► first non-empty result wins,
//!              └─► kraken.fetch()  ──┘   the rest are aborted
//! ```
//!
//! Every adapter runs in its own task under its own timeout. An empty
//! response counts as a failure (`NoData`). When no adapter produces a usable
//! result, the caller gets [`KfError::AllSourcesFailed`] with every adapter's
//! error in priority order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kf_core::{Candle, Exchange, FetchRequest, FetchResult, KfError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::ExchangeAdapter;

/// Races a priority-ordered list of adapters.
pub struct RaceFetcher {
    adapters: Vec<Arc<dyn ExchangeAdapter>>,
    per_adapter_timeout: Duration,
}

impl RaceFetcher {
    pub fn new(adapters: Vec<Arc<dyn ExchangeAdapter>>, per_adapter_timeout: Duration) -> Self {
        Self { adapters, per_adapter_timeout }
    }

    /// Exchanges in priority order.
    pub fn exchanges(&self) -> Vec<Exchange> {
        self.adapters.iter().map(|a| a.exchange()).collect()
    }

    /// First adapter to return at least one candle wins.
    pub async fn fetch_any(&self, req: &FetchRequest) -> Result<FetchResult, KfError> {
        self.race(req, 1).await
    }

    /// First adapter to return at least `min_count` candles wins (default:
    /// half the requested limit). If none reaches it, the largest non-empty
    /// result is returned instead.
    pub async fn fetch_sufficient(&self, req: &FetchRequest, min_count: Option<usize>) -> Result<FetchResult, KfError> {
        let min_count = min_count.unwrap_or((req.limit / 2) as usize).max(1);
        self.race(req, min_count).await
    }

    async fn race(&self, req: &FetchRequest, min_count: usize) -> Result<FetchResult, KfError> {
        req.validate()?;
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for (priority, adapter) in self.adapters.iter().enumerate() {
            let adapter = Arc::clone(adapter);
            let req = req.clone();
            let timeout = self.per_adapter_timeout;
            tasks.spawn(async move {
                let exchange = adapter.exchange();
                let result = match tokio::time::timeout(timeout, adapter.fetch(&req)).await {
                    Ok(result) => result,
                    Err(_) => Err(KfError::Timeout(format!("{exchange} did not respond within {timeout:?}"))),
                };
                (priority, exchange, result)
            });
        }

        let mut reported = vec![false; self.adapters.len()];
        let mut errors: Vec<(usize, Exchange, KfError)> = Vec::new();
        let mut best: Option<(usize, Exchange, Vec<Candle>)> = None;

        while let Some(joined) = tasks.join_next().await {
            let (priority, exchange, result) = match joined {
                Ok(out) => out,
                Err(e) => {
                    warn!("[race] adapter task ended abnormally: {e}");
                    continue;
                }
            };
            reported[priority] = true;

            match result {
                Ok(candles) if candles.is_empty() => {
                    debug!("[race] {exchange} returned no candles for {}", req.symbol);
                    errors.push((priority, exchange, KfError::NoData(format!("{exchange} returned no candles"))));
                }
                Ok(candles) if candles.len() >= min_count => {
                    tasks.abort_all();
                    let fetch_time_ms = started.elapsed().as_millis() as u64;
                    info!(
                        "[race] {exchange} won {} {} with {} candles in {fetch_time_ms}ms",
                        req.symbol,
                        req.interval,
                        candles.len()
                    );
                    return Ok(self.result(req, exchange, candles, fetch_time_ms));
                }
                Ok(candles) => {
                    debug!("[race] {exchange} returned {} < {min_count} candles", candles.len());
                    let better = match &best {
                        Some((p, _, c)) => candles.len() > c.len() || (candles.len() == c.len() && priority < *p),
                        None => true,
                    };
                    if better {
                        best = Some((priority, exchange, candles));
                    }
                }
                Err(e) => {
                    warn!("[race] {exchange} failed for {}: {e}", req.symbol);
                    errors.push((priority, exchange, e));
                }
            }
        }

        if let Some((_, exchange, candles)) = best {
            let fetch_time_ms = started.elapsed().as_millis() as u64;
            warn!("[race] no source reached {min_count} candles; using {exchange} with {}", candles.len());
            return Ok(self.result(req, exchange, candles, fetch_time_ms));
        }

        for (priority, adapter) in self.adapters.iter().enumerate() {
            if !reported[priority] {
                errors.push((priority, adapter.exchange(), KfError::Connection("fetch task aborted".into())));
            }
        }
        errors.sort_by_key(|(priority, _, _)| *priority);
        Err(KfError::AllSourcesFailed { errors: errors.into_iter().map(|(_, ex, e)| (ex, e)).collect() })
    }

    fn result(&self, req: &FetchRequest, exchange: Exchange, candles: Vec<Candle>, fetch_time_ms: u64) -> FetchResult {
        FetchResult { candles, exchange, symbol: req.symbol.clone(), interval: req.interval, fetch_time_ms }
    }
}
