//! # kf-md
//!
//! Candle acquisition for multiple cryptocurrency exchanges.
//!
//! ## Architecture
//!
//! Each exchange module exposes an [`ExchangeAdapter`] for historical REST
//! candles, and the streamable ones (Binance, Bybit) a `stream_def()` that
//! describes their kline WebSocket. On top of those:
//!
//! - [`fetcher`]: `RaceFetcher`, first-success concurrent REST fetch
//! - [`manager`]: `StreamManager`, per-symbol fallback chain
//!   (primary stream → secondary stream → REST polling)
//! - [`buffer`]: `CandleBuffer`, batched persistence of closed candles
//! - [`context`]: `FeedContext`, owns and wires all of the above
//!
//! ## Shared infrastructure
//!
//! - [`registry`]: `Exchange` → adapter / stream definition
//! - [`stream`]: `StreamDef`, `StreamFactory`, `LiveStream`
//! - [`rest`]: pooled HTTP client with error mapping
//! - [`json_util`]: row parsing and result normalization helpers

pub mod binance;
pub mod buffer;
pub mod bybit;
pub mod coinbase;
pub mod context;
pub mod fetcher;
#[cfg(test)]
mod http_stub;
pub mod json_util;
pub mod kraken;
pub mod kucoin;
pub mod manager;
pub mod okx;
pub mod registry;
pub mod rest;
pub mod stream;

use async_trait::async_trait;
use kf_core::{Candle, Exchange, FetchRequest, KfError};

/// Historical candle source for one exchange.
///
/// Implementations return candles ascending by timestamp with no duplicates,
/// at most `req.limit` of them, and never return a candle that fails
/// [`Candle::validate`].
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    async fn fetch(&self, req: &FetchRequest) -> Result<Vec<Candle>, KfError>;
}
