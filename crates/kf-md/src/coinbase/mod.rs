//! Coinbase Exchange REST candles.
//!
//! `GET /products/BTC-USDT/candles?granularity=60&start=..&end=..`. There is
//! no limit parameter: the venue returns at most 300 rows, newest first, and
//! needs both ends of the window when either is given.

pub mod json_parser;

use async_trait::async_trait;
use kf_core::time_util::ms_to_secs;
use kf_core::{Candle, Exchange, FetchRequest, Interval, KfError, join_pair};

use crate::ExchangeAdapter;
use crate::json_util::finalize;
use crate::rest::RestClient;

pub const REST_BASE: &str = "https://api.exchange.coinbase.com";

/// Rows per response.
pub const MAX_LIMIT: u32 = 300;

/// `BTC/USDT` → `BTC-USDT`.
pub fn to_product_id(symbol: &str) -> Result<String, KfError> {
    join_pair(symbol, "-")
}

/// Granularity in seconds. Only six bucket sizes exist.
pub fn granularity(interval: Interval) -> Option<u64> {
    match interval {
        Interval::Min1 | Interval::Min5 | Interval::Min15 | Interval::Hour1 | Interval::Hour6 | Interval::Day1 => {
            Some(interval.duration_secs())
        }
        _ => None,
    }
}

pub struct CoinbaseAdapter {
    client: RestClient,
    base_url: String,
}

impl CoinbaseAdapter {
    pub fn new(client: RestClient) -> Self {
        Self::with_base_url(client, REST_BASE)
    }

    pub fn with_base_url(client: RestClient, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }
}

/// The venue rejects windows wider than 300 buckets, so a caller window is cut
/// to `limit` buckets from its start; the adapter keeps the earliest rows
/// anyway when a start is given.
fn build_query(req: &FetchRequest) -> Result<Vec<(&'static str, String)>, KfError> {
    let gran = granularity(req.interval)
        .ok_or(KfError::UnsupportedInterval { exchange: Exchange::Coinbase, interval: req.interval })?;
    let mut query = vec![("granularity", gran.to_string())];

    let span_ms = req.interval.duration_ms().saturating_mul(u64::from(req.capped_limit(MAX_LIMIT)));
    let window = match (req.start_time_ms, req.end_time_ms) {
        (Some(start), Some(end)) => Some((start, end.min(start.saturating_add(span_ms)))),
        (Some(start), None) => Some((start, start.saturating_add(span_ms))),
        (None, Some(end)) => Some((end.saturating_sub(span_ms), end)),
        (None, None) => None,
    };
    if let Some((start, end)) = window {
        query.push(("start", ms_to_secs(start).to_string()));
        query.push(("end", ms_to_secs(end).to_string()));
    }
    Ok(query)
}

#[async_trait]
impl ExchangeAdapter for CoinbaseAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Coinbase
    }

    async fn fetch(&self, req: &FetchRequest) -> Result<Vec<Candle>, KfError> {
        let product = to_product_id(&req.symbol)?;
        let query = build_query(req)?;
        let url = format!("{}/products/{product}/candles", self.base_url);
        let body = match self.client.get_json(&url, &query).await {
            Err(KfError::Api { status: 404, .. }) => return Err(KfError::InvalidSymbol(req.symbol.clone())),
            other => other?,
        };
        Ok(finalize(json_parser::parse_candles(&body)?, req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_stub::HttpStub;

    #[test]
    fn granularities() {
        assert_eq!(granularity(Interval::Min1), Some(60));
        assert_eq!(granularity(Interval::Hour6), Some(21_600));
        assert_eq!(granularity(Interval::Day1), Some(86_400));
        assert_eq!(granularity(Interval::Min3), None);
        assert_eq!(granularity(Interval::Week1), None);
    }

    #[test]
    fn open_ended_window_is_completed() {
        let req = FetchRequest::latest("BTC/USD", Interval::Min1, 10).with_range(Some(600_000), None);
        let query = build_query(&req).unwrap();
        assert!(query.contains(&("start", "600".to_string())));
        assert!(query.contains(&("end", "1200".to_string())));
    }

    #[test]
    fn wide_window_is_clamped_to_max_buckets() {
        let req = FetchRequest::latest("BTC/USD", Interval::Min1, 1_000).with_range(Some(0), Some(1_000 * 60_000));
        let query = build_query(&req).unwrap();
        assert!(query.contains(&("start", "0".to_string())));
        assert!(query.contains(&("end", "18000".to_string())));

        let narrow = FetchRequest::latest("BTC/USD", Interval::Min1, 1_000).with_range(Some(0), Some(600_000));
        assert!(build_query(&narrow).unwrap().contains(&("end", "600".to_string())));
    }

    #[test]
    fn latest_sends_only_granularity() {
        let query = build_query(&FetchRequest::latest("BTC/USD", Interval::Hour1, 10)).unwrap();
        assert_eq!(query, vec![("granularity", "3600".to_string())]);
    }

    #[tokio::test]
    async fn fetch_returns_ascending() {
        let stub = HttpStub::ok("[[1415398800,0.32,4.2,0.35,4.2,12.3],[1415398740,0.30,0.40,0.31,0.33,0.0]]").await;
        let adapter = CoinbaseAdapter::with_base_url(HttpStub::client(), &stub.base_url);
        let candles = adapter.fetch(&FetchRequest::latest("BTC/USD", Interval::Min1, 10)).await.unwrap();
        let ts: Vec<u64> = candles.iter().map(|c| c.timestamp_ms).collect();
        assert_eq!(ts, vec![1_415_398_740_000, 1_415_398_800_000]);
        assert_eq!(stub.requests()[0], "/products/BTC-USD/candles?granularity=60");
    }

    #[tokio::test]
    async fn not_found_is_invalid_symbol() {
        let stub = HttpStub::serve(404, r#"{"message":"NotFound"}"#).await;
        let adapter = CoinbaseAdapter::with_base_url(HttpStub::client(), &stub.base_url);
        let err = adapter.fetch(&FetchRequest::latest("FOO/BAR", Interval::Min1, 10)).await.unwrap_err();
        assert!(matches!(err, KfError::InvalidSymbol(s) if s == "FOO/BAR"));
    }

    #[tokio::test]
    async fn wide_window_goes_out_clamped() {
        let stub = HttpStub::ok("[]").await;
        let adapter = CoinbaseAdapter::with_base_url(HttpStub::client(), &stub.base_url);
        let req = FetchRequest::latest("BTC/USD", Interval::Min1, 1_000).with_range(Some(0), Some(1_000 * 60_000));
        assert!(adapter.fetch(&req).await.unwrap().is_empty());
        assert!(stub.requests()[0].ends_with("start=0&end=18000"));
    }
}
