//! OKX v5 REST candles.
//!
//! `GET /api/v5/market/candles?instId=BTC-USDT&bar=1m&limit=300`. Pagination
//! is inverted relative to the other venues: `after` returns rows *older*
//! than a timestamp, `before` rows *newer* than one. Both are exclusive.

pub mod json_parser;

use async_trait::async_trait;
use kf_core::{Candle, Exchange, FetchRequest, Interval, KfError, join_pair};

use crate::ExchangeAdapter;
use crate::json_util::finalize;
use crate::rest::RestClient;

pub const REST_BASE: &str = "https://www.okx.com";
const CANDLES_PATH: &str = "/api/v5/market/candles";

pub const MAX_LIMIT: u32 = 300;

/// `BTC/USDT` → `BTC-USDT`.
pub fn to_inst_id(symbol: &str) -> Result<String, KfError> {
    join_pair(symbol, "-")
}

/// OKX bar tokens. Six hours and up use the UTC-aligned variants so bucket
/// open times match the other exchanges. There is no 8h bar.
pub fn bar_token(interval: Interval) -> Option<&'static str> {
    Some(match interval {
        Interval::Min1 => "1m",
        Interval::Min3 => "3m",
        Interval::Min5 => "5m",
        Interval::Min15 => "15m",
        Interval::Min30 => "30m",
        Interval::Hour1 => "1H",
        Interval::Hour2 => "2H",
        Interval::Hour4 => "4H",
        Interval::Hour6 => "6Hutc",
        Interval::Hour12 => "12Hutc",
        Interval::Day1 => "1Dutc",
        Interval::Day3 => "3Dutc",
        Interval::Week1 => "1Wutc",
        Interval::Month1 => "1Mutc",
        Interval::Hour8 => return None,
    })
}

pub struct OkxAdapter {
    client: RestClient,
    base_url: String,
}

impl OkxAdapter {
    pub fn new(client: RestClient) -> Self {
        Self::with_base_url(client, REST_BASE)
    }

    pub fn with_base_url(client: RestClient, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }
}

/// Query parameters for a request. The request window is inclusive, so the
/// exclusive cursors are widened by one millisecond.
fn build_query(req: &FetchRequest) -> Result<Vec<(&'static str, String)>, KfError> {
    let bar = bar_token(req.interval).ok_or(KfError::UnsupportedInterval { exchange: Exchange::Okx, interval: req.interval })?;
    let mut query = vec![
        ("instId", to_inst_id(&req.symbol)?),
        ("bar", bar.to_string()),
        ("limit", req.capped_limit(MAX_LIMIT).to_string()),
    ];
    if let Some(end) = req.end_time_ms {
        query.push(("after", end.saturating_add(1).to_string()));
    }
    if let Some(start) = req.start_time_ms {
        query.push(("before", start.saturating_sub(1).to_string()));
    }
    Ok(query)
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    async fn fetch(&self, req: &FetchRequest) -> Result<Vec<Candle>, KfError> {
        let query = build_query(req)?;
        let url = format!("{}{CANDLES_PATH}", self.base_url);
        let body = self.client.get_json(&url, &query).await?;
        Ok(finalize(json_parser::parse_candles(&body)?, req))
    }
}
