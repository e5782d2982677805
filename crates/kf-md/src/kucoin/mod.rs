//! KuCoin REST candles.
//!
//! `GET /api/v1/market/candles?type=1min&symbol=BTC-USDT&startAt=..&endAt=..`
//! with times in seconds. No limit parameter; up to 1500 rows per response.

pub mod json_parser;

use async_trait::async_trait;
use kf_core::time_util::ms_to_secs;
use kf_core::{Candle, Exchange, FetchRequest, Interval, KfError, join_pair};

use crate::ExchangeAdapter;
use crate::json_util::finalize;
use crate::rest::RestClient;

pub const REST_BASE: &str = "https://api.kucoin.com";
const CANDLES_PATH: &str = "/api/v1/market/candles";

pub const MAX_LIMIT: u32 = 1500;

/// `BTC/USDT` → `BTC-USDT`.
pub fn to_native_symbol(symbol: &str) -> Result<String, KfError> {
    join_pair(symbol, "-")
}

pub fn type_token(interval: Interval) -> Option<&'static str> {
    Some(match interval {
        Interval::Min1 => "1min",
        Interval::Min3 => "3min",
        Interval::Min5 => "5min",
        Interval::Min15 => "15min",
        Interval::Min30 => "30min",
        Interval::Hour1 => "1hour",
        Interval::Hour2 => "2hour",
        Interval::Hour4 => "4hour",
        Interval::Hour6 => "6hour",
        Interval::Hour8 => "8hour",
        Interval::Hour12 => "12hour",
        Interval::Day1 => "1day",
        Interval::Week1 => "1week",
        Interval::Day3 | Interval::Month1 => return None,
    })
}

pub struct KucoinAdapter {
    client: RestClient,
    base_url: String,
}

impl KucoinAdapter {
    pub fn new(client: RestClient) -> Self {
        Self::with_base_url(client, REST_BASE)
    }

    pub fn with_base_url(client: RestClient, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }
}

#[async_trait]
impl ExchangeAdapter for KucoinAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Kucoin
    }

    async fn fetch(&self, req: &FetchRequest) -> Result<Vec<Candle>, KfError> {
        let token =
            type_token(req.interval).ok_or(KfError::UnsupportedInterval { exchange: Exchange::Kucoin, interval: req.interval })?;
        let mut query = vec![("type", token.to_string()), ("symbol", to_native_symbol(&req.symbol)?)];
        if let Some(start) = req.start_time_ms {
            query.push(("startAt", ms_to_secs(start).to_string()));
        }
        if let Some(end) = req.end_time_ms {
            query.push(("endAt", ms_to_secs(end).to_string()));
        }

        let url = format!("{}{CANDLES_PATH}", self.base_url);
        let body = self.client.get_json(&url, &query).await?;
        Ok(finalize(json_parser::parse_candles(&body)?, req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_stub::HttpStub;

    #[test]
    fn type_tokens() {
        assert_eq!(type_token(Interval::Hour8), Some("8hour"));
        assert_eq!(type_token(Interval::Week1), Some("1week"));
        assert_eq!(type_token(Interval::Month1), None);
    }

    #[test]
    fn symbol_uses_dash() {
        assert_eq!(to_native_symbol("BTC/USDT").unwrap(), "BTC-USDT");
    }

    #[tokio::test]
    async fn fetch_returns_ascending() {
        let stub = HttpStub::ok(
            r#"{"code":"200000","data":[
                ["1545904980","0.058","0.049","0.058","0.049","0.018","0.000945"],
                ["1545904920","0.058","0.072","0.072","0.058","0.103","0.006986"]]}"#,
        )
        .await;
        let adapter = KucoinAdapter::with_base_url(HttpStub::client(), &stub.base_url);
        let candles = adapter.fetch(&FetchRequest::latest("BTC/USDT", Interval::Min1, 10)).await.unwrap();
        let ts: Vec<u64> = candles.iter().map(|c| c.timestamp_ms).collect();
        assert_eq!(ts, vec![1_545_904_920_000, 1_545_904_980_000]);
        let target = &stub.requests()[0];
        assert!(target.contains("type=1min") && target.contains("symbol=BTC-USDT"));
    }
}
