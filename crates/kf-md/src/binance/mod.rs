//! Binance spot klines: REST adapter and raw kline stream.
//!
//! - REST `GET /api/v3/klines`, up to 1000 rows per request.
//! - Stream `wss://stream.binance.com:9443/ws/<symbol>@kline_<interval>`. The
//!   stream name lives in the URL, so no subscribe message is sent. Binance
//!   pings the client; the connection answers with pongs.

pub mod json_parser;

use std::sync::Arc;

use async_trait::async_trait;
use kf_core::{Candle, Exchange, FetchRequest, Interval, KfError, join_pair};

use crate::ExchangeAdapter;
use crate::json_util::finalize;
use crate::rest::RestClient;
use crate::stream::StreamDef;

pub const REST_BASE: &str = "https://api.binance.com";
const KLINES_PATH: &str = "/api/v3/klines";
const WS_BASE: &str = "wss://stream.binance.com:9443/ws";

/// Maximum rows per klines request.
pub const MAX_LIMIT: u32 = 1000;

/// `BTC/USDT` → `BTCUSDT`.
pub fn to_native_symbol(symbol: &str) -> Result<String, KfError> {
    join_pair(symbol, "")
}

/// Binance accepts every canonical interval token verbatim.
pub fn interval_token(interval: Interval) -> &'static str {
    interval.as_str()
}

/// REST adapter for `GET /api/v3/klines`.
pub struct BinanceAdapter {
    client: RestClient,
    base_url: String,
}

impl BinanceAdapter {
    pub fn new(client: RestClient) -> Self {
        Self::with_base_url(client, REST_BASE)
    }

    pub fn with_base_url(client: RestClient, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn fetch(&self, req: &FetchRequest) -> Result<Vec<Candle>, KfError> {
        let mut query = vec![
            ("symbol", to_native_symbol(&req.symbol)?),
            ("interval", interval_token(req.interval).to_string()),
            ("limit", req.capped_limit(MAX_LIMIT).to_string()),
        ];
        if let Some(start) = req.start_time_ms {
            query.push(("startTime", start.to_string()));
        }
        if let Some(end) = req.end_time_ms {
            query.push(("endTime", end.to_string()));
        }

        let url = format!("{}{KLINES_PATH}", self.base_url);
        let body = match self.client.get_json(&url, &query).await {
            Err(KfError::Api { message, .. })
                if json_parser::error_code(&message) == Some(json_parser::INVALID_SYMBOL_CODE) =>
            {
                return Err(KfError::InvalidSymbol(req.symbol.clone()));
            }
            other => other?,
        };
        Ok(finalize(json_parser::parse_klines(&body)?, req))
    }
}

/// Stream definition for one symbol's kline feed.
pub fn stream_def(symbol: &str, interval: Interval) -> Result<StreamDef, KfError> {
    let native = to_native_symbol(symbol)?.to_ascii_lowercase();
    Ok(StreamDef {
        label: format!("binance_kline_{native}_{interval}"),
        exchange: Exchange::Binance,
        ws_url: format!("{WS_BASE}/{native}@kline_{}", interval_token(interval)),
        subscribe_msg: None,
        ping: None,
        text_parser: Arc::new(json_parser::parse_stream_message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_stub::HttpStub;

    #[test]
    fn symbol_conversion() {
        assert_eq!(to_native_symbol("BTC/USDT").unwrap(), "BTCUSDT");
        assert!(matches!(to_native_symbol("BTCUSDT"), Err(KfError::InvalidSymbol(_))));
    }

    #[test]
    fn stream_url_embeds_symbol_and_interval() {
        let def = stream_def("ETH/USDT", Interval::Min5).unwrap();
        assert_eq!(def.ws_url, "wss://stream.binance.com:9443/ws/ethusdt@kline_5m");
        assert!(def.subscribe_msg.is_none());
        assert_eq!(def.exchange, Exchange::Binance);
    }

    #[test]
    fn month_token_is_upper_case() {
        assert_eq!(interval_token(Interval::Month1), "1M");
    }

    #[tokio::test]
    async fn fetch_against_stub() {
        let stub = HttpStub::ok(
            r#"[[1499040000000,"0.0163","0.8","0.0157","0.0159","148976.1",1499644799999,"2434.19",308,"0","0","0"],
                [1499040060000,"0.0159","0.0161","0.0150","0.0160","100.0",1499040119999,"1.6",12,"0","0","0"]]"#,
        )
        .await;
        let adapter = BinanceAdapter::with_base_url(HttpStub::client(), &stub.base_url);
        let candles = adapter.fetch(&FetchRequest::latest("BTC/USDT", Interval::Min1, 1)).await.unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].timestamp_ms, 1_499_040_060_000);
        let target = &stub.requests()[0];
        assert!(target.starts_with("/api/v3/klines?"));
        assert!(target.contains("symbol=BTCUSDT") && target.contains("interval=1m"));
    }

    #[tokio::test]
    async fn unknown_symbol_in_http_400() {
        let stub = HttpStub::serve(400, r#"{"code":-1121,"msg":"Invalid symbol."}"#).await;
        let adapter = BinanceAdapter::with_base_url(HttpStub::client(), &stub.base_url);
        let err = adapter.fetch(&FetchRequest::latest("FOO/BAR", Interval::Min1, 5)).await.unwrap_err();
        assert!(matches!(err, KfError::InvalidSymbol(s) if s == "FOO/BAR"));

        let other = HttpStub::serve(400, r#"{"code":-1100,"msg":"Illegal characters."}"#).await;
        let adapter = BinanceAdapter::with_base_url(HttpStub::client(), &other.base_url);
        let err = adapter.fetch(&FetchRequest::latest("FOO/BAR", Interval::Min1, 5)).await.unwrap_err();
        assert!(matches!(err, KfError::Api { status: 400, .. }));
    }
}
