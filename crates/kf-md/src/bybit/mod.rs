//! Bybit v5 spot klines: REST adapter and public kline stream.
//!
//! - REST `GET /v5/market/kline?category=spot`, up to 1000 rows, newest first.
//! - Stream `wss://stream.bybit.com/v5/public/spot`, subscribed with
//!   `{"op":"subscribe","args":["kline.<interval>.<SYMBOL>"]}` and kept alive
//!   with `{"op":"ping"}`.

pub mod json_parser;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kf_core::ws::PingPayload;
use kf_core::{Candle, Exchange, FetchRequest, Interval, KfError, join_pair};

use crate::ExchangeAdapter;
use crate::json_util::finalize;
use crate::rest::RestClient;
use crate::stream::{PingConfig, StreamDef};

pub const REST_BASE: &str = "https://api.bybit.com";
const KLINE_PATH: &str = "/v5/market/kline";
const WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";

pub const MAX_LIMIT: u32 = 1000;

/// `BTC/USDT` → `BTCUSDT`.
pub fn to_native_symbol(symbol: &str) -> Result<String, KfError> {
    join_pair(symbol, "")
}

/// Bybit interval tokens. There is no 8h or 3d bucket.
pub fn interval_token(interval: Interval) -> Option<&'static str> {
    Some(match interval {
        Interval::Min1 => "1",
        Interval::Min3 => "3",
        Interval::Min5 => "5",
        Interval::Min15 => "15",
        Interval::Min30 => "30",
        Interval::Hour1 => "60",
        Interval::Hour2 => "120",
        Interval::Hour4 => "240",
        Interval::Hour6 => "360",
        Interval::Hour12 => "720",
        Interval::Day1 => "D",
        Interval::Week1 => "W",
        Interval::Month1 => "M",
        Interval::Hour8 | Interval::Day3 => return None,
    })
}

fn require_token(interval: Interval) -> Result<&'static str, KfError> {
    interval_token(interval).ok_or(KfError::UnsupportedInterval { exchange: Exchange::Bybit, interval })
}

/// REST adapter for `GET /v5/market/kline`.
pub struct BybitAdapter {
    client: RestClient,
    base_url: String,
}

impl BybitAdapter {
    pub fn new(client: RestClient) -> Self {
        Self::with_base_url(client, REST_BASE)
    }

    pub fn with_base_url(client: RestClient, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn fetch(&self, req: &FetchRequest) -> Result<Vec<Candle>, KfError> {
        let mut query = vec![
            ("category", "spot".to_string()),
            ("symbol", to_native_symbol(&req.symbol)?),
            ("interval", require_token(req.interval)?.to_string()),
            ("limit", req.capped_limit(MAX_LIMIT).to_string()),
        ];
        if let Some(start) = req.start_time_ms {
            query.push(("start", start.to_string()));
        }
        if let Some(end) = req.end_time_ms {
            query.push(("end", end.to_string()));
        }

        let url = format!("{}{KLINE_PATH}", self.base_url);
        let body = self.client.get_json(&url, &query).await?;
        Ok(finalize(json_parser::parse_klines(&body)?, req))
    }
}

/// Stream definition for one symbol's kline topic.
pub fn stream_def(symbol: &str, interval: Interval, ping_interval: Duration) -> Result<StreamDef, KfError> {
    let native = to_native_symbol(symbol)?;
    let token = require_token(interval)?;
    Ok(StreamDef {
        label: format!("bybit_kline_{native}_{interval}"),
        exchange: Exchange::Bybit,
        ws_url: WS_URL.to_string(),
        subscribe_msg: Some(json_parser::build_subscribe(&native, token)),
        ping: Some(PingConfig { interval: ping_interval, payload: PingPayload::Json(serde_json::json!({"op": "ping"})) }),
        text_parser: Arc::new(json_parser::parse_stream_message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_stub::HttpStub;

    #[test]
    fn interval_tokens() {
        assert_eq!(interval_token(Interval::Hour1), Some("60"));
        assert_eq!(interval_token(Interval::Day1), Some("D"));
        assert_eq!(interval_token(Interval::Hour8), None);
        assert!(matches!(
            require_token(Interval::Day3),
            Err(KfError::UnsupportedInterval { exchange: Exchange::Bybit, interval: Interval::Day3 })
        ));
    }

    #[test]
    fn stream_def_subscribes_to_topic() {
        let def = stream_def("SOL/USDT", Interval::Min15, Duration::from_secs(20)).unwrap();
        assert_eq!(def.ws_url, WS_URL);
        let sub: serde_json::Value = serde_json::from_str(def.subscribe_msg.as_deref().unwrap()).unwrap();
        assert_eq!(sub, serde_json::json!({"op": "subscribe", "args": ["kline.15.SOLUSDT"]}));
        assert!(matches!(def.ping.map(|p| p.payload), Some(PingPayload::Json(_))));
    }

    #[tokio::test]
    async fn fetch_returns_ascending() {
        let stub = HttpStub::ok(
            r#"{"retCode":0,"retMsg":"OK","result":{"category":"spot","symbol":"BTCUSDT","list":[
                ["1670608800000","17071","17073","17027","17055.5","268611","15.74462667"],
                ["1670605200000","17071.5","17071.5","17061","17071","4177","0.24469757"]]}}"#,
        )
        .await;
        let adapter = BybitAdapter::with_base_url(HttpStub::client(), &stub.base_url);
        let candles = adapter.fetch(&FetchRequest::latest("BTC/USDT", Interval::Hour1, 10)).await.unwrap();
        let ts: Vec<u64> = candles.iter().map(|c| c.timestamp_ms).collect();
        assert_eq!(ts, vec![1_670_605_200_000, 1_670_608_800_000]);
        let target = &stub.requests()[0];
        assert!(target.contains("category=spot") && target.contains("interval=60"));
    }
}
