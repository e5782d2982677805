//! Kraken REST OHLC.
//!
//! `GET /0/public/OHLC?pair=XBTUSDT&interval=<minutes>&since=<seconds>`.
//! Kraken names some assets differently (BTC is XBT, DOGE is XDG), takes no
//! limit parameter and returns up to 720 rows.

pub mod json_parser;

use async_trait::async_trait;
use kf_core::time_util::ms_to_secs;
use kf_core::{Candle, Exchange, FetchRequest, Interval, KfError, split_pair};

use crate::ExchangeAdapter;
use crate::json_util::finalize;
use crate::rest::RestClient;

pub const REST_BASE: &str = "https://api.kraken.com";
const OHLC_PATH: &str = "/0/public/OHLC";

pub const MAX_LIMIT: u32 = 720;

fn asset_code(asset: &str) -> &str {
    match asset {
        "BTC" => "XBT",
        "DOGE" => "XDG",
        other => other,
    }
}

/// `BTC/USDT` → `XBTUSDT`.
pub fn to_pair(symbol: &str) -> Result<String, KfError> {
    let (base, quote) = split_pair(symbol)?;
    Ok(format!("{}{}", asset_code(base), asset_code(quote)))
}

/// Interval in minutes.
pub fn interval_minutes(interval: Interval) -> Option<u64> {
    match interval {
        Interval::Min1
        | Interval::Min5
        | Interval::Min15
        | Interval::Min30
        | Interval::Hour1
        | Interval::Hour4
        | Interval::Day1
        | Interval::Week1 => Some(interval.duration_minutes()),
        _ => None,
    }
}

pub struct KrakenAdapter {
    client: RestClient,
    base_url: String,
}

impl KrakenAdapter {
    pub fn new(client: RestClient) -> Self {
        Self::with_base_url(client, REST_BASE)
    }

    pub fn with_base_url(client: RestClient, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }
}

#[async_trait]
impl ExchangeAdapter for KrakenAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Kraken
    }

    async fn fetch(&self, req: &FetchRequest) -> Result<Vec<Candle>, KfError> {
        let minutes = interval_minutes(req.interval)
            .ok_or(KfError::UnsupportedInterval { exchange: Exchange::Kraken, interval: req.interval })?;
        let mut query = vec![("pair", to_pair(&req.symbol)?), ("interval", minutes.to_string())];
        if let Some(start) = req.start_time_ms {
            // `since` is exclusive; step back one second to keep `start` itself.
            query.push(("since", ms_to_secs(start).saturating_sub(1).to_string()));
        }

        let url = format!("{}{OHLC_PATH}", self.base_url);
        let body = self.client.get_json(&url, &query).await?;
        let mut capped = req.clone();
        capped.limit = req.capped_limit(MAX_LIMIT);
        Ok(finalize(json_parser::parse_ohlc(&body)?, &capped))
    }
}
