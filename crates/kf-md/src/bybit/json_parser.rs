//! Bybit v5 JSON parsing: REST `/v5/market/kline` and the public spot
//! `kline.<interval>.<symbol>` topic.

use kf_core::{Candle, KfError, StreamUpdate};
use serde_json::Value;
use tracing::warn;

use crate::json_util::{RowLayout, parse_f64_field, parse_rows, parse_u64_field};

/// `[startTime, open, high, low, close, volume, turnover]`, newest first.
const KLINE_ROW: RowLayout = RowLayout {
    min_len: 6,
    time: 0,
    time_scale: 1,
    open: 1,
    high: 2,
    low: 3,
    close: 4,
    volume: 5,
    quote_volume: Some(6),
    trades: None,
};

/// Build the subscription message for one kline topic.
pub fn build_subscribe(native_symbol: &str, interval_token: &str) -> String {
    serde_json::json!({
        "op": "subscribe",
        "args": [format!("kline.{interval_token}.{native_symbol}")]
    })
    .to_string()
}

/// Parse a `GET /v5/market/kline` response body.
pub fn parse_klines(v: &Value) -> Result<Vec<Candle>, KfError> {
    let ret_code = v.get("retCode").and_then(Value::as_i64).ok_or_else(|| KfError::parse("bybit: missing retCode"))?;
    if ret_code != 0 {
        let msg = v.get("retMsg").and_then(Value::as_str).unwrap_or_default();
        return Err(if msg.to_ascii_lowercase().contains("symbol") {
            KfError::InvalidSymbol(msg.to_string())
        } else {
            KfError::Api { status: 200, message: format!("retCode {ret_code}: {msg}") }
        });
    }
    let rows = v
        .get("result")
        .and_then(|r| r.get("list"))
        .and_then(Value::as_array)
        .ok_or_else(|| KfError::parse("bybit: missing result.list"))?;
    Ok(parse_rows("bybit", rows, &KLINE_ROW))
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Parse one frame from the public spot stream.
///
/// Operation responses (subscribe acks, pongs) yield no updates; a rejected
/// operation is an error. Kline frames carry one or more entries in `data`;
/// a malformed entry is skipped without discarding the rest of the frame.
pub fn parse_stream_message(text: &str) -> Result<Vec<StreamUpdate>, KfError> {
    let v: Value = serde_json::from_str(text).map_err(|e| KfError::parse(format!("bybit frame: {e}")))?;

    if let Some(op) = v.get("op").and_then(Value::as_str) {
        if v.get("success").and_then(Value::as_bool) == Some(false) {
            let msg = v.get("ret_msg").and_then(Value::as_str).unwrap_or_default();
            return Err(KfError::Api { status: 200, message: format!("{op} rejected: {msg}") });
        }
        return Ok(vec![]);
    }

    let is_kline = v.get("topic").and_then(Value::as_str).is_some_and(|t| t.starts_with("kline."));
    if !is_kline {
        return Ok(vec![]);
    }

    let data = v.get("data").and_then(Value::as_array).ok_or_else(|| KfError::parse("bybit kline frame without data"))?;
    let mut updates = Vec::with_capacity(data.len());
    for (i, item) in data.iter().enumerate() {
        match parse_stream_entry(item) {
            Ok(update) => updates.push(update),
            Err(e) => warn!("[bybit] skipping kline entry {i}: {e}"),
        }
    }
    Ok(updates)
}

fn parse_stream_entry(item: &Value) -> Result<StreamUpdate, KfError> {
    let missing = |field: &str| KfError::parse(format!("bybit kline entry missing {field}"));
    let candle = Candle {
        timestamp_ms: parse_u64_field(item, "start").ok_or_else(|| missing("start"))?,
        open: parse_f64_field(item, "open").ok_or_else(|| missing("open"))?,
        high: parse_f64_field(item, "high").ok_or_else(|| missing("high"))?,
        low: parse_f64_field(item, "low").ok_or_else(|| missing("low"))?,
        close: parse_f64_field(item, "close").ok_or_else(|| missing("close"))?,
        volume: parse_f64_field(item, "volume").ok_or_else(|| missing("volume"))?,
        quote_volume: parse_f64_field(item, "turnover"),
        trades_count: None,
    };
    candle.validate()?;
    let is_closed = item.get("confirm").and_then(Value::as_bool).unwrap_or(false);
    Ok(StreamUpdate { candle, is_closed })
}
