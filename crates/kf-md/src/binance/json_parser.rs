//! Binance JSON parsing: REST klines and the `<symbol>@kline_<interval>`
//! stream.

use kf_core::{Candle, KfError, StreamUpdate};
use serde_json::Value;

use crate::json_util::{RowLayout, parse_f64_field, parse_rows, parse_u64_field};

/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume, trades, ...]`
const KLINE_ROW: RowLayout = RowLayout {
    min_len: 9,
    time: 0,
    time_scale: 1,
    open: 1,
    high: 2,
    low: 3,
    close: 4,
    volume: 5,
    quote_volume: Some(7),
    trades: Some(8),
};

/// Error code Binance returns for an unknown symbol.
pub const INVALID_SYMBOL_CODE: i64 = -1121;

/// Parse a `GET /api/v3/klines` response body.
pub fn parse_klines(v: &Value) -> Result<Vec<Candle>, KfError> {
    if let Some(code) = v.get("code").and_then(Value::as_i64) {
        let msg = v.get("msg").and_then(Value::as_str).unwrap_or_default();
        return Err(if code == INVALID_SYMBOL_CODE {
            KfError::InvalidSymbol(msg.to_string())
        } else {
            KfError::Api { status: 200, message: format!("code {code}: {msg}") }
        });
    }
    let rows = v.as_array().ok_or_else(|| KfError::parse("binance klines: expected an array"))?;
    Ok(parse_rows("binance", rows, &KLINE_ROW))
}

/// Extract the Binance error code from an error body such as
/// `{"code":-1121,"msg":"Invalid symbol."}`.
pub fn error_code(body: &str) -> Option<i64> {
    let v: Value = serde_json::from_str(body).ok()?;
    v.get("code")?.as_i64()
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Parse one frame of a raw kline stream.
///
/// ```json
/// {"e":"kline","E":1672515782136,"s":"BTCUSDT",
///  "k":{"t":1672515780000,"T":1672515839999,"i":"1m","o":"16578.5","c":"16580.1",
///       "h":"16581.0","l":"16578.0","v":"12.3","n":154,"x":false,"q":"203990.1"}}
/// ```
pub fn parse_stream_message(text: &str) -> Result<Vec<StreamUpdate>, KfError> {
    let v: Value = serde_json::from_str(text).map_err(|e| KfError::parse(format!("binance frame: {e}")))?;

    if v.get("e").and_then(Value::as_str) != Some("kline") {
        return Ok(vec![]);
    }
    let k = v.get("k").ok_or_else(|| KfError::parse("binance kline frame without k"))?;
    let missing = |field: &str| KfError::parse(format!("binance kline frame missing {field}"));

    let candle = Candle {
        timestamp_ms: parse_u64_field(k, "t").ok_or_else(|| missing("t"))?,
        open: parse_f64_field(k, "o").ok_or_else(|| missing("o"))?,
        high: parse_f64_field(k, "h").ok_or_else(|| missing("h"))?,
        low: parse_f64_field(k, "l").ok_or_else(|| missing("l"))?,
        close: parse_f64_field(k, "c").ok_or_else(|| missing("c"))?,
        volume: parse_f64_field(k, "v").ok_or_else(|| missing("v"))?,
        quote_volume: parse_f64_field(k, "q"),
        trades_count: parse_u64_field(k, "n"),
    };
    candle.validate()?;

    let is_closed = k.get("x").and_then(Value::as_bool).unwrap_or(false);
    Ok(vec![StreamUpdate { candle, is_closed }])
}
