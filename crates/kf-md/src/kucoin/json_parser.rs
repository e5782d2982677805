//! KuCoin `/api/v1/market/candles` parsing.

use kf_core::{Candle, KfError};
use serde_json::Value;

use crate::json_util::{RowLayout, parse_rows};

/// `[time (s), open, close, high, low, volume, turnover]`, newest first.
const CANDLE_ROW: RowLayout = RowLayout {
    min_len: 6,
    time: 0,
    time_scale: 1_000,
    open: 1,
    close: 2,
    high: 3,
    low: 4,
    volume: 5,
    quote_volume: Some(6),
    trades: None,
};

const SUCCESS: &str = "200000";

pub fn parse_candles(v: &Value) -> Result<Vec<Candle>, KfError> {
    let code = v.get("code").and_then(Value::as_str).ok_or_else(|| KfError::parse("kucoin: missing code"))?;
    if code != SUCCESS {
        let msg = v.get("msg").and_then(Value::as_str).unwrap_or_default();
        let lower = msg.to_ascii_lowercase();
        return Err(if lower.contains("pair") || lower.contains("symbol") {
            KfError::InvalidSymbol(msg.to_string())
        } else {
            KfError::Api { status: 200, message: format!("code {code}: {msg}") }
        });
    }
    let rows = v.get("data").and_then(Value::as_array).ok_or_else(|| KfError::parse("kucoin: missing data"))?;
    Ok(parse_rows("kucoin", rows, &CANDLE_ROW))
}
