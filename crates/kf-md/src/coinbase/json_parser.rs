//! Coinbase Exchange `/products/<id>/candles` parsing.

use kf_core::{Candle, KfError};
use serde_json::Value;

use crate::json_util::{RowLayout, parse_rows};

/// `[time (s), low, high, open, close, volume]`, newest first.
const CANDLE_ROW: RowLayout = RowLayout {
    min_len: 6,
    time: 0,
    time_scale: 1_000,
    low: 1,
    high: 2,
    open: 3,
    close: 4,
    volume: 5,
    quote_volume: None,
    trades: None,
};

pub fn parse_candles(v: &Value) -> Result<Vec<Candle>, KfError> {
    if let Some(msg) = v.get("message").and_then(Value::as_str) {
        return Err(KfError::Api { status: 200, message: msg.to_string() });
    }
    let rows = v.as_array().ok_or_else(|| KfError::parse("coinbase candles: expected an array"))?;
    Ok(parse_rows("coinbase", rows, &CANDLE_ROW))
}
