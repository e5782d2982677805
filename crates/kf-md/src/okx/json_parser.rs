//! OKX v5 JSON parsing for `/api/v5/market/candles`.

use kf_core::{Candle, KfError};
use serde_json::Value;

use crate::json_util::{RowLayout, parse_rows};

/// `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`, newest first.
/// For spot pairs `volCcy` is denominated in the quote currency.
const CANDLE_ROW: RowLayout = RowLayout {
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

/// Instrument does not exist.
const INSTRUMENT_NOT_FOUND: &str = "51001";

pub fn parse_candles(v: &Value) -> Result<Vec<Candle>, KfError> {
    let code = v.get("code").and_then(Value::as_str).ok_or_else(|| KfError::parse("okx: missing code"))?;
    if code != "0" {
        let msg = v.get("msg").and_then(Value::as_str).unwrap_or_default();
        return Err(if code == INSTRUMENT_NOT_FOUND {
            KfError::InvalidSymbol(msg.to_string())
        } else {
            KfError::Api { status: 200, message: format!("code {code}: {msg}") }
        });
    }
    let rows = v.get("data").and_then(Value::as_array).ok_or_else(|| KfError::parse("okx: missing data"))?;
    Ok(parse_rows("okx", rows, &CANDLE_ROW))
}
