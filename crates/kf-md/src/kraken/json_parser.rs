//! Kraken `/0/public/OHLC` parsing.
//!
//! ```json
//! {"error": [],
//!  "result": {"XXBTZUSD": [[1688671200, "30306.1", "30306.2", "30305.7",
//!                           "30305.7", "30306.1", "3.39243896", 23]],
//!             "last": 1688672160}}
//! ```
//!
//! The pair key in `result` is Kraken's own name for the pair and need not
//! match the one that was requested.

use kf_core::{Candle, KfError};
use serde_json::Value;
use tracing::warn;

use crate::json_util::{RowLayout, parse_row, parse_str_f64};

/// `[time (s), open, high, low, close, vwap, volume, count]`
const OHLC_ROW: RowLayout = RowLayout {
    min_len: 8,
    time: 0,
    time_scale: 1_000,
    open: 1,
    high: 2,
    low: 3,
    close: 4,
    volume: 6,
    quote_volume: None,
    trades: Some(7),
};
const VWAP: usize = 5;

pub fn parse_ohlc(v: &Value) -> Result<Vec<Candle>, KfError> {
    let errors: Vec<&str> = v
        .get("error")
        .and_then(Value::as_array)
        .map(|errs| errs.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if !errors.is_empty() {
        let joined = errors.join(", ");
        return Err(if joined.contains("Unknown asset pair") {
            KfError::InvalidSymbol(joined)
        } else {
            KfError::Api { status: 200, message: joined }
        });
    }

    let result = v.get("result").and_then(Value::as_object).ok_or_else(|| KfError::parse("kraken: missing result"))?;
    let rows = result
        .iter()
        .find(|(key, _)| key.as_str() != "last")
        .and_then(|(_, rows)| rows.as_array())
        .ok_or_else(|| KfError::parse("kraken: result holds no pair"))?;

    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        match parse_row(row, &OHLC_ROW) {
            Some(mut candle) => {
                // vwap * volume is the quote-currency volume of the bucket.
                candle.quote_volume = parse_str_f64(row.get(VWAP)).map(|vwap| vwap * candle.volume);
                out.push(candle);
            }
            None => warn!("[kraken] skipping malformed kline row {i}: {row}"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ohlc_rows_with_renamed_pair() {
        let body = json!({"error": [], "result": {
            "XXBTZUSD": [
                [1688671200, "30306.1", "30306.2", "30305.7", "30305.7", "30306.1", "2.0", 23],
                [1688671260, "30305.7", "30307.0", "30300.0", "30301.0", "30303.0", "1.0", 5],
                [1688671320, "oops"]
            ],
            "last": 1688672160
        }});
        let candles = parse_ohlc(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp_ms, 1_688_671_200_000);
        assert_eq!(candles[0].volume, 2.0);
        assert_eq!(candles[0].trades_count, Some(23));
        assert_eq!(candles[0].quote_volume, Some(30306.1 * 2.0));
    }

    #[test]
    fn error_array() {
        let unknown = json!({"error": ["EQuery:Unknown asset pair"]});
        assert!(matches!(parse_ohlc(&unknown), Err(KfError::InvalidSymbol(_))));
        let busy = json!({"error": ["EService:Unavailable"]});
        assert!(matches!(parse_ohlc(&busy), Err(KfError::Api { .. })));
        assert!(matches!(parse_ohlc(&json!({"error": [], "result": {"last": 1}})), Err(KfError::Parse(_))));
    }
}
