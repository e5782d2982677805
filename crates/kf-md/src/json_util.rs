//! Shared JSON parsing helpers used by all exchange modules.
//!
//! Exchanges encode numbers either as JSON strings (`"30000.5"`) or native
//! numbers, and deliver kline rows as positional arrays. These helpers turn a
//! row into a [`Candle`] and bring a parsed batch into canonical shape.

use kf_core::{Candle, FetchRequest};
use serde_json::Value;
use tracing::warn;

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        fast_float2::parse(s).ok()
    } else {
        v.as_f64()
    }
}

/// Parse a JSON value (string or number) as `u64`.
#[inline]
pub fn parse_str_u64(v: Option<&Value>) -> Option<u64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_u64()
    }
}

/// Parse a named field on a JSON object as `f64` (string or number).
#[inline]
pub fn parse_f64_field(v: &Value, key: &str) -> Option<f64> {
    parse_str_f64(v.get(key))
}

/// Parse a named field on a JSON object as `u64` (string or number).
#[inline]
pub fn parse_u64_field(v: &Value, key: &str) -> Option<u64> {
    parse_str_u64(v.get(key))
}

/// Column positions of one exchange's kline row layout.
#[derive(Debug, Clone, Copy)]
pub struct RowLayout {
    pub min_len: usize,
    pub time: usize,
    /// Multiplier that brings the time column to milliseconds.
    pub time_scale: u64,
    pub open: usize,
    pub high: usize,
    pub low: usize,
    pub close: usize,
    pub volume: usize,
    pub quote_volume: Option<usize>,
    pub trades: Option<usize>,
}

/// Decode one positional row. `None` if the row is short, a required column
/// does not parse, or the candle violates its invariants.
pub fn parse_row(row: &Value, layout: &RowLayout) -> Option<Candle> {
    let arr = row.as_array()?;
    if arr.len() < layout.min_len {
        return None;
    }
    let candle = Candle {
        timestamp_ms: parse_str_u64(arr.get(layout.time))?.checked_mul(layout.time_scale)?,
        open: parse_str_f64(arr.get(layout.open))?,
        high: parse_str_f64(arr.get(layout.high))?,
        low: parse_str_f64(arr.get(layout.low))?,
        close: parse_str_f64(arr.get(layout.close))?,
        volume: parse_str_f64(arr.get(layout.volume))?,
        quote_volume: layout.quote_volume.and_then(|i| parse_str_f64(arr.get(i))),
        trades_count: layout.trades.and_then(|i| parse_str_u64(arr.get(i))),
    };
    candle.is_valid().then_some(candle)
}

/// Decode every row, skipping (and logging) the bad ones.
pub fn parse_rows(label: &str, rows: &[Value], layout: &RowLayout) -> Vec<Candle> {
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        match parse_row(row, layout) {
            Some(c) => out.push(c),
            None => warn!("[{label}] skipping malformed kline row {i}: {row}"),
        }
    }
    out
}

/// Sort ascending and collapse duplicate timestamps (the later row wins).
pub fn sort_dedup(mut candles: Vec<Candle>) -> Vec<Candle> {
    // Stable sort keeps arrival order among equal timestamps.
    candles.sort_by_key(|c| c.timestamp_ms);
    let mut out: Vec<Candle> = Vec::with_capacity(candles.len());
    for c in candles {
        match out.last_mut() {
            Some(last) if last.timestamp_ms == c.timestamp_ms => *last = c,
            _ => out.push(c),
        }
    }
    out
}

/// Bring a parsed batch into the shape every adapter returns: ascending,
/// unique, inside the requested window, at most `limit` long.
///
/// When the request has a start time the earliest `limit` candles are kept,
/// otherwise the most recent `limit`.
pub fn finalize(candles: Vec<Candle>, req: &FetchRequest) -> Vec<Candle> {
    let mut out = sort_dedup(candles);
    if let Some(start) = req.start_time_ms {
        out.retain(|c| c.timestamp_ms >= start);
    }
    if let Some(end) = req.end_time_ms {
        out.retain(|c| c.timestamp_ms <= end);
    }
    let limit = req.limit as usize;
    if out.len() > limit {
        if req.start_time_ms.is_some() {
            out.truncate(limit);
        } else {
            out.drain(..out.len() - limit);
        }
    }
    out
}

/// Cut an error body down to something loggable.
pub fn truncate_body(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
