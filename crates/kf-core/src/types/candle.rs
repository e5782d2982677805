//! Candle (OHLCV) value types and the REST fetch request/response pair.

use serde::{Deserialize, Serialize};

use super::enums::{Exchange, Interval};
use super::symbol::split_pair;
use crate::error::KfError;

/// Largest `limit` a [`FetchRequest`] may carry. Adapters cap it further to
/// their exchange maximum.
pub const MAX_FETCH_LIMIT: u32 = 1000;

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// One OHLCV bucket. `timestamp_ms` is the bucket open time in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trades_count: Option<u64>,
}

impl Candle {
    /// Check the candle invariants: finite positive prices, non-negative
    /// volumes, `high >= low`.
    pub fn validate(&self) -> Result<(), KfError> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(KfError::parse(format!("non-positive price in candle at {}", self.timestamp_ms)));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(KfError::parse(format!("negative volume in candle at {}", self.timestamp_ms)));
        }
        if let Some(q) = self.quote_volume {
            if !q.is_finite() || q < 0.0 {
                return Err(KfError::parse(format!("negative quote volume in candle at {}", self.timestamp_ms)));
            }
        }
        if self.high < self.low {
            return Err(KfError::parse(format!(
                "high {} below low {} in candle at {}",
                self.high, self.low, self.timestamp_ms
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Exclusive end of the bucket.
    #[inline]
    pub fn close_time_ms(&self, interval: Interval) -> u64 {
        self.timestamp_ms.saturating_add(interval.duration_ms())
    }

    /// Whether the bucket has ended at wall-clock `now_ms`.
    #[inline]
    pub fn is_closed_at(&self, interval: Interval, now_ms: u64) -> bool {
        self.close_time_ms(interval) <= now_ms
    }
}

/// A candle as delivered by a live source. Only `is_closed == true` updates
/// are eligible for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StreamUpdate {
    pub candle: Candle,
    pub is_closed: bool,
}

impl StreamUpdate {
    pub fn closed(candle: Candle) -> Self {
        Self { candle, is_closed: true }
    }

    pub fn forming(candle: Candle) -> Self {
        Self { candle, is_closed: false }
    }
}

// ---------------------------------------------------------------------------
// FetchRequest / FetchResult
// ---------------------------------------------------------------------------

/// A historical candle request. `symbol` is canonical `BASE/QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub symbol: String,
    pub interval: Interval,
    pub limit: u32,
    #[serde(default)]
    pub start_time_ms: Option<u64>,
    #[serde(default)]
    pub end_time_ms: Option<u64>,
}

impl FetchRequest {
    /// The most recent `limit` candles.
    pub fn latest(symbol: impl Into<String>, interval: Interval, limit: u32) -> Self {
        Self { symbol: symbol.into(), interval, limit, start_time_ms: None, end_time_ms: None }
    }

    pub fn with_range(mut self, start_time_ms: Option<u64>, end_time_ms: Option<u64>) -> Self {
        self.start_time_ms = start_time_ms;
        self.end_time_ms = end_time_ms;
        self
    }

    pub fn validate(&self) -> Result<(), KfError> {
        split_pair(&self.symbol)?;
        if self.limit == 0 || self.limit > MAX_FETCH_LIMIT {
            return Err(KfError::InvalidRequest(format!(
                "limit must be within 1..={MAX_FETCH_LIMIT}, got {}",
                self.limit
            )));
        }
        if let (Some(start), Some(end)) = (self.start_time_ms, self.end_time_ms) {
            if end <= start {
                return Err(KfError::InvalidRequest(format!("end_time {end} must be after start_time {start}")));
            }
        }
        Ok(())
    }

    /// `limit` clamped to an exchange maximum.
    #[inline]
    pub fn capped_limit(&self, exchange_max: u32) -> u32 {
        self.limit.min(exchange_max)
    }
}

/// A successful fetch: candles ascending by timestamp plus provenance.
#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub candles: Vec<Candle>,
    pub exchange: Exchange,
    pub symbol: String,
    pub interval: Interval,
    /// Wall time from request start to the winning response.
    pub fetch_time_ms: u64,
}

impl FetchResult {
    #[inline]
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: u64) -> Candle {
        Candle {
            timestamp_ms: ts,
            open: 100.0,
            high: 110.0,
            low: 95.0,
            close: 105.0,
            volume: 12.5,
            quote_volume: None,
            trades_count: None,
        }
    }

    #[test]
    fn valid_candle_passes() {
        assert!(candle(0).is_valid());
    }

    #[test]
    fn candle_invariants() {
        let mut c = candle(0);
        c.high = 90.0;
        assert!(c.validate().is_err());

        let mut c = candle(0);
        c.open = 0.0;
        assert!(c.validate().is_err());

        let mut c = candle(0);
        c.volume = -1.0;
        assert!(c.validate().is_err());

        let mut c = candle(0);
        c.close = f64::NAN;
        assert!(c.validate().is_err());

        let mut c = candle(0);
        c.volume = 0.0;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn closed_bucket_check() {
        let c = candle(60_000);
        assert!(!c.is_closed_at(Interval::Min1, 119_999));
        assert!(c.is_closed_at(Interval::Min1, 120_000));
    }

    #[test]
    fn request_validation() {
        assert!(FetchRequest::latest("BTC/USDT", Interval::Hour1, 100).validate().is_ok());
        assert!(FetchRequest::latest("BTC/USDT", Interval::Hour1, 0).validate().is_err());
        assert!(FetchRequest::latest("BTC/USDT", Interval::Hour1, 1001).validate().is_err());
        assert!(FetchRequest::latest("BTCUSDT", Interval::Hour1, 10).validate().is_err());

        let inverted = FetchRequest::latest("BTC/USDT", Interval::Hour1, 10).with_range(Some(2_000), Some(1_000));
        assert!(matches!(inverted.validate(), Err(KfError::InvalidRequest(_))));

        let open_ended = FetchRequest::latest("BTC/USDT", Interval::Hour1, 10).with_range(Some(2_000), None);
        assert!(open_ended.validate().is_ok());
    }

    #[test]
    fn capped_limit_respects_exchange_max() {
        let req = FetchRequest::latest("ETH/USDT", Interval::Min5, 1000);
        assert_eq!(req.capped_limit(300), 300);
        assert_eq!(req.capped_limit(1500), 1000);
    }
}
