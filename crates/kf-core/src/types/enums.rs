//! Enumerations used throughout the kline feed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KfError;

// ---------------------------------------------------------------------------
// Exchange identifiers
// ---------------------------------------------------------------------------

/// Supported cryptocurrency exchanges.
///
/// The declaration order is the default race priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Okx,
    Bybit,
    Coinbase,
    Kraken,
    Kucoin,
}

impl Exchange {
    /// Every exchange, in default priority order.
    pub const ALL: [Exchange; 6] =
        [Self::Binance, Self::Okx, Self::Bybit, Self::Coinbase, Self::Kraken, Self::Kucoin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Okx => "okx",
            Self::Bybit => "bybit",
            Self::Coinbase => "coinbase",
            Self::Kraken => "kraken",
            Self::Kucoin => "kucoin",
        }
    }

    /// Whether a WebSocket kline stream exists for this exchange.
    pub fn supports_streaming(&self) -> bool {
        matches!(self, Self::Binance | Self::Bybit)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = KfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == lower)
            .ok_or_else(|| KfError::Config(format!("unknown exchange: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Candle intervals
// ---------------------------------------------------------------------------

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Candle bucket length.
///
/// Serialized with its canonical token (`"1m"`, `"4h"`, `"1M"`...). Note the
/// case sensitivity: `1m` is one minute, `1M` is one month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "3m")]
    Min3,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "6h")]
    Hour6,
    #[serde(rename = "8h")]
    Hour8,
    #[serde(rename = "12h")]
    Hour12,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "3d")]
    Day3,
    #[serde(rename = "1w")]
    Week1,
    #[serde(rename = "1M")]
    Month1,
}

impl Interval {
    pub const ALL: [Interval; 15] = [
        Self::Min1,
        Self::Min3,
        Self::Min5,
        Self::Min15,
        Self::Min30,
        Self::Hour1,
        Self::Hour2,
        Self::Hour4,
        Self::Hour6,
        Self::Hour8,
        Self::Hour12,
        Self::Day1,
        Self::Day3,
        Self::Week1,
        Self::Month1,
    ];

    /// Canonical token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Min1 => "1m",
            Self::Min3 => "3m",
            Self::Min5 => "5m",
            Self::Min15 => "15m",
            Self::Min30 => "30m",
            Self::Hour1 => "1h",
            Self::Hour2 => "2h",
            Self::Hour4 => "4h",
            Self::Hour6 => "6h",
            Self::Hour8 => "8h",
            Self::Hour12 => "12h",
            Self::Day1 => "1d",
            Self::Day3 => "3d",
            Self::Week1 => "1w",
            Self::Month1 => "1M",
        }
    }

    /// Bucket length in milliseconds. A month counts as 30 days; this value is
    /// only used to decide whether a bucket has closed.
    pub fn duration_ms(&self) -> u64 {
        match self {
            Self::Min1 => MINUTE_MS,
            Self::Min3 => 3 * MINUTE_MS,
            Self::Min5 => 5 * MINUTE_MS,
            Self::Min15 => 15 * MINUTE_MS,
            Self::Min30 => 30 * MINUTE_MS,
            Self::Hour1 => HOUR_MS,
            Self::Hour2 => 2 * HOUR_MS,
            Self::Hour4 => 4 * HOUR_MS,
            Self::Hour6 => 6 * HOUR_MS,
            Self::Hour8 => 8 * HOUR_MS,
            Self::Hour12 => 12 * HOUR_MS,
            Self::Day1 => DAY_MS,
            Self::Day3 => 3 * DAY_MS,
            Self::Week1 => 7 * DAY_MS,
            Self::Month1 => 30 * DAY_MS,
        }
    }

    #[inline]
    pub fn duration_secs(&self) -> u64 {
        self.duration_ms() / 1_000
    }

    #[inline]
    pub fn duration_minutes(&self) -> u64 {
        self.duration_ms() / MINUTE_MS
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = KfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        Self::ALL
            .into_iter()
            .find(|i| i.as_str() == token)
            .ok_or_else(|| KfError::InvalidRequest(format!("unknown interval: {s}")))
    }
}
