//! Typed error definitions for the kline feed.
//!
//! [`KfError`] is the single error type returned by every library API in the
//! workspace. Each variant corresponds to one failure class that callers are
//! expected to react to differently (retry, fall back, give up). All variants
//! implement `std::error::Error` via `thiserror`, so they convert into
//! `anyhow::Error` at the binary boundary.

use std::time::Duration;

use thiserror::Error;

use crate::types::{Exchange, Interval};

/// Domain-specific errors for the kline feed.
#[derive(Debug, Error)]
pub enum KfError {
    /// Transport failure: DNS, TCP, TLS, WebSocket handshake or a dropped socket.
    #[error("connection error: {0}")]
    Connection(String),

    /// The exchange answered with an error status or an error code in the body.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// HTTP 429. `retry_after` comes from the `Retry-After` header when present.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The exchange does not know the symbol, or the symbol is not `BASE/QUOTE`.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Response body or stream frame could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// A well-formed response that contained no usable candles.
    #[error("no data: {0}")]
    NoData(String),

    /// Every source of a race fetch failed. Errors are listed in priority order.
    #[error("all sources failed: {}", join_source_errors(.errors))]
    AllSourcesFailed { errors: Vec<(Exchange, KfError)> },

    /// A request or connection attempt exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The exchange has no native token for this interval.
    #[error("interval {interval} is not supported by {exchange}")]
    UnsupportedInterval { exchange: Exchange, interval: Interval },

    /// The caller passed a request that violates its own invariants.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// The persistence collaborator rejected a write.
    #[error("storage error: {0}")]
    Storage(String),

    /// The stream manager actor is no longer running.
    #[error("stream manager stopped")]
    ManagerStopped,
}

impl KfError {
    /// Shorthand used by the JSON parsers.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// `true` for failures that a later attempt against the same source may
    /// not hit again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

fn join_source_errors(errors: &[(Exchange, KfError)]) -> String {
    if errors.is_empty() {
        return "no sources configured".to_string();
    }
    errors.iter().map(|(exchange, err)| format!("{exchange}: {err}")).collect::<Vec<_>>().join("; ")
}
