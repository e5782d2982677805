//! Wall-clock timestamps.
//!
//! Exchange timestamps are UTC epoch values, so everything here is based on
//! `SystemTime`. A clock set before the epoch reads as zero.

use std::time::{SystemTime, UNIX_EPOCH};

#[inline]
fn since_epoch() -> std::time::Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    since_epoch().as_millis() as u64
}

/// Current time as **microseconds** since Unix epoch.
#[inline]
pub fn now_us() -> u64 {
    since_epoch().as_micros() as u64
}

/// Seconds to milliseconds, saturating.
#[inline]
pub fn secs_to_ms(secs: u64) -> u64 {
    secs.saturating_mul(1_000)
}

/// Milliseconds to whole seconds (truncating).
#[inline]
pub fn ms_to_secs(ms: u64) -> u64 {
    ms / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_agree() {
        let ms = now_ms();
        let us = now_us();
        assert!(us / 1_000 >= ms);
        assert!(ms > 1_600_000_000_000);
    }

    #[test]
    fn unit_conversions() {
        assert_eq!(secs_to_ms(1_700_000_000), 1_700_000_000_000);
        assert_eq!(ms_to_secs(1_700_000_000_999), 1_700_000_000);
        assert_eq!(secs_to_ms(u64::MAX), u64::MAX);
    }
}
