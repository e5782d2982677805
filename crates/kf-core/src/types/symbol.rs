//! Canonical symbol utilities.
//!
//! Every API in the workspace speaks canonical `BASE/QUOTE` symbols
//! (`"BTC/USDT"`). Exchange adapters convert to their native form at the edge
//! with [`split_pair`] plus their own joining rule.

use crate::error::KfError;

/// Split a canonical `BASE/QUOTE` symbol into its two legs.
///
/// Both legs must be non-empty and alphanumeric, and there must be exactly
/// one separator.
pub fn split_pair(symbol: &str) -> Result<(&str, &str), KfError> {
    let mut parts = symbol.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(base), Some(quote), None) if is_leg(base) && is_leg(quote) => Ok((base, quote)),
        _ => Err(KfError::InvalidSymbol(format!("expected BASE/QUOTE, got {symbol:?}"))),
    }
}

/// Normalize user input to canonical form: trimmed, upper-case, and
/// validated.
pub fn normalize_pair(symbol: &str) -> Result<String, KfError> {
    let upper = symbol.trim().to_ascii_uppercase();
    split_pair(&upper)?;
    Ok(upper)
}

/// Join the legs of a canonical symbol with an exchange-specific separator
/// (`""` for Binance, `"-"` for OKX).
pub fn join_pair(symbol: &str, sep: &str) -> Result<String, KfError> {
    let (base, quote) = split_pair(symbol)?;
    Ok(format!("{base}{sep}{quote}"))
}

fn is_leg(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric())
}
