//! # kf-core
//!
//! Core crate for the kline feed, providing:
//!
//! - **Types** (`types`): exchanges, intervals, candles, fetch requests, symbol utils
//! - **Configuration** (`config`): JSON config deserialization and validation
//! - **Error types** (`error`): domain-specific `KfError` via thiserror
//! - **Persistence contract** (`store`): idempotent `CandleStore` + in-memory store
//! - **WebSocket** (`ws`): kline connection with backoff state machine
//! - **Time utilities** (`time_util`): epoch timestamps
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod time_util;
pub mod types;
pub mod ws;

pub use error::KfError;
// Re-export types at crate root for convenience.
pub use types::*;
