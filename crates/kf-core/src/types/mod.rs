//! Core data types: exchanges, intervals, candles, fetch requests and symbol
//! helpers.

pub mod candle;
pub mod enums;
pub mod symbol;

pub use candle::*;
pub use enums::*;
pub use symbol::*;
