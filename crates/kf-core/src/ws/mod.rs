//! Kline WebSocket connections: backoff state, events, and the connection
//! engine.

pub mod backoff;
pub mod client;
pub mod event;

pub use backoff::{Backoff, ReconnectPolicy};
pub use client::{PingPayload, TextParser, WsConnConfig, WsConnection};
pub use event::{ConnEvent, ConnEventReceiver, ConnEventSender, ConnectionState, StreamEvent};
