//! Live kline streams.
//!
//! Each streamable exchange describes its feed with a [`StreamDef`] (URL,
//! subscription, keep-alive, frame parser). [`WsStreamFactory`] turns a
//! definition into a running [`WsConnection`] and hands it to the caller as a
//! [`LiveStream`] trait object, which is all the stream manager sees.
//!
//! ```text
//! registry::stream_def(exchange, symbol, interval)
//!     └─► StreamDef ──► WsStreamFactory::open() ──► WsConnection task
//!                                                        │
//!                              ConnEvent (mpsc) ◄────────┘
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use kf_core::ws::{ConnEventSender, ConnectionState, PingPayload, ReconnectPolicy, TextParser, WsConnConfig, WsConnection};
use kf_core::{Exchange, Interval, KfError};
use tracing::info;

use crate::registry;

/// Ping / keep-alive configuration for a WebSocket connection.
#[derive(Debug, Clone)]
pub struct PingConfig {
    pub interval: Duration,
    pub payload: PingPayload,
}

/// Everything needed to open one exchange kline stream.
pub struct StreamDef {
    /// Human-readable label (e.g. `"bybit_kline_BTCUSDT_1m"`).
    pub label: String,
    pub exchange: Exchange,
    pub ws_url: String,
    /// Subscription message sent right after connect, if the exchange needs one.
    pub subscribe_msg: Option<String>,
    /// Client-side keep-alive. `None` when the server pings us.
    pub ping: Option<PingConfig>,
    pub text_parser: TextParser,
}

/// A running stream as seen by its owner.
#[async_trait]
pub trait LiveStream: Send + Sync {
    /// Connection id stamped on every event this stream emits.
    fn id(&self) -> usize;
    fn exchange(&self) -> Exchange;
    fn state(&self) -> ConnectionState;
    /// Skip the current backoff wait.
    fn retry(&self);
    /// Stop the stream and wait for its task to end.
    async fn stop(&mut self);
}

/// Opens live streams. Abstracted so the manager can run against fakes.
pub trait StreamFactory: Send + Sync {
    fn open(
        &self,
        exchange: Exchange,
        symbol: &str,
        interval: Interval,
        conn_id: usize,
        events: ConnEventSender,
    ) -> Result<Box<dyn LiveStream>, KfError>;
}

#[async_trait]
impl LiveStream for WsConnection {
    fn id(&self) -> usize {
        WsConnection::id(self)
    }

    fn exchange(&self) -> Exchange {
        WsConnection::exchange(self)
    }

    fn state(&self) -> ConnectionState {
        WsConnection::state(self)
    }

    fn retry(&self) {
        WsConnection::retry(self)
    }

    async fn stop(&mut self) {
        WsConnection::stop(self).await
    }
}

// ---------------------------------------------------------------------------
// WsStreamFactory
// ---------------------------------------------------------------------------

/// [`StreamFactory`] backed by real WebSocket connections.
#[derive(Debug, Clone)]
pub struct WsStreamFactory {
    reconnect: ReconnectPolicy,
    ping_interval: Duration,
    connect_timeout: Duration,
}

impl WsStreamFactory {
    pub fn new(reconnect: ReconnectPolicy, ping_interval: Duration, connect_timeout: Duration) -> Self {
        Self { reconnect, ping_interval, connect_timeout }
    }

    /// Connection config for a stream definition, without starting anything.
    pub fn conn_config(&self, def: &StreamDef, conn_id: usize) -> WsConnConfig {
        WsConnConfig {
            id: conn_id,
            exchange: def.exchange,
            url: def.ws_url.clone(),
            subscribe_msg: def.subscribe_msg.clone(),
            extra_headers: HashMap::new(),
            ping_interval: def.ping.as_ref().map(|p| p.interval),
            ping_payload: def.ping.as_ref().map(|p| p.payload.clone()),
            connect_timeout: self.connect_timeout,
            reconnect: self.reconnect.clone(),
        }
    }
}

impl StreamFactory for WsStreamFactory {
    fn open(
        &self,
        exchange: Exchange,
        symbol: &str,
        interval: Interval,
        conn_id: usize,
        events: ConnEventSender,
    ) -> Result<Box<dyn LiveStream>, KfError> {
        let def = registry::stream_def(exchange, symbol, interval, self.ping_interval)?;
        info!("[ws-{conn_id}] opening {} ({})", def.label, def.ws_url);

        let mut conn = WsConnection::new(self.conn_config(&def, conn_id));
        conn.start(def.text_parser, events);
        Ok(Box::new(conn))
    }
}
