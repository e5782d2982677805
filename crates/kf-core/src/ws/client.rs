//! Single kline WebSocket connection with reconnect, backoff and keep-alive.
//!
//! Each `WsConnection` runs as a tokio task that:
//! 1. Connects to the exchange WebSocket endpoint (TLS).
//! 2. Sends the subscription message, if the exchange needs one.
//! 3. Runs every text frame through the stream's [`TextParser`] and emits the
//!    resulting updates as [`StreamEvent::CandleUpdate`].
//! 4. Sends periodic ping messages (exchange-specific format).
//! 5. Reconnects on disconnection, waiting as long as its [`Backoff`] says.
//!    Once the backoff is exhausted the state becomes `failed` and the task
//!    ends.
//!
//! The current [`ConnectionState`] is published through a `watch` channel
//! owned by the connection; everything else reaches the owner through the
//! bounded [`ConnEvent`] channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::backoff::{Backoff, ReconnectPolicy};
use super::event::{ConnEvent, ConnEventSender, ConnectionState, StreamEvent};
use crate::error::KfError;
use crate::types::{Exchange, StreamUpdate};

/// Turns one inbound text frame into zero or more kline updates.
///
/// Frames that are not kline data (acks, pongs, heartbeats) must yield
/// `Ok(vec![])`. An `Err` is logged and the frame is dropped.
pub type TextParser = Arc<dyn Fn(&str) -> Result<Vec<StreamUpdate>, KfError> + Send + Sync>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ping payload format, which varies by exchange.
#[derive(Debug, Clone)]
pub enum PingPayload {
    /// Send a text frame (e.g. `"ping"`).
    Text(String),
    /// Send a JSON object as text (e.g. Bybit `{"op":"ping"}`).
    Json(serde_json::Value),
    /// Use the standard WebSocket ping frame.
    WebSocketPing,
}

impl PingPayload {
    fn to_message(&self) -> Message {
        match self {
            Self::Text(t) => Message::Text(t.clone().into()),
            Self::Json(j) => Message::Text(j.to_string().into()),
            Self::WebSocketPing => Message::Ping(Vec::new().into()),
        }
    }
}

/// Configuration for a single WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsConnConfig {
    /// Connection identifier, unique per owner. Tags every emitted event.
    pub id: usize,
    pub exchange: Exchange,
    /// Full WebSocket URL (e.g. `wss://stream.binance.com:9443/ws/btcusdt@kline_1m`).
    pub url: String,
    /// Message to send immediately after connection (subscription request).
    pub subscribe_msg: Option<String>,
    /// Extra HTTP headers for the handshake.
    pub extra_headers: HashMap<String, String>,
    /// Interval between ping messages.
    pub ping_interval: Option<Duration>,
    /// Ping message format.
    pub ping_payload: Option<PingPayload>,
    /// Deadline for TCP + TLS + WebSocket handshake.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

/// A single WebSocket connection managed by a background tokio task.
pub struct WsConnection {
    config: WsConnConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    retry: Arc<Notify>,
    outbound_tx: Option<mpsc::Sender<String>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl WsConnection {
    /// Create a new (not yet started) connection in state `disconnected`.
    pub fn new(config: WsConnConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            state_tx: Arc::new(state_tx),
            retry: Arc::new(Notify::new()),
            outbound_tx: None,
            shutdown_tx: None,
            task: None,
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.config.id
    }

    #[inline]
    pub fn exchange(&self) -> Exchange {
        self.config.exchange
    }

    pub fn config(&self) -> &WsConnConfig {
        &self.config
    }

    /// Start the connection task. Calling `start` twice is a no-op.
    pub fn start(&mut self, parser: TextParser, events: ConnEventSender) {
        if self.task.is_some() {
            warn!("[ws-{}] start called on a running connection", self.config.id);
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(64);

        let task = ConnTask {
            config: self.config.clone(),
            parser,
            events,
            state: self.state_tx.clone(),
            retry: self.retry.clone(),
            outbound_rx,
            shutdown_rx,
        };

        self.shutdown_tx = Some(shutdown_tx);
        self.outbound_tx = Some(outbound_tx);
        self.task = Some(tokio::spawn(task.run()));
    }

    /// Current state as last published by the connection task.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Cut the current backoff wait short. Has no effect while connected, and
    /// none after `failed`.
    pub fn retry(&self) {
        self.retry.notify_waiters();
    }

    /// Send a text message on this connection.
    pub async fn send(&self, msg: String) -> Result<(), KfError> {
        if let Some(tx) = &self.outbound_tx {
            tx.send(msg).await.map_err(|_| KfError::Connection("connection task has ended".into()))?;
        }
        Ok(())
    }

    /// Stop the connection and wait for the task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.outbound_tx = None;
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

enum SessionEnd {
    Shutdown,
    /// `delivered` is set once the session forwarded at least one update.
    Lost { delivered: bool },
}

enum BackoffOutcome {
    Retry,
    Shutdown,
    Failed,
}

struct ConnTask {
    config: WsConnConfig,
    parser: TextParser,
    events: ConnEventSender,
    state: Arc<watch::Sender<ConnectionState>>,
    retry: Arc<Notify>,
    outbound_rx: mpsc::Receiver<String>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnTask {
    /// Main connection loop: connect, subscribe, read and ping until the backoff runs out.
    async fn run(mut self) {
        let conn_id = self.config.id;
        let mut backoff = Backoff::new(self.config.reconnect.clone());

        loop {
            if *self.shutdown_rx.borrow() {
                info!("[ws-{conn_id}] shutdown requested");
                break;
            }

            self.set_state(ConnectionState::Connecting);
            info!("[ws-{conn_id}] connecting to {}", self.config.url);

            let connected = tokio::select! {
                r = connect_ws(&self.config) => r,
                _ = self.shutdown_rx.changed() => break,
            };

            match connected {
                // A handshake alone does not count as recovery: a server that
                // accepts and drops must still run the attempt budget down.
                Ok(ws_stream) => match self.session(ws_stream).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost { delivered: true } => backoff.reset(),
                    SessionEnd::Lost { delivered: false } => {}
                },
                Err(e) => {
                    error!("[ws-{conn_id}] connection failed: {e}");
                    if !self.emit(StreamEvent::Error(e)).await {
                        break;
                    }
                }
            }

            match self.wait_backoff(&mut backoff).await {
                BackoffOutcome::Retry => {}
                BackoffOutcome::Shutdown => break,
                BackoffOutcome::Failed => return,
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// One connected session. Returns when the socket is lost or shutdown is
    /// requested.
    async fn session(&mut self, ws_stream: WsStream) -> SessionEnd {
        let conn_id = self.config.id;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        if let Some(sub_msg) = self.config.subscribe_msg.clone() {
            debug!("[ws-{conn_id}] subscribing: {sub_msg}");
            if let Err(e) = ws_write.send(Message::Text(sub_msg.into())).await {
                let reason = format!("subscribe send failed: {e}");
                error!("[ws-{conn_id}] {reason}");
                return self.lost(reason, false).await;
            }
        }

        self.set_state(ConnectionState::Connected);
        info!("[ws-{conn_id}] connected");
        if !self.emit(StreamEvent::Connected).await {
            let _ = ws_write.close().await;
            return SessionEnd::Shutdown;
        }

        let mut ping_timer = self.config.ping_interval.map(|d| {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + d, d);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer
        });

        let mut delivered = false;
        let reason = loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    info!("[ws-{conn_id}] shutdown signal received");
                    let _ = ws_write.close().await;
                    return SessionEnd::Shutdown;
                }

                msg = ws_read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match self.dispatch(&text).await {
                            Some(n) => delivered |= n > 0,
                            None => {
                                let _ = ws_write.close().await;
                                return SessionEnd::Shutdown;
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_write.send(Message::Pong(data)).await {
                                break format!("pong send failed: {e}");
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break format!("received close frame {frame:?}");
                        }
                        Some(Err(e)) => break format!("read error: {e}"),
                        None => break "stream ended".to_string(),
                        _ => {} // Binary, Pong, Frame: ignore
                    }
                }

                Some(msg) = self.outbound_rx.recv() => {
                    if let Err(e) = ws_write.send(Message::Text(msg.into())).await {
                        break format!("send error: {e}");
                    }
                }

                _ = next_tick(&mut ping_timer) => {
                    let ping_msg = self
                        .config
                        .ping_payload
                        .as_ref()
                        .map_or(Message::Ping(Vec::new().into()), PingPayload::to_message);
                    if let Err(e) = ws_write.send(ping_msg).await {
                        break format!("ping send error: {e}");
                    }
                }
            }
        };

        warn!("[ws-{conn_id}] disconnected: {reason}");
        self.lost(reason, delivered).await
    }

    async fn lost(&mut self, reason: String, delivered: bool) -> SessionEnd {
        if self.emit(StreamEvent::Disconnected { reason }).await {
            SessionEnd::Lost { delivered }
        } else {
            SessionEnd::Shutdown
        }
    }

    /// Parse one frame and forward its updates. Returns the number forwarded,
    /// or `None` when the owner is gone or shutdown was requested.
    async fn dispatch(&mut self, text: &str) -> Option<usize> {
        let updates = match (self.parser)(text) {
            Ok(updates) => updates,
            Err(e) => {
                warn!("[ws-{}] dropping frame: {e}", self.config.id);
                return Some(0);
            }
        };
        let n = updates.len();
        for update in updates {
            if !self.emit(StreamEvent::CandleUpdate(update)).await {
                return None;
            }
        }
        Some(n)
    }

    async fn wait_backoff(&mut self, backoff: &mut Backoff) -> BackoffOutcome {
        let conn_id = self.config.id;
        let Some(delay) = backoff.next() else {
            error!("[ws-{conn_id}] giving up after {} reconnect attempts", backoff.attempt());
            self.set_state(ConnectionState::Failed);
            let _ = self.emit(StreamEvent::Failed).await;
            return BackoffOutcome::Failed;
        };

        let retry = self.retry.clone();
        let notified = retry.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        self.set_state(ConnectionState::Reconnecting);
        info!(
            "[ws-{conn_id}] reconnect attempt {}/{} in {delay:?}",
            backoff.attempt(),
            backoff.policy().max_attempts
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => BackoffOutcome::Retry,
            _ = &mut notified => {
                info!("[ws-{conn_id}] manual retry, skipping backoff");
                BackoffOutcome::Retry
            }
            _ = self.shutdown_rx.changed() => BackoffOutcome::Shutdown,
        }
    }

    /// Deliver an event, giving up if shutdown is requested while the channel
    /// is full.
    async fn emit(&mut self, event: StreamEvent) -> bool {
        if *self.shutdown_rx.borrow() {
            return false;
        }
        let ev = ConnEvent { conn_id: self.config.id, exchange: self.config.exchange, event };
        tokio::select! {
            r = self.events.send(ev) => r.is_ok(),
            _ = self.shutdown_rx.changed() => false,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("[ws-{}] {prev} -> {next}", self.config.id);
        }
    }
}

async fn next_tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Establish a (TLS) WebSocket connection within the configured deadline.
async fn connect_ws(config: &WsConnConfig) -> Result<WsStream, KfError> {
    let url = url::Url::parse(&config.url)
        .map_err(|e| KfError::Config(format!("invalid websocket url {}: {e}", config.url)))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(KfError::Config(format!("not a websocket url: {}", config.url)));
    }

    let mut request =
        url.as_str().into_client_request().map_err(|e| KfError::Connection(format!("bad handshake request: {e}")))?;
    for (key, value) in &config.extra_headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| KfError::Config(format!("invalid header name {key}: {e}")))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| KfError::Config(format!("invalid header value for {key}: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    match tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(KfError::Connection(e.to_string())),
        Err(_) => Err(KfError::Timeout(format!("websocket handshake exceeded {:?}", config.connect_timeout))),
    }
}
