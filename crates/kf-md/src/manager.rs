//! Per-symbol live candle sourcing with a fallback chain.
//!
//! ```text
//!                    ┌──────────── command channel ◄─── StreamManager (handle)
//!                    ▼
//!   ConnEvent ──► manager actor ──► CandleBuffer::accept (closed candles)
//!   RestPoll  ──►   (owns all   ──► broadcast<LiveCandle> (every update)
//!                   symbol state)
//!
//!   per symbol:  primary stream ──failed──► secondary stream ──failed──► REST polling
//!                      ▲                                                     │
//!                      └────────── retry_primary(): trial, promote on connect┘
//! ```
//!
//! Exactly one source is active per symbol. Events are tagged with a
//! connection id; anything from a connection that is no longer the active
//! source (or a pending candidate) is dropped.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use kf_core::config::StreamConfig;
use kf_core::time_util::now_ms;
use kf_core::ws::{ConnEvent, ConnEventReceiver, ConnEventSender, ConnectionState, StreamEvent};
use kf_core::{Exchange, FetchRequest, FetchResult, Interval, KfError, StreamUpdate, normalize_pair};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferStats, BufferedCandle, CandleBuffer};
use crate::fetcher::RaceFetcher;
use crate::stream::{LiveStream, StreamFactory};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const UPDATE_CHANNEL_CAPACITY: usize = 1024;
const COMMAND_CHANNEL_CAPACITY: usize = 64;
/// Candles requested per REST poll: enough to cover the bucket that closed
/// since the last poll plus the forming one.
const REST_POLL_LIMIT: u32 = 3;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Manager tuning, usually derived from [`StreamConfig`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub interval: Interval,
    pub primary: Exchange,
    pub secondary: Exchange,
    pub rest_poll_interval: Duration,
    pub stale_after: Duration,
    pub health_check_interval: Duration,
    pub rest_failure_threshold: u32,
    /// Consecutive disconnects or errors from the active stream, with no
    /// update in between, before the chain advances.
    pub max_errors_before_fallback: u32,
}

impl ManagerSettings {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            interval: config.interval,
            primary: config.primary,
            secondary: config.secondary,
            rest_poll_interval: config.rest_poll_interval(),
            stale_after: config.stale_after(),
            health_check_interval: config.health_check_interval(),
            rest_failure_threshold: config.rest_failure_threshold,
            max_errors_before_fallback: config.max_errors_before_fallback,
        }
    }
}

/// Which link of the fallback chain is feeding a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Primary,
    Secondary,
    Rest,
    None,
}

impl SourceKind {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Primary,
            Self::Primary => Self::Secondary,
            Self::Secondary | Self::Rest => Self::Rest,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Rest => "rest",
            Self::None => "none",
        })
    }
}

/// A live update fanned out to subscribers. Includes forming candles.
#[derive(Debug, Clone, Serialize)]
pub struct LiveCandle {
    pub symbol: String,
    pub exchange: Exchange,
    pub interval: Interval,
    pub update: StreamUpdate,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolStatus {
    pub symbol: String,
    pub source: SourceKind,
    pub exchange: Option<Exchange>,
    pub state: ConnectionState,
    pub rest_polling: bool,
    pub candidate_pending: bool,
    pub last_price: Option<f64>,
    pub last_update_ms: Option<u64>,
    pub error_count: u64,
    pub chain_exhausted: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub interval: Interval,
    pub primary: Exchange,
    pub secondary: Exchange,
    pub rest_polling_active: bool,
    pub symbols: Vec<SymbolStatus>,
    pub buffer: BufferStats,
}

impl ManagerStatus {
    pub fn symbol(&self, symbol: &str) -> Option<&SymbolStatus> {
        self.symbols.iter().find(|s| s.symbol == symbol)
    }
}

// ---------------------------------------------------------------------------
// StreamManager (handle)
// ---------------------------------------------------------------------------

enum Command {
    Ensure { symbol: String, reply: oneshot::Sender<()> },
    RetryPrimary { symbol: Option<String>, reply: oneshot::Sender<usize> },
    Status { reply: oneshot::Sender<ManagerStatus> },
    Stop { reply: oneshot::Sender<()> },
}

/// Handle to the manager actor. Cheap to share behind an `Arc`.
pub struct StreamManager {
    interval: Interval,
    cmd_tx: mpsc::Sender<Command>,
    updates: broadcast::Sender<LiveCandle>,
    buffer: Arc<CandleBuffer>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamManager {
    /// Spawn the actor and start sourcing `symbols` (canonical form).
    pub fn start(
        settings: ManagerSettings,
        symbols: Vec<String>,
        factory: Arc<dyn StreamFactory>,
        fetcher: Arc<RaceFetcher>,
        buffer: Arc<CandleBuffer>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (rest_tx, rest_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        info!(
            "[manager] starting {} symbols on {} (primary {}, secondary {})",
            symbols.len(),
            settings.interval,
            settings.primary,
            settings.secondary
        );

        let interval = settings.interval;
        let actor = Actor {
            settings,
            factory,
            fetcher,
            buffer: Arc::clone(&buffer),
            updates: updates.clone(),
            slots: AHashMap::new(),
            conn_index: AHashMap::new(),
            next_conn_id: 1,
            events_tx,
            rest_tx,
        };
        let task = tokio::spawn(actor.run(symbols, cmd_rx, events_rx, rest_rx));

        Self { interval, cmd_tx, updates, buffer, task: Mutex::new(Some(task)) }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Start sourcing `symbol` if it is not tracked yet.
    pub async fn ensure(&self, symbol: &str) -> Result<(), KfError> {
        let symbol = normalize_pair(symbol)?;
        let (reply, rx) = oneshot::channel();
        self.request(Command::Ensure { symbol, reply }, rx).await
    }

    /// Try to get `symbol` (or every symbol) back onto the primary exchange.
    /// Returns how many symbols have a primary retry in progress.
    pub async fn retry_primary(&self, symbol: Option<&str>) -> Result<usize, KfError> {
        let symbol = symbol.map(normalize_pair).transpose()?;
        let (reply, rx) = oneshot::channel();
        self.request(Command::RetryPrimary { symbol, reply }, rx).await
    }

    pub async fn get_status(&self) -> Result<ManagerStatus, KfError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Status { reply }, rx).await
    }

    /// Receiver of every live update, forming and closed.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveCandle> {
        self.updates.subscribe()
    }

    /// Stop every source, wait for the actor, then drain the buffer.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let report = self.buffer.flush().await;
        info!("[manager] stopped; final flush wrote {} entries ({} errors)", report.flushed, report.errors);
    }

    async fn request<T>(&self, cmd: Command, rx: oneshot::Receiver<T>) -> Result<T, KfError> {
        self.cmd_tx.send(cmd).await.map_err(|_| KfError::ManagerStopped)?;
        rx.await.map_err(|_| KfError::ManagerStopped)
    }
}

// ---------------------------------------------------------------------------
// Actor state
// ---------------------------------------------------------------------------

struct RestPoller {
    conn_id: usize,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum ActiveSource {
    Stream { tier: SourceKind, stream: Box<dyn LiveStream> },
    Rest(RestPoller),
}

impl ActiveSource {
    fn kind(&self) -> SourceKind {
        match self {
            Self::Stream { tier, .. } => *tier,
            Self::Rest(_) => SourceKind::Rest,
        }
    }

    fn conn_id(&self) -> usize {
        match self {
            Self::Stream { stream, .. } => stream.id(),
            Self::Rest(poller) => poller.conn_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Active,
    Candidate,
    Stale,
}

struct SymbolSlot {
    active: Option<ActiveSource>,
    candidate: Option<Box<dyn LiveStream>>,
    last_price: Option<f64>,
    last_update_ms: Option<u64>,
    /// Last kline update or source switch. Connection events do not count.
    last_activity: Instant,
    last_closed_ts: Option<u64>,
    error_count: u64,
    /// Disconnects and errors from the active stream since its last update.
    source_errors: u32,
    last_error: Option<String>,
    rest_failures: u32,
    rest_exchange: Option<Exchange>,
    chain_exhausted: bool,
}

impl SymbolSlot {
    fn new() -> Self {
        Self {
            active: None,
            candidate: None,
            last_price: None,
            last_update_ms: None,
            last_activity: Instant::now(),
            last_closed_ts: None,
            error_count: 0,
            source_errors: 0,
            last_error: None,
            rest_failures: 0,
            rest_exchange: None,
            chain_exhausted: false,
        }
    }

    fn role_of(&self, conn_id: usize) -> Role {
        if self.active.as_ref().is_some_and(|a| a.conn_id() == conn_id) {
            Role::Active
        } else if self.candidate.as_ref().is_some_and(|p| p.id() == conn_id) {
            Role::Candidate
        } else {
            Role::Stale
        }
    }

    fn record_error(&mut self, err: &KfError) {
        self.error_count += 1;
        self.last_error = Some(err.to_string());
    }

    /// Count a disconnect or error from the active stream. Returns the
    /// fallback reason once `threshold` consecutive ones have piled up.
    fn source_error(&mut self, threshold: u32) -> Option<String> {
        self.source_errors += 1;
        (self.source_errors >= threshold).then(|| format!("{} errors without data", self.source_errors))
    }

    fn status(&self, symbol: &str) -> SymbolStatus {
        let (source, exchange, state) = match &self.active {
            Some(ActiveSource::Stream { tier, stream }) => (*tier, Some(stream.exchange()), stream.state()),
            Some(ActiveSource::Rest(_)) => {
                let state = if self.rest_failures > 0 {
                    ConnectionState::Reconnecting
                } else if self.rest_exchange.is_some() {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Connecting
                };
                (SourceKind::Rest, self.rest_exchange, state)
            }
            None => (SourceKind::None, None, ConnectionState::Disconnected),
        };
        SymbolStatus {
            symbol: symbol.to_string(),
            source,
            exchange,
            state,
            rest_polling: source == SourceKind::Rest,
            candidate_pending: self.candidate.is_some(),
            last_price: self.last_price,
            last_update_ms: self.last_update_ms,
            error_count: self.error_count,
            chain_exhausted: self.chain_exhausted,
            last_error: self.last_error.clone(),
        }
    }
}

struct RestPollEvent {
    conn_id: usize,
    result: Result<FetchResult, KfError>,
}

struct Actor {
    settings: ManagerSettings,
    factory: Arc<dyn StreamFactory>,
    fetcher: Arc<RaceFetcher>,
    buffer: Arc<CandleBuffer>,
    updates: broadcast::Sender<LiveCandle>,
    slots: AHashMap<String, SymbolSlot>,
    /// Live connection / poller id → symbol. Retired ids are removed.
    conn_index: AHashMap<usize, String>,
    next_conn_id: usize,
    events_tx: ConnEventSender,
    rest_tx: mpsc::Sender<RestPollEvent>,
}

impl Actor {
    async fn run(
        mut self,
        symbols: Vec<String>,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut events_rx: ConnEventReceiver,
        mut rest_rx: mpsc::Receiver<RestPollEvent>,
    ) {
        for symbol in symbols {
            self.ensure(symbol).await;
        }

        let period = self.settings.health_check_interval;
        let mut health = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Stop { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(ev) = events_rx.recv() => self.on_conn_event(ev).await,
                Some(ev) = rest_rx.recv() => self.on_rest_event(ev),
                _ = health.tick() => self.check_health().await,
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Ensure { symbol, reply } => {
                self.ensure(symbol).await;
                let _ = reply.send(());
            }
            Command::RetryPrimary { symbol, reply } => {
                let _ = reply.send(self.retry_primary(symbol));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled by the run loop.
            Command::Stop { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn ensure(&mut self, symbol: String) {
        if self.slots.contains_key(&symbol) {
            return;
        }
        self.slots.insert(symbol.clone(), SymbolSlot::new());
        self.start_chain_at(&symbol, SourceKind::Primary).await;
    }

    // -- sources -------------------------------------------------------------

    fn alloc_conn_id(&mut self, symbol: &str) -> usize {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conn_index.insert(conn_id, symbol.to_string());
        conn_id
    }

    fn open_stream(&mut self, symbol: &str, exchange: Exchange) -> Result<Box<dyn LiveStream>, KfError> {
        let conn_id = self.alloc_conn_id(symbol);
        let opened = self.factory.open(exchange, symbol, self.settings.interval, conn_id, self.events_tx.clone());
        if opened.is_err() {
            self.conn_index.remove(&conn_id);
        }
        opened
    }

    fn spawn_rest_poller(&mut self, symbol: &str) -> RestPoller {
        let conn_id = self.alloc_conn_id(symbol);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(rest_poll_loop(
            conn_id,
            symbol.to_string(),
            self.settings.interval,
            self.settings.rest_poll_interval,
            Arc::clone(&self.fetcher),
            self.rest_tx.clone(),
            stop_rx,
        ));
        RestPoller { conn_id, stop_tx, task }
    }

    /// Activate the first link of the chain, starting at `kind`, that opens.
    async fn start_chain_at(&mut self, symbol: &str, mut kind: SourceKind) {
        loop {
            let exchange = match kind {
                SourceKind::Primary => self.settings.primary,
                SourceKind::Secondary => self.settings.secondary,
                SourceKind::Rest | SourceKind::None => {
                    let poller = self.spawn_rest_poller(symbol);
                    info!("[manager] {symbol}: REST polling every {:?}", self.settings.rest_poll_interval);
                    self.install(symbol, ActiveSource::Rest(poller)).await;
                    return;
                }
            };
            match self.open_stream(symbol, exchange) {
                Ok(stream) => {
                    info!("[manager] {symbol}: {kind} stream on {exchange} (conn {})", stream.id());
                    self.install(symbol, ActiveSource::Stream { tier: kind, stream }).await;
                    return;
                }
                Err(e) => {
                    warn!("[manager] {symbol}: cannot open {kind} stream on {exchange}: {e}");
                    if let Some(slot) = self.slots.get_mut(symbol) {
                        slot.record_error(&e);
                    }
                    kind = kind.next();
                }
            }
        }
    }

    async fn install(&mut self, symbol: &str, source: ActiveSource) {
        match self.slots.get_mut(symbol) {
            Some(slot) => {
                slot.last_activity = Instant::now();
                slot.source_errors = 0;
                slot.active = Some(source);
            }
            None => self.retire(source).await,
        }
    }

    async fn retire(&mut self, source: ActiveSource) {
        self.conn_index.remove(&source.conn_id());
        match source {
            ActiveSource::Stream { mut stream, .. } => stream.stop().await,
            ActiveSource::Rest(poller) => {
                let _ = poller.stop_tx.send(true);
                let _ = poller.task.await;
            }
        }
    }

    /// Replace a failed stream with the next link of the chain.
    async fn advance(&mut self, symbol: &str, reason: &str) {
        let Some(slot) = self.slots.get_mut(symbol) else { return };
        let Some(source) = slot.active.take() else { return };
        if matches!(source, ActiveSource::Rest(_)) {
            slot.active = Some(source);
            return;
        }
        let from = source.kind();
        let next = from.next();
        slot.last_error = Some(reason.to_string());
        warn!("[manager] {symbol}: {from} source failed ({reason}); falling back to {next}");

        self.retire(source).await;
        self.start_chain_at(symbol, next).await;
    }

    async fn promote_candidate(&mut self, symbol: &str) {
        let Some(slot) = self.slots.get_mut(symbol) else { return };
        let Some(candidate) = slot.candidate.take() else { return };
        info!("[manager] {symbol}: primary candidate connected (conn {}), switching back", candidate.id());

        let previous = slot.active.replace(ActiveSource::Stream { tier: SourceKind::Primary, stream: candidate });
        slot.last_activity = Instant::now();
        slot.source_errors = 0;
        slot.rest_failures = 0;
        slot.chain_exhausted = false;
        if let Some(previous) = previous {
            self.retire(previous).await;
        }
    }

    async fn discard_candidate(&mut self, symbol: &str) {
        let Some(mut candidate) = self.slots.get_mut(symbol).and_then(|s| s.candidate.take()) else { return };
        warn!("[manager] {symbol}: primary candidate (conn {}) failed, keeping current source", candidate.id());
        self.conn_index.remove(&candidate.id());
        candidate.stop().await;
    }

    fn retry_primary(&mut self, symbol: Option<String>) -> usize {
        let targets: Vec<String> = match symbol {
            Some(symbol) => vec![symbol],
            None => {
                let mut all: Vec<String> = self.slots.keys().cloned().collect();
                all.sort();
                all
            }
        };

        let mut retried = 0;
        for symbol in targets {
            let Some(slot) = self.slots.get(&symbol) else {
                debug!("[manager] retry_primary: {symbol} is not tracked");
                continue;
            };
            if let Some(ActiveSource::Stream { tier: SourceKind::Primary, stream }) = &slot.active {
                stream.retry();
                retried += 1;
                continue;
            }
            if slot.candidate.is_some() {
                retried += 1;
                continue;
            }

            let primary = self.settings.primary;
            match self.open_stream(&symbol, primary) {
                Ok(candidate) => {
                    info!("[manager] {symbol}: trying primary {primary} (conn {})", candidate.id());
                    if let Some(slot) = self.slots.get_mut(&symbol) {
                        slot.candidate = Some(candidate);
                    }
                    retried += 1;
                }
                Err(e) => {
                    warn!("[manager] {symbol}: cannot open primary candidate on {primary}: {e}");
                    if let Some(slot) = self.slots.get_mut(&symbol) {
                        slot.record_error(&e);
                    }
                }
            }
        }
        retried
    }

    // -- events --------------------------------------------------------------

    async fn on_conn_event(&mut self, ev: ConnEvent) {
        let Some(symbol) = self.conn_index.get(&ev.conn_id).cloned() else {
            debug!("[manager] dropping event from retired conn {}", ev.conn_id);
            return;
        };
        let threshold = self.settings.max_errors_before_fallback;
        let Some(slot) = self.slots.get_mut(&symbol) else { return };
        let role = slot.role_of(ev.conn_id);

        match (role, ev.event) {
            (Role::Stale, _) => debug!("[manager] {symbol}: ignoring conn {} (not active)", ev.conn_id),
            (Role::Candidate, StreamEvent::Connected) => self.promote_candidate(&symbol).await,
            (Role::Candidate, StreamEvent::Failed) => self.discard_candidate(&symbol).await,
            (Role::Active, StreamEvent::Connected) => {
                info!("[manager] {symbol}: {} connected (conn {})", ev.exchange, ev.conn_id);
            }
            (Role::Active, StreamEvent::CandleUpdate(update)) => self.on_update(&symbol, ev.exchange, update),
            (Role::Active, StreamEvent::Disconnected { reason }) => {
                warn!("[manager] {symbol}: {} disconnected: {reason}", ev.exchange);
                slot.error_count += 1;
                slot.last_error = Some(reason);
                if let Some(reason) = slot.source_error(threshold) {
                    self.advance(&symbol, &reason).await;
                }
            }
            (Role::Active, StreamEvent::Failed) => self.advance(&symbol, "reconnect attempts exhausted").await,
            (Role::Active, StreamEvent::Error(e)) => {
                debug!("[manager] {symbol}: conn {} error: {e}", ev.conn_id);
                slot.record_error(&e);
                if let Some(reason) = slot.source_error(threshold) {
                    self.advance(&symbol, &reason).await;
                }
            }
            (_, StreamEvent::Error(e)) => {
                debug!("[manager] {symbol}: conn {} error: {e}", ev.conn_id);
                slot.record_error(&e);
            }
            (Role::Candidate, _) => {}
        }
    }

    fn on_update(&mut self, symbol: &str, exchange: Exchange, update: StreamUpdate) {
        let Some(slot) = self.slots.get_mut(symbol) else { return };
        let interval = self.settings.interval;
        slot.last_price = Some(update.candle.close);
        slot.last_update_ms = Some(now_ms());
        slot.last_activity = Instant::now();
        slot.source_errors = 0;

        let ts = update.candle.timestamp_ms;
        if update.is_closed && slot.last_closed_ts.is_none_or(|last| ts > last) {
            slot.last_closed_ts = Some(ts);
            if let Some(candle) = BufferedCandle::from_update(exchange, symbol, interval, &update) {
                self.buffer.accept(candle);
            }
        }

        let _ = self.updates.send(LiveCandle { symbol: symbol.to_string(), exchange, interval, update });
    }

    fn on_rest_event(&mut self, ev: RestPollEvent) {
        let Some(symbol) = self.conn_index.get(&ev.conn_id).cloned() else { return };
        let Some(slot) = self.slots.get_mut(&symbol) else { return };
        if slot.role_of(ev.conn_id) != Role::Active {
            return;
        }

        match ev.result {
            Ok(res) => {
                if slot.chain_exhausted {
                    info!("[manager] {symbol}: REST polling recovered via {}", res.exchange);
                }
                slot.rest_failures = 0;
                slot.chain_exhausted = false;
                slot.rest_exchange = Some(res.exchange);

                let now = now_ms();
                let interval = self.settings.interval;
                let exchange = res.exchange;
                for candle in res.candles {
                    let update = if candle.is_closed_at(interval, now) {
                        StreamUpdate::closed(candle)
                    } else {
                        StreamUpdate::forming(candle)
                    };
                    self.on_update(&symbol, exchange, update);
                }
            }
            Err(e) => {
                slot.rest_failures += 1;
                slot.record_error(&e);
                warn!("[manager] {symbol}: REST poll failed ({} in a row): {e}", slot.rest_failures);
                if slot.rest_failures >= self.settings.rest_failure_threshold && !slot.chain_exhausted {
                    slot.chain_exhausted = true;
                    error!("[manager] {symbol}: every source is failing; fallback chain exhausted");
                }
            }
        }
    }

    async fn check_health(&mut self) {
        let symbols: Vec<String> = self.slots.keys().cloned().collect();
        for symbol in symbols {
            let candidate_failed = self
                .slots
                .get(&symbol)
                .and_then(|s| s.candidate.as_ref())
                .is_some_and(|p| p.state() == ConnectionState::Failed);
            if candidate_failed {
                self.discard_candidate(&symbol).await;
            }

            let Some(slot) = self.slots.get(&symbol) else { continue };
            let verdict = match &slot.active {
                // Connecting or reconnecting without data counts as stale too.
                Some(ActiveSource::Stream { stream, .. }) => match stream.state() {
                    ConnectionState::Failed => Some("connection failed".to_string()),
                    _ if slot.last_activity.elapsed() >= self.settings.stale_after => {
                        Some(format!("no data for {:?}", slot.last_activity.elapsed()))
                    }
                    _ => None,
                },
                _ => None,
            };
            if let Some(reason) = verdict {
                self.advance(&symbol, &reason).await;
            }
        }
    }

    fn status(&self) -> ManagerStatus {
        let mut symbols: Vec<SymbolStatus> = self.slots.iter().map(|(symbol, slot)| slot.status(symbol)).collect();
        symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        ManagerStatus {
            interval: self.settings.interval,
            primary: self.settings.primary,
            secondary: self.settings.secondary,
            rest_polling_active: symbols.iter().any(|s| s.rest_polling),
            symbols,
            buffer: self.buffer.stats(),
        }
    }

    async fn shutdown(&mut self) {
        info!("[manager] stopping {} symbols", self.slots.len());
        let slots: Vec<SymbolSlot> = self.slots.drain().map(|(_, slot)| slot).collect();
        for mut slot in slots {
            if let Some(mut candidate) = slot.candidate.take() {
                candidate.stop().await;
            }
            if let Some(source) = slot.active.take() {
                self.retire(source).await;
            }
        }
        self.conn_index.clear();
    }
}

async fn rest_poll_loop(
    conn_id: usize,
    symbol: String,
    interval: Interval,
    period: Duration,
    fetcher: Arc<RaceFetcher>,
    tx: mpsc::Sender<RestPollEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let req = FetchRequest::latest(symbol.as_str(), interval, REST_POLL_LIMIT);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = tick.tick() => {}
        }
        let result = tokio::select! {
            _ = stop_rx.changed() => break,
            result = fetcher.fetch_any(&req) => result,
        };
        tokio::select! {
            _ = stop_rx.changed() => break,
            sent = tx.send(RestPollEvent { conn_id, result }) => if sent.is_err() { break },
        }
    }
    debug!("[manager] {symbol}: REST poller {conn_id} exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExchangeAdapter;
    use crate::fetcher::tests::{FakeAdapter, candles};
    use kf_core::config::BufferConfig;
    use kf_core::store::MemoryStore;
    use kf_core::{Candle, Interval};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Opened {
        exchange: Exchange,
        conn_id: usize,
        events: ConnEventSender,
        state: Arc<Mutex<ConnectionState>>,
        stopped: Arc<AtomicBool>,
        retries: Arc<AtomicUsize>,
    }

    impl Opened {
        async fn emit(&self, event: StreamEvent) {
            self.events.send(ConnEvent { conn_id: self.conn_id, exchange: self.exchange, event }).await.unwrap();
        }

        async fn fail(&self) {
            *self.state.lock() = ConnectionState::Failed;
            self.emit(StreamEvent::Failed).await;
        }

        async fn connect(&self) {
            *self.state.lock() = ConnectionState::Connected;
            self.emit(StreamEvent::Connected).await;
        }

        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    struct FakeStream(Opened);

    #[async_trait::async_trait]
    impl LiveStream for FakeStream {
        fn id(&self) -> usize {
            self.0.conn_id
        }

        fn exchange(&self) -> Exchange {
            self.0.exchange
        }

        fn state(&self) -> ConnectionState {
            *self.0.state.lock()
        }

        fn retry(&self) {
            self.0.retries.fetch_add(1, Ordering::SeqCst);
        }

        async fn stop(&mut self) {
            *self.0.state.lock() = ConnectionState::Disconnected;
            self.0.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        opened: Mutex<Vec<Opened>>,
        refuse: Vec<Exchange>,
    }

    impl FakeFactory {
        fn refusing(refuse: Vec<Exchange>) -> Arc<Self> {
            Arc::new(Self { opened: Mutex::new(Vec::new()), refuse })
        }

        fn opened(&self) -> Vec<Opened> {
            self.opened.lock().clone()
        }

        async fn nth(&self, n: usize) -> Opened {
            for _ in 0..400 {
                if let Some(o) = self.opened.lock().get(n) {
                    return o.clone();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("stream #{n} was never opened");
        }
    }

    impl StreamFactory for FakeFactory {
        fn open(
            &self,
            exchange: Exchange,
            _symbol: &str,
            interval: Interval,
            conn_id: usize,
            events: ConnEventSender,
        ) -> Result<Box<dyn LiveStream>, KfError> {
            if self.refuse.contains(&exchange) {
                return Err(KfError::UnsupportedInterval { exchange, interval });
            }
            let opened = Opened {
                exchange,
                conn_id,
                events,
                state: Arc::new(Mutex::new(ConnectionState::Connecting)),
                stopped: Arc::new(AtomicBool::new(false)),
                retries: Arc::new(AtomicUsize::new(0)),
            };
            self.opened.lock().push(opened.clone());
            Ok(Box::new(FakeStream(opened)))
        }
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            interval: Interval::Min1,
            primary: Exchange::Bybit,
            secondary: Exchange::Binance,
            rest_poll_interval: Duration::from_millis(20),
            stale_after: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(60),
            rest_failure_threshold: 2,
            max_errors_before_fallback: 3,
        }
    }

    fn fetcher(adapter: Arc<FakeAdapter>) -> Arc<RaceFetcher> {
        Arc::new(RaceFetcher::new(vec![adapter as Arc<dyn ExchangeAdapter>], Duration::from_secs(1)))
    }

    fn ok_fetcher() -> Arc<RaceFetcher> {
        fetcher(FakeAdapter::new(Exchange::Kraken, 1, || Ok(candles(3))))
    }

    fn buffer() -> Arc<CandleBuffer> {
        Arc::new(CandleBuffer::new(BufferConfig::default(), Arc::new(MemoryStore::new())))
    }

    fn start(settings: ManagerSettings, factory: Arc<FakeFactory>, fetcher: Arc<RaceFetcher>) -> StreamManager {
        StreamManager::start(settings, vec!["BTC/USDT".to_string()], factory, fetcher, buffer())
    }

    async fn wait_for(manager: &StreamManager, what: &str, pred: impl Fn(&SymbolStatus) -> bool) -> SymbolStatus {
        for _ in 0..400 {
            let status = manager.get_status().await.unwrap();
            if let Some(s) = status.symbol("BTC/USDT") {
                if pred(s) {
                    return s.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn candle(ts: u64, close: f64) -> Candle {
        Candle {
            timestamp_ms: ts,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
            volume: 1.0,
            quote_volume: None,
            trades_count: None,
        }
    }

    #[tokio::test]
    async fn chain_falls_back_primary_secondary_rest() {
        let factory = FakeFactory::refusing(vec![]);
        let manager = start(settings(), factory.clone(), ok_fetcher());

        let primary = factory.nth(0).await;
        assert_eq!(primary.exchange, Exchange::Bybit);
        primary.connect().await;
        wait_for(&manager, "primary", |s| s.source == SourceKind::Primary && s.state == ConnectionState::Connected)
            .await;

        primary.fail().await;
        let secondary = factory.nth(1).await;
        assert_eq!(secondary.exchange, Exchange::Binance);
        let s = wait_for(&manager, "secondary", |s| s.source == SourceKind::Secondary).await;
        assert_eq!(s.exchange, Some(Exchange::Binance));
        assert!(primary.is_stopped());

        secondary.fail().await;
        let s = wait_for(&manager, "rest", |s| s.source == SourceKind::Rest && s.last_price.is_some()).await;
        assert!(s.rest_polling);
        assert_eq!(s.exchange, Some(Exchange::Kraken));
        assert!(secondary.is_stopped());
        assert_eq!(factory.opened().len(), 2);

        let status = manager.get_status().await.unwrap();
        assert!(status.rest_polling_active);
        assert_eq!(status.buffer.buffered, 3);
        manager.stop().await;
    }

    #[tokio::test]
    async fn retired_connection_updates_are_dropped() {
        let factory = FakeFactory::refusing(vec![]);
        let manager = start(settings(), factory.clone(), ok_fetcher());

        let primary = factory.nth(0).await;
        primary.fail().await;
        let secondary = factory.nth(1).await;
        wait_for(&manager, "secondary", |s| s.source == SourceKind::Secondary).await;

        primary.emit(StreamEvent::CandleUpdate(StreamUpdate::forming(candle(0, 11.0)))).await;
        secondary.emit(StreamEvent::CandleUpdate(StreamUpdate::forming(candle(0, 22.0)))).await;
        let s = wait_for(&manager, "price", |s| s.last_price.is_some()).await;
        assert_eq!(s.last_price, Some(22.0));
        manager.stop().await;
    }

    #[tokio::test]
    async fn candidate_is_promoted_only_after_connecting() {
        let factory = FakeFactory::refusing(vec![]);
        let manager = start(settings(), factory.clone(), ok_fetcher());

        factory.nth(0).await.fail().await;
        let secondary = factory.nth(1).await;
        wait_for(&manager, "secondary", |s| s.source == SourceKind::Secondary).await;

        assert_eq!(manager.retry_primary(None).await.unwrap(), 1);
        let candidate = factory.nth(2).await;
        assert_eq!(candidate.exchange, Exchange::Bybit);
        let s = wait_for(&manager, "candidate", |s| s.candidate_pending).await;
        assert_eq!(s.source, SourceKind::Secondary);
        assert!(!secondary.is_stopped());

        candidate.connect().await;
        let s = wait_for(&manager, "promotion", |s| s.source == SourceKind::Primary).await;
        assert!(!s.candidate_pending);
        assert!(secondary.is_stopped());
        manager.stop().await;
    }

    #[tokio::test]
    async fn failed_candidate_is_discarded() {
        let factory = FakeFactory::refusing(vec![]);
        let manager = start(settings(), factory.clone(), ok_fetcher());

        factory.nth(0).await.fail().await;
        factory.nth(1).await;
        wait_for(&manager, "secondary", |s| s.source == SourceKind::Secondary).await;

        manager.retry_primary(Some("btc/usdt")).await.unwrap();
        let candidate = factory.nth(2).await;
        wait_for(&manager, "candidate", |s| s.candidate_pending).await;
        candidate.fail().await;
        let s = wait_for(&manager, "discard", |s| !s.candidate_pending).await;
        assert_eq!(s.source, SourceKind::Secondary);
        assert!(candidate.is_stopped());
        manager.stop().await;
    }

    #[tokio::test]
    async fn retry_on_primary_reuses_connection() {
        let factory = FakeFactory::refusing(vec![]);
        let manager = start(settings(), factory.clone(), ok_fetcher());
        let primary = factory.nth(0).await;
        wait_for(&manager, "primary", |s| s.source == SourceKind::Primary).await;

        assert_eq!(manager.retry_primary(None).await.unwrap(), 1);
        assert_eq!(primary.retries.load(Ordering::SeqCst), 1);
        assert_eq!(factory.opened().len(), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn factory_error_advances_chain() {
        let factory = FakeFactory::refusing(vec![Exchange::Bybit]);
        let manager = start(settings(), factory.clone(), ok_fetcher());
        let s = wait_for(&manager, "secondary", |s| s.source == SourceKind::Secondary).await;
        assert_eq!(s.error_count, 1);
        assert_eq!(factory.opened()[0].exchange, Exchange::Binance);
        manager.stop().await;
    }

    #[tokio::test]
    async fn only_new_closed_candles_reach_the_buffer() {
        let factory = FakeFactory::refusing(vec![]);
        let manager = start(settings(), factory.clone(), ok_fetcher());
        let mut rx = manager.subscribe();
        let primary = factory.nth(0).await;

        primary.emit(StreamEvent::CandleUpdate(StreamUpdate::forming(candle(60_000, 1.0)))).await;
        primary.emit(StreamEvent::CandleUpdate(StreamUpdate::closed(candle(60_000, 2.0)))).await;
        primary.emit(StreamEvent::CandleUpdate(StreamUpdate::closed(candle(60_000, 2.0)))).await;

        for expected in [false, true, true] {
            let live = rx.recv().await.unwrap();
            assert_eq!(live.symbol, "BTC/USDT");
            assert_eq!(live.update.is_closed, expected);
        }
        let status = manager.get_status().await.unwrap();
        assert_eq!(status.buffer.buffered, 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn rest_failures_mark_chain_exhausted() {
        let factory = FakeFactory::refusing(vec![Exchange::Bybit, Exchange::Binance]);
        let failing = fetcher(FakeAdapter::new(Exchange::Okx, 1, || Err(KfError::Connection("refused".into()))));
        let manager = start(settings(), factory, failing);

        let s = wait_for(&manager, "exhausted", |s| s.chain_exhausted).await;
        assert_eq!(s.source, SourceKind::Rest);
        assert_eq!(s.state, ConnectionState::Reconnecting);
        manager.stop().await;
    }

    #[tokio::test]
    async fn silent_stream_is_replaced() {
        let factory = FakeFactory::refusing(vec![]);
        let mut cfg = settings();
        cfg.stale_after = Duration::from_millis(30);
        cfg.health_check_interval = Duration::from_millis(10);
        let manager = start(cfg, factory.clone(), ok_fetcher());

        let primary = factory.nth(0).await;
        primary.connect().await;
        let s = wait_for(&manager, "secondary", |s| s.source == SourceKind::Secondary).await;
        assert!(s.last_error.unwrap().contains("no data"));
        assert!(primary.is_stopped());
        manager.stop().await;
    }

    #[tokio::test]
    async fn flapping_stream_without_data_falls_back() {
        let factory = FakeFactory::refusing(vec![]);
        let manager = start(settings(), factory.clone(), ok_fetcher());

        let primary = factory.nth(0).await;
        for _ in 0..3 {
            primary.connect().await;
            primary.emit(StreamEvent::Disconnected { reason: "closed by peer".into() }).await;
        }
        let s = wait_for(&manager, "secondary", |s| s.source == SourceKind::Secondary).await;
        assert_eq!(s.error_count, 3);
        assert!(s.last_error.unwrap().contains("without data"));
        assert!(primary.is_stopped());
        manager.stop().await;
    }

    #[tokio::test]
    async fn updates_reset_consecutive_errors() {
        let factory = FakeFactory::refusing(vec![]);
        let manager = start(settings(), factory.clone(), ok_fetcher());

        let primary = factory.nth(0).await;
        let lost = || StreamEvent::Disconnected { reason: "reset".into() };
        primary.emit(lost()).await;
        primary.emit(lost()).await;
        primary.emit(StreamEvent::CandleUpdate(StreamUpdate::forming(candle(0, 5.0)))).await;
        primary.emit(lost()).await;
        primary.emit(lost()).await;

        let s = wait_for(&manager, "errors", |s| s.error_count == 4).await;
        assert_eq!(s.source, SourceKind::Primary);
        assert_eq!(s.last_price, Some(5.0));
        assert!(!primary.is_stopped());
        manager.stop().await;
    }

    #[tokio::test]
    async fn reconnect_events_do_not_keep_a_silent_stream_alive() {
        let factory = FakeFactory::refusing(vec![]);
        let mut cfg = settings();
        cfg.stale_after = Duration::from_millis(30);
        cfg.health_check_interval = Duration::from_millis(10);
        cfg.max_errors_before_fallback = 1_000;
        let manager = start(cfg, factory.clone(), ok_fetcher());

        let primary = factory.nth(0).await;
        for _ in 0..40 {
            if primary.is_stopped() {
                break;
            }
            primary.connect().await;
            *primary.state.lock() = ConnectionState::Reconnecting;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let s = wait_for(&manager, "secondary", |s| s.source == SourceKind::Secondary).await;
        assert!(s.last_error.unwrap().contains("no data"));
        assert!(primary.is_stopped());
        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let factory = FakeFactory::refusing(vec![]);
        let manager = start(settings(), factory.clone(), ok_fetcher());
        let primary = factory.nth(0).await;

        manager.stop().await;
        manager.stop().await;
        assert!(primary.is_stopped());
        assert!(!manager.is_running());
        assert!(matches!(manager.ensure("ETH/USDT").await, Err(KfError::ManagerStopped)));
        assert!(matches!(manager.get_status().await, Err(KfError::ManagerStopped)));
    }
}
