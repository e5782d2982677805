//! Write buffer between live sources and the candle store.
//!
//! ```text
//! manager ──accept()──► queue (parking_lot::Mutex<Vec>) ──flush()──► CandleStore::upsert_batch
//!                          │ len ≥ max_buffer_size                ▲
//!                          └────────── wake ──► worker ───────────┘ (also every flush_interval)
//! ```
//!
//! `accept` never awaits, so a slow store cannot stall ingestion. Flushes are
//! serialized; each drains the whole queue, collapses entries sharing a
//! [`CandleKey`] (last write wins) and writes them as one batch. A batch that
//! still fails after `max_retries` attempts is written record by record, so
//! only the rows the store rejects are dropped and counted under `errors`.

use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use kf_core::config::BufferConfig;
use kf_core::store::{CandleKey, CandleRecord, CandleStore};
use kf_core::time_util::now_ms;
use kf_core::{Candle, Exchange, Interval, StreamUpdate};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A closed candle waiting to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedCandle {
    exchange: Exchange,
    symbol: String,
    interval: Interval,
    candle: Candle,
    received_at_ms: u64,
}

impl BufferedCandle {
    /// `None` for forming candles: only closed buckets are persisted.
    pub fn from_update(exchange: Exchange, symbol: &str, interval: Interval, update: &StreamUpdate) -> Option<Self> {
        update.is_closed.then(|| Self {
            exchange,
            symbol: symbol.to_string(),
            interval,
            candle: update.candle,
            received_at_ms: now_ms(),
        })
    }

    pub fn key(&self) -> CandleKey {
        CandleKey {
            exchange: self.exchange,
            symbol: self.symbol.clone(),
            interval: self.interval,
            timestamp_ms: self.candle.timestamp_ms,
        }
    }

    pub fn candle(&self) -> &Candle {
        &self.candle
    }

    pub fn received_at_ms(&self) -> u64 {
        self.received_at_ms
    }

    pub fn into_record(self) -> CandleRecord {
        CandleRecord { exchange: self.exchange, symbol: self.symbol, interval: self.interval, candle: self.candle }
    }
}

/// Cumulative buffer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub buffered: u64,
    pub flushed: u64,
    pub errors: u64,
    pub current_buffer_size: usize,
}

/// Outcome of a single flush. Counts are queue entries, before key collapsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub buffered: usize,
    pub flushed: usize,
    pub errors: usize,
}

type Worker = (watch::Sender<bool>, JoinHandle<()>);

pub struct CandleBuffer {
    config: BufferConfig,
    store: Arc<dyn CandleStore>,
    queue: Mutex<Vec<BufferedCandle>>,
    flush_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    buffered: AtomicU64,
    flushed: AtomicU64,
    errors: AtomicU64,
    worker: Mutex<Option<Worker>>,
}

impl CandleBuffer {
    pub fn new(config: BufferConfig, store: Arc<dyn CandleStore>) -> Self {
        Self {
            config,
            store,
            queue: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            buffered: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Queue a closed candle. Wakes the flush worker once the queue reaches
    /// `max_buffer_size`.
    pub fn accept(&self, candle: BufferedCandle) {
        let len = {
            let mut queue = self.queue.lock();
            queue.push(candle);
            queue.len()
        };
        self.buffered.fetch_add(1, Ordering::Relaxed);
        if len >= self.config.max_buffer_size {
            debug!("[buffer] size trigger at {len} entries");
            self.wake.notify_one();
        }
    }

    /// Drain the queue into the store.
    pub async fn flush(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;

        let drained = std::mem::take(&mut *self.queue.lock());
        if drained.is_empty() {
            return FlushReport::default();
        }
        let total = drained.len();

        // Each collapsed row remembers how many queue entries it stands for.
        let mut latest: AHashMap<CandleKey, (BufferedCandle, usize)> = AHashMap::with_capacity(total);
        for entry in drained {
            match latest.entry(entry.key()) {
                Entry::Occupied(mut slot) => {
                    let (kept, count) = slot.get_mut();
                    *kept = entry;
                    *count += 1;
                }
                Entry::Vacant(slot) => {
                    slot.insert((entry, 1));
                }
            }
        }
        let mut rows: Vec<(CandleRecord, usize)> =
            latest.into_values().map(|(entry, count)| (entry.into_record(), count)).collect();
        rows.sort_by(|a, b| a.0.key().cmp(&b.0.key()));
        let records: Vec<CandleRecord> = rows.iter().map(|(record, _)| record.clone()).collect();

        let max_retries = self.config.max_retries.max(1);
        let mut delay = self.config.retry_delay();
        for attempt in 1..=max_retries {
            match self.store.upsert_batch(&records).await {
                Ok(written) => {
                    self.flushed.fetch_add(total as u64, Ordering::Relaxed);
                    debug!("[buffer] flushed {total} entries as {written} rows");
                    return FlushReport { buffered: total, flushed: total, errors: 0 };
                }
                Err(e) if attempt < max_retries => {
                    warn!("[buffer] flush attempt {attempt}/{max_retries} failed: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    warn!("[buffer] batch failed after {max_retries} attempts: {e}; writing rows one by one");
                }
            }
        }

        let report = self.write_each(total, &rows).await;
        self.flushed.fetch_add(report.flushed as u64, Ordering::Relaxed);
        self.errors.fetch_add(report.errors as u64, Ordering::Relaxed);
        report
    }

    /// Last resort after batch retries: one `upsert` per row. Rejected rows
    /// are dropped.
    async fn write_each(&self, total: usize, rows: &[(CandleRecord, usize)]) -> FlushReport {
        let mut report = FlushReport { buffered: total, flushed: 0, errors: 0 };
        for (record, count) in rows {
            match self.store.upsert(record).await {
                Ok(()) => report.flushed += count,
                Err(e) => {
                    error!("[buffer] dropping {} {} @ {}: {e}", record.exchange, record.symbol, record.candle.timestamp_ms);
                    report.errors += count;
                }
            }
        }
        report
    }

    /// Spawn the flush worker. No-op if it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let buffer = Arc::clone(self);
        let period = self.config.flush_interval();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => {}
                    _ = buffer.wake.notified() => {}
                }
                buffer.flush().await;
            }
        });
        info!("[buffer] worker started (size {}, every {:?})", self.config.max_buffer_size, period);
        *worker = Some((shutdown_tx, handle));
    }

    /// Stop the worker and flush whatever is left.
    pub async fn stop(&self) -> FlushReport {
        let worker = self.worker.lock().take();
        if let Some((shutdown_tx, handle)) = worker {
            let _ = shutdown_tx.send(true);
            let _ = handle.await;
        }
        let report = self.flush().await;
        let stats = self.stats();
        info!(
            "[buffer] stopped: buffered={} flushed={} errors={}",
            stats.buffered, stats.flushed, stats.errors
        );
        report
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            buffered: self.buffered.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            current_buffer_size: self.queue.lock().len(),
        }
    }
}
