//! Persistence contract for closed candles.
//!
//! The feed never talks to a database directly. It hands [`CandleRecord`]s to
//! a [`CandleStore`], whose `upsert` must be idempotent per [`CandleKey`]:
//! writing the same key twice leaves one row holding the second write.
//!
//! [`MemoryStore`] is the reference implementation, used by the runner when no
//! database is wired in and by tests.

use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::KfError;
use crate::types::{Candle, Exchange, Interval};

/// Global de-duplication unit for persisted candles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CandleKey {
    pub exchange: Exchange,
    pub symbol: String,
    pub interval: Interval,
    pub timestamp_ms: u64,
}

/// A closed candle together with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleRecord {
    pub exchange: Exchange,
    pub symbol: String,
    pub interval: Interval,
    pub candle: Candle,
}

impl CandleRecord {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            exchange: self.exchange,
            symbol: self.symbol.clone(),
            interval: self.interval,
            timestamp_ms: self.candle.timestamp_ms,
        }
    }
}

/// Idempotent candle sink.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Insert or replace the row for `record.key()`.
    async fn upsert(&self, record: &CandleRecord) -> Result<(), KfError>;

    /// Upsert a batch and return the number of records written. The default
    /// writes one record at a time and stops at the first failure.
    async fn upsert_batch(&self, records: &[CandleRecord]) -> Result<usize, KfError> {
        for record in records {
            self.upsert(record).await?;
        }
        Ok(records.len())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process [`CandleStore`] keyed by [`CandleKey`].
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<AHashMap<CandleKey, CandleRecord>>,
    batches: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn get(&self, key: &CandleKey) -> Option<CandleRecord> {
        self.rows.read().get(key).cloned()
    }

    /// All rows ordered by key.
    pub fn records(&self) -> Vec<CandleRecord> {
        let rows = self.rows.read();
        let mut out: Vec<_> = rows.values().cloned().collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    /// Number of `upsert_batch` calls served.
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn upsert(&self, record: &CandleRecord) -> Result<(), KfError> {
        self.rows.write().insert(record.key(), record.clone());
        Ok(())
    }

    async fn upsert_batch(&self, records: &[CandleRecord]) -> Result<usize, KfError> {
        let mut rows = self.rows.write();
        for record in records {
            rows.insert(record.key(), record.clone());
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: u64, volume: f64) -> CandleRecord {
        CandleRecord {
            exchange: Exchange::Bybit,
            symbol: "BTC/USDT".into(),
            interval: Interval::Min1,
            candle: Candle {
                timestamp_ms: ts,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume,
                quote_volume: None,
                trades_count: None,
            },
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_key() {
        let store = MemoryStore::new();
        store.upsert(&record(60_000, 1.0)).await.unwrap();
        store.upsert(&record(60_000, 7.0)).await.unwrap();
        assert_eq!(store.len(), 1);
        let row = store.get(&record(60_000, 0.0).key()).unwrap();
        assert_eq!(row.candle.volume, 7.0);
    }

    #[tokio::test]
    async fn batch_counts_calls() {
        let store = MemoryStore::new();
        let written = store.upsert_batch(&[record(0, 1.0), record(60_000, 1.0)]).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.batch_count(), 1);
        assert_eq!(store.records().iter().map(|r| r.candle.timestamp_ms).collect::<Vec<_>>(), vec![0, 60_000]);
    }

    #[tokio::test]
    async fn key_includes_interval() {
        let store = MemoryStore::new();
        let mut five = record(0, 1.0);
        five.interval = Interval::Min5;
        store.upsert(&record(0, 1.0)).await.unwrap();
        store.upsert(&five).await.unwrap();
        assert_eq!(store.len(), 2);
    }
}
