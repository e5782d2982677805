//! Application context: owns the fetcher, the write buffer, the stream
//! factory and (once started) the stream manager.
//!
//! Built once from an [`AppConfig`] and passed to whoever needs it. There is
//! no global state; `start()` / `stop()` bound every background task.

use std::sync::Arc;

use kf_core::config::{AppConfig, StreamConfig};
use kf_core::store::CandleStore;
use kf_core::{FetchRequest, FetchResult, Interval, KfError, normalize_pair};
use tokio::sync::Mutex;
use tracing::info;

use crate::buffer::{BufferStats, CandleBuffer};
use crate::fetcher::RaceFetcher;
use crate::manager::{ManagerSettings, StreamManager};
use crate::registry;
use crate::rest::RestClient;
use crate::stream::{StreamFactory, WsStreamFactory};

pub struct FeedContext {
    stream_config: StreamConfig,
    fetcher: Arc<RaceFetcher>,
    buffer: Arc<CandleBuffer>,
    factory: Arc<dyn StreamFactory>,
    manager: Mutex<Option<Arc<StreamManager>>>,
}

impl FeedContext {
    /// Wire adapters, race fetcher, buffer and WebSocket factory from config.
    pub fn from_config(config: &AppConfig, store: Arc<dyn CandleStore>) -> Result<Self, KfError> {
        let client = RestClient::new(config.rest.timeout())?;
        let adapters = registry::create_adapters(&config.rest.exchanges, &client);
        let fetcher = Arc::new(RaceFetcher::new(adapters, config.rest.timeout()));
        let buffer = Arc::new(CandleBuffer::new(config.buffer.clone(), store));
        let factory = Arc::new(WsStreamFactory::new(
            config.stream.reconnect_policy(),
            config.stream.ping_interval(),
            config.stream.connect_timeout(),
        ));
        info!("[context] REST sources: {:?}", fetcher.exchanges());
        Ok(Self::new(config.stream.clone(), fetcher, buffer, factory))
    }

    pub fn new(
        stream_config: StreamConfig,
        fetcher: Arc<RaceFetcher>,
        buffer: Arc<CandleBuffer>,
        factory: Arc<dyn StreamFactory>,
    ) -> Self {
        Self { stream_config, fetcher, buffer, factory, manager: Mutex::new(None) }
    }

    /// Start the flush worker and, if symbols are configured, the manager.
    pub async fn start(&self) -> Result<(), KfError> {
        self.buffer.start();
        let symbols = self.stream_config.normalized_symbols()?;
        if !symbols.is_empty() {
            self.init_stream_manager(&symbols, self.stream_config.interval).await?;
        }
        Ok(())
    }

    /// Stop the manager (which drains the buffer) and the flush worker.
    pub async fn stop(&self) {
        self.stop_stream_manager().await;
        self.buffer.stop().await;
    }

    pub fn fetcher(&self) -> &Arc<RaceFetcher> {
        &self.fetcher
    }

    pub fn buffer(&self) -> &Arc<CandleBuffer> {
        &self.buffer
    }

    pub async fn fetch_candlesticks(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
        start_time_ms: Option<u64>,
        end_time_ms: Option<u64>,
    ) -> Result<FetchResult, KfError> {
        let req = FetchRequest::latest(normalize_pair(symbol)?, interval, limit).with_range(start_time_ms, end_time_ms);
        self.fetcher.fetch_any(&req).await
    }

    /// Like [`fetch_candlesticks`](Self::fetch_candlesticks) but prefers a
    /// source returning at least `min_count` candles.
    pub async fn fetch_sufficient(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
        min_count: Option<usize>,
    ) -> Result<FetchResult, KfError> {
        let req = FetchRequest::latest(normalize_pair(symbol)?, interval, limit);
        self.fetcher.fetch_sufficient(&req, min_count).await
    }

    pub async fn get_stream_manager(&self) -> Option<Arc<StreamManager>> {
        self.manager.lock().await.clone()
    }

    /// Start a manager for `symbols`, stopping any previous one first.
    pub async fn init_stream_manager(
        &self,
        symbols: &[String],
        interval: Interval,
    ) -> Result<Arc<StreamManager>, KfError> {
        let symbols = symbols.iter().map(|s| normalize_pair(s)).collect::<Result<Vec<_>, _>>()?;

        let mut slot = self.manager.lock().await;
        if let Some(previous) = slot.take() {
            info!("[context] replacing running stream manager");
            previous.stop().await;
        }

        let mut settings = ManagerSettings::from_config(&self.stream_config);
        settings.interval = interval;
        let manager = Arc::new(StreamManager::start(
            settings,
            symbols,
            Arc::clone(&self.factory),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.buffer),
        ));
        *slot = Some(Arc::clone(&manager));
        Ok(manager)
    }

    pub async fn stop_stream_manager(&self) {
        let manager = self.manager.lock().await.take();
        if let Some(manager) = manager {
            manager.stop().await;
        }
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExchangeAdapter;
    use crate::fetcher::tests::{FakeAdapter, candles};
    use crate::stream::LiveStream;
    use kf_core::Exchange;
    use kf_core::config::BufferConfig;
    use kf_core::store::MemoryStore;
    use kf_core::ws::ConnEventSender;
    use std::time::Duration;

    /// Factory that refuses every stream, so managers go straight to REST.
    struct NoStreams;

    impl StreamFactory for NoStreams {
        fn open(
            &self,
            exchange: Exchange,
            _symbol: &str,
            _interval: Interval,
            _conn_id: usize,
            _events: ConnEventSender,
        ) -> Result<Box<dyn LiveStream>, KfError> {
            Err(KfError::Config(format!("{exchange} disabled")))
        }
    }

    fn context(symbols: &[&str]) -> (FeedContext, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let adapter = FakeAdapter::new(Exchange::Okx, 1, || Ok(candles(5)));
        let fetcher = Arc::new(RaceFetcher::new(vec![adapter as Arc<dyn ExchangeAdapter>], Duration::from_secs(1)));
        let buffer = Arc::new(CandleBuffer::new(BufferConfig::default(), store.clone()));
        let stream_config = StreamConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            rest_poll_interval_sec: 1,
            ..StreamConfig::default()
        };
        (FeedContext::new(stream_config, fetcher, buffer, Arc::new(NoStreams)), store)
    }

    #[tokio::test]
    async fn fetch_normalizes_symbol() {
        let (ctx, _) = context(&[]);
        let res = ctx.fetch_candlesticks(" btc/usdt ", Interval::Min1, 5, None, None).await.unwrap();
        assert_eq!(res.symbol, "BTC/USDT");
        assert_eq!(res.exchange, Exchange::Okx);
        assert!(ctx.fetch_candlesticks("BTCUSDT", Interval::Min1, 5, None, None).await.is_err());
    }

    #[tokio::test]
    async fn start_without_symbols_has_no_manager() {
        let (ctx, _) = context(&[]);
        ctx.start().await.unwrap();
        assert!(ctx.get_stream_manager().await.is_none());
        ctx.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_polled_candles_into_store() {
        let (ctx, store) = context(&["eth/usdt"]);
        ctx.start().await.unwrap();
        let manager = ctx.get_stream_manager().await.unwrap();

        for _ in 0..200 {
            if ctx.buffer_stats().buffered == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = manager.get_status().await.unwrap();
        assert!(status.rest_polling_active);
        assert!(status.symbol("ETH/USDT").is_some());

        ctx.stop().await;
        assert!(ctx.get_stream_manager().await.is_none());
        assert_eq!(store.len(), 5);
        assert_eq!(ctx.buffer_stats().flushed, 5);
    }

    #[tokio::test]
    async fn init_replaces_previous_manager() {
        let (ctx, _) = context(&[]);
        let first = ctx.init_stream_manager(&["BTC/USDT".to_string()], Interval::Min1).await.unwrap();
        let second = ctx.init_stream_manager(&["ETH/USDT".to_string()], Interval::Hour1).await.unwrap();
        assert!(!first.is_running());
        assert_eq!(second.interval(), Interval::Hour1);
        ctx.stop_stream_manager().await;
        assert!(!second.is_running());
    }
}
