//! Exchange registry: maps an [`Exchange`] to its REST adapter and, for the
//! streamable ones, to its kline stream definition.

use std::sync::Arc;
use std::time::Duration;

use kf_core::{Exchange, Interval, KfError};

use crate::ExchangeAdapter;
use crate::binance::BinanceAdapter;
use crate::bybit::BybitAdapter;
use crate::coinbase::CoinbaseAdapter;
use crate::kraken::KrakenAdapter;
use crate::kucoin::KucoinAdapter;
use crate::okx::OkxAdapter;
use crate::rest::RestClient;
use crate::stream::StreamDef;

/// Create the REST adapter for `exchange`. Adapters share the client's
/// connection pool.
pub fn create_adapter(exchange: Exchange, client: &RestClient) -> Arc<dyn ExchangeAdapter> {
    let client = client.clone();
    match exchange {
        Exchange::Binance => Arc::new(BinanceAdapter::new(client)),
        Exchange::Okx => Arc::new(OkxAdapter::new(client)),
        Exchange::Bybit => Arc::new(BybitAdapter::new(client)),
        Exchange::Coinbase => Arc::new(CoinbaseAdapter::new(client)),
        Exchange::Kraken => Arc::new(KrakenAdapter::new(client)),
        Exchange::Kucoin => Arc::new(KucoinAdapter::new(client)),
    }
}

/// Adapters for `exchanges`, keeping their order (= race priority).
pub fn create_adapters(exchanges: &[Exchange], client: &RestClient) -> Vec<Arc<dyn ExchangeAdapter>> {
    exchanges.iter().map(|&ex| create_adapter(ex, client)).collect()
}

/// Kline stream definition for `exchange`.
pub fn stream_def(
    exchange: Exchange,
    symbol: &str,
    interval: Interval,
    ping_interval: Duration,
) -> Result<StreamDef, KfError> {
    match exchange {
        Exchange::Binance => crate::binance::stream_def(symbol, interval),
        Exchange::Bybit => crate::bybit::stream_def(symbol, interval, ping_interval),
        other => Err(KfError::Config(format!("{other} has no kline stream"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapters_keep_priority_order() {
        let client = RestClient::new(Duration::from_secs(1)).unwrap();
        let adapters = create_adapters(&[Exchange::Kraken, Exchange::Binance, Exchange::Kucoin], &client);
        let order: Vec<_> = adapters.iter().map(|a| a.exchange()).collect();
        assert_eq!(order, vec![Exchange::Kraken, Exchange::Binance, Exchange::Kucoin]);
    }

    #[test]
    fn every_exchange_has_an_adapter() {
        let client = RestClient::new(Duration::from_secs(1)).unwrap();
        for ex in Exchange::ALL {
            assert_eq!(create_adapter(ex, &client).exchange(), ex);
        }
    }

    #[test]
    fn stream_defs_only_for_streaming_exchanges() {
        for ex in Exchange::ALL {
            let def = stream_def(ex, "BTC/USDT", Interval::Min1, Duration::from_secs(20));
            assert_eq!(def.is_ok(), ex.supports_streaming(), "{ex}");
        }
    }
}
