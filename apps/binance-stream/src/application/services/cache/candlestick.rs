//! Candlestick Cache
//!
//! A bounded series per (symbol, interval). The stream is opened first and
//! the series is then seeded from REST history, so candles that close
//! while history is loading are not lost.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::CacheError;
use crate::application::ports::ExchangeRest;
use crate::domain::candlestick::{Candlestick, CandlestickSeries, SeriesChange};
use crate::domain::events::CandlestickUpdate;
use crate::infrastructure::binance::client::{EventSubscriber, StreamEvent, SubscriptionId};
use crate::infrastructure::binance::families::{CandlestickFamily, CandlestickKey};
use crate::infrastructure::binance::multiplexer::HandlerError;

type Series = Arc<RwLock<CandlestickSeries>>;

/// Locally maintained candlestick series.
pub struct CandlestickCache {
    client: Arc<dyn EventSubscriber<CandlestickFamily>>,
    rest: Arc<dyn ExchangeRest>,
    capacity: usize,
    series: RwLock<HashMap<CandlestickKey, (Series, SubscriptionId)>>,
}

impl CandlestickCache {
    /// Create an empty cache keeping up to `capacity` candles per series.
    #[must_use]
    pub fn new(
        client: Arc<dyn EventSubscriber<CandlestickFamily>>,
        rest: Arc<dyn ExchangeRest>,
        capacity: usize,
    ) -> Self {
        Self {
            client,
            rest,
            capacity: capacity.max(1),
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Follow `key` and seed its series from REST history.
    ///
    /// When seeding fails the live subscription stays in place and the
    /// error is returned; [`Self::reseed`] can retry.
    pub async fn subscribe(&self, key: CandlestickKey) -> Result<(), CacheError> {
        if self.series.read().contains_key(&key) {
            return Err(CacheError::AlreadySubscribed(key.to_string()));
        }

        let series: Series = Arc::new(RwLock::new(CandlestickSeries::new(self.capacity)));
        let callback_series = Arc::clone(&series);
        let id = self
            .client
            .subscribe(
                key.clone(),
                Some(Arc::new(
                    move |event: &StreamEvent<CandlestickUpdate>| -> Result<(), HandlerError> {
                        let change = callback_series.write().apply(event.data.candlestick.clone());
                        if change == SeriesChange::Ignored {
                            debug!(
                                open_time = %event.data.candlestick.open_time,
                                "stale candlestick ignored"
                            );
                        }
                        Ok(())
                    },
                )),
            )
            .await?;

        let inserted = {
            let mut cached = self.series.write();
            if cached.contains_key(&key) {
                false
            } else {
                cached.insert(key.clone(), (Arc::clone(&series), id));
                true
            }
        };
        if !inserted {
            self.client.unsubscribe(key.clone(), id).await?;
            return Err(CacheError::AlreadySubscribed(key.to_string()));
        }
        info!(key = %key, "candlestick series subscribed");

        self.seed(&key, &series).await
    }

    /// Reload REST history into an existing series.
    pub async fn reseed(&self, key: &CandlestickKey) -> Result<bool, CacheError> {
        let Some(series) = self.series_handle(key) else {
            return Ok(false);
        };
        self.seed(key, &series).await?;
        Ok(true)
    }

    /// Stop following `key`. Returns whether it was cached.
    pub async fn unsubscribe(&self, key: &CandlestickKey) -> Result<bool, CacheError> {
        let Some((_, id)) = self.series.write().remove(key) else {
            return Ok(false);
        };
        self.client.unsubscribe(key.clone(), id).await?;
        Ok(true)
    }

    /// Copy of the series, oldest first.
    #[must_use]
    pub fn series(&self, key: &CandlestickKey) -> Option<Vec<Candlestick>> {
        self.series_handle(key).map(|series| series.read().to_vec())
    }

    /// Newest candle of the series.
    #[must_use]
    pub fn latest(&self, key: &CandlestickKey) -> Option<Candlestick> {
        self.series_handle(key)
            .and_then(|series| series.read().latest().cloned())
    }

    /// Cached keys.
    #[must_use]
    pub fn keys(&self) -> Vec<CandlestickKey> {
        self.series.read().keys().cloned().collect()
    }

    fn series_handle(&self, key: &CandlestickKey) -> Option<Series> {
        self.series
            .read()
            .get(key)
            .map(|(series, _)| Arc::clone(series))
    }

    async fn seed(&self, key: &CandlestickKey, series: &Series) -> Result<(), CacheError> {
        let limit = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        match self.rest.candlesticks(&key.symbol, key.interval, limit).await {
            Ok(history) => {
                let count = history.len();
                series.write().seed(history);
                debug!(key = %key, count, "candlestick series seeded");
                Ok(())
            }
            Err(error) => {
                warn!(key = %key, error = %error, "candlestick history unavailable");
                Err(error.into())
            }
        }
    }
}

impl std::fmt::Debug for CandlestickCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandlestickCache")
            .field("keys", &self.keys())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::application::ports::{MockExchangeRest, RestError};
    use crate::domain::market::{CandlestickInterval, Symbol};
    use crate::infrastructure::binance::client::EventClient;
    use crate::infrastructure::binance::multiplexer::StreamMultiplexer;
    use crate::infrastructure::binance::transport::{
        FrameTransport, TransportError, TransportObserver,
    };

    /// Delivers the queued frames on the next connection, then closes.
    #[derive(Default)]
    struct QueuedFrames {
        pending: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FrameTransport for QueuedFrames {
        async fn stream(
            &self,
            _uri: &str,
            _cancel: CancellationToken,
            observer: &dyn TransportObserver,
        ) -> Result<(), TransportError> {
            let frames = std::mem::take(&mut *self.pending.lock());
            observer.on_open();
            for frame in &frames {
                observer.on_message(frame);
            }
            observer.on_close();
            Ok(())
        }

        fn is_streaming(&self) -> bool {
            false
        }
    }

    struct Feed {
        transport: Arc<QueuedFrames>,
        multiplexer: Arc<StreamMultiplexer>,
    }

    impl Feed {
        fn new() -> Self {
            let transport = Arc::new(QueuedFrames::default());
            let multiplexer = Arc::new(StreamMultiplexer::new(
                "kline",
                "wss://test",
                Arc::clone(&transport) as Arc<dyn FrameTransport>,
            ));
            Self {
                transport,
                multiplexer,
            }
        }

        fn client(&self) -> Arc<EventClient<CandlestickFamily>> {
            Arc::new(EventClient::new(Arc::clone(&self.multiplexer), 16))
        }

        async fn deliver(&self, frame: String) {
            self.transport.pending.lock().push(frame);
            self.multiplexer
                .stream(CancellationToken::new())
                .await
                .unwrap();
        }
    }

    fn key() -> CandlestickKey {
        CandlestickKey::new(Symbol::new("BTCUSDT"), CandlestickInterval::OneMinute)
    }

    fn minute(n: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + n * 60, 0).unwrap()
    }

    fn candle(n: i64, close: i64, is_final: bool) -> Candlestick {
        Candlestick {
            symbol: Symbol::new("BTCUSDT"),
            interval: CandlestickInterval::OneMinute,
            open_time: minute(n),
            close_time: minute(n + 1),
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: Decimal::ONE,
            quote_volume: Decimal::ONE,
            trade_count: 1,
            taker_buy_base_volume: Decimal::ZERO,
            taker_buy_quote_volume: Decimal::ZERO,
            is_final,
        }
    }

    fn kline_json(n: i64, close: i64, is_final: bool) -> String {
        let open_time = minute(n).timestamp_millis();
        let close_time = minute(n + 1).timestamp_millis() - 1;
        format!(
            r#"{{"e":"kline","E":{close_time},"s":"BTCUSDT","k":{{"t":{open_time},"T":{close_time},"s":"BTCUSDT","i":"1m","f":1,"L":2,"o":"{close}","c":"{close}","h":"{close}","l":"{close}","v":"1","n":2,"x":{is_final},"q":"1","V":"0","Q":"0"}}}}"#
        )
    }

    fn closes(cache: &CandlestickCache) -> Vec<Decimal> {
        cache
            .series(&key())
            .unwrap()
            .iter()
            .map(|c| c.close)
            .collect()
    }

    #[tokio::test]
    async fn streamed_klines_replace_append_and_evict() {
        let mut rest = MockExchangeRest::new();
        rest.expect_candlesticks()
            .times(1)
            .returning(|_, _, limit| {
                assert_eq!(limit, 3);
                Ok(vec![candle(0, 10, true), candle(1, 11, false)])
            });
        let feed = Feed::new();
        let cache = CandlestickCache::new(feed.client(), Arc::new(rest), 3);
        cache.subscribe(key()).await.unwrap();

        // Same open time as the newest candle.
        feed.deliver(kline_json(1, 12, true)).await;
        assert_eq!(closes(&cache), vec![Decimal::from(10), Decimal::from(12)]);
        assert!(cache.latest(&key()).unwrap().is_final);

        feed.deliver(kline_json(2, 13, false)).await;
        assert_eq!(closes(&cache), vec![Decimal::from(10), Decimal::from(12), Decimal::from(13)]);

        // A fourth candle pushes the oldest out.
        feed.deliver(kline_json(3, 14, false)).await;
        assert_eq!(closes(&cache), vec![Decimal::from(12), Decimal::from(13), Decimal::from(14)]);
        assert_eq!(cache.latest(&key()).unwrap().open_time, minute(3));
        assert_eq!(cache.series(&key()).unwrap()[0].open_time, minute(1));

        // Stale candles no longer in the window are dropped.
        feed.deliver(kline_json(0, 99, true)).await;
        assert_eq!(closes(&cache), vec![Decimal::from(12), Decimal::from(13), Decimal::from(14)]);
    }

    #[tokio::test]
    async fn failed_seed_keeps_subscription() {
        let mut rest = MockExchangeRest::new();
        let mut calls = 0;
        rest.expect_candlesticks().times(2).returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Err(RestError::Network("timeout".to_string()))
            } else {
                Ok(vec![candle(0, 10, true)])
            }
        });
        let client = Feed::new().client();
        let cache = CandlestickCache::new(
            Arc::clone(&client) as Arc<dyn EventSubscriber<CandlestickFamily>>,
            Arc::new(rest),
            10,
        );

        assert!(matches!(
            cache.subscribe(key()).await,
            Err(CacheError::Rest(RestError::Network(_)))
        ));
        assert_eq!(client.topics().len(), 1);
        assert_eq!(cache.series(&key()).unwrap().len(), 0);

        assert!(cache.reseed(&key()).await.unwrap());
        assert_eq!(cache.series(&key()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_subscription_and_unsubscribe() {
        let mut rest = MockExchangeRest::new();
        rest.expect_candlesticks().returning(|_, _, _| Ok(vec![]));
        let client = Feed::new().client();
        let cache = CandlestickCache::new(
            Arc::clone(&client) as Arc<dyn EventSubscriber<CandlestickFamily>>,
            Arc::new(rest),
            10,
        );

        cache.subscribe(key()).await.unwrap();
        assert!(matches!(
            cache.subscribe(key()).await,
            Err(CacheError::AlreadySubscribed(_))
        ));
        assert!(cache.unsubscribe(&key()).await.unwrap());
        assert!(!cache.unsubscribe(&key()).await.unwrap());
        assert!(client.topics().is_empty());
        assert!(cache.series(&key()).is_none());
    }
}
