//! Stream Runtime Integration Tests
//!
//! Drives the stream manager and caches end to end over a scripted
//! transport: connection targets, frame routing and order book
//! synchronization from raw JSON frames.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use binance_stream::domain::candlestick::Candlestick;
use binance_stream::domain::order_book::{DepthSnapshot, PriceLevel};
use binance_stream::infrastructure::binance::{FrameTransport, TransportError, TransportObserver};
use binance_stream::{
    CacheSettings, CandlestickInterval, ControllerStatus, ExchangeRest, ListenKey,
    OrderBookCache, RestError, StatisticsCache, StatisticsKey, StreamManager, StreamSettings,
    Symbol, SystemStatus,
};

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Scripted Transport
// =============================================================================

/// Records connection URIs and replays frames pushed by the test.
struct ScriptedTransport {
    uris: Mutex<Vec<String>>,
    frames: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ScriptedTransport {
    fn new() -> (Arc<Self>, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            uris: Mutex::new(Vec::new()),
            frames: tokio::sync::Mutex::new(rx),
        });
        (transport, tx)
    }

    async fn wait_for_uris(&self, count: usize) -> Vec<String> {
        timeout(WAIT, async {
            loop {
                let uris = self.uris.lock().clone();
                if uris.len() >= count {
                    return uris;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection not opened")
    }
}

#[async_trait]
impl FrameTransport for ScriptedTransport {
    async fn stream(
        &self,
        uri: &str,
        cancel: CancellationToken,
        observer: &dyn TransportObserver,
    ) -> Result<(), TransportError> {
        let mut frames = self.frames.lock().await;
        self.uris.lock().push(uri.to_string());
        observer.on_open();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(text) => observer.on_message(&text),
                    None => {
                        cancel.cancelled().await;
                        break;
                    }
                },
            }
        }
        observer.on_close();
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        false
    }
}

// =============================================================================
// Fake REST
// =============================================================================

struct FakeRest {
    snapshot_id: u64,
    order_book_calls: AtomicU32,
}

impl FakeRest {
    fn new(snapshot_id: u64) -> Arc<Self> {
        Arc::new(Self {
            snapshot_id,
            order_book_calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ExchangeRest for FakeRest {
    async fn system_status(&self) -> Result<SystemStatus, RestError> {
        Ok(SystemStatus::Normal)
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, RestError> {
        Ok(Utc::now())
    }

    async fn order_book(&self, _symbol: &Symbol, _limit: u32) -> Result<DepthSnapshot, RestError> {
        self.order_book_calls.fetch_add(1, Ordering::SeqCst);
        Ok(DepthSnapshot {
            last_update_id: self.snapshot_id,
            bids: vec![PriceLevel::new(Decimal::from(100), Decimal::ONE)],
            asks: vec![PriceLevel::new(Decimal::from(101), Decimal::ONE)],
        })
    }

    async fn candlesticks(
        &self,
        _symbol: &Symbol,
        _interval: CandlestickInterval,
        _limit: u32,
    ) -> Result<Vec<Candlestick>, RestError> {
        Ok(Vec::new())
    }

    async fn start_user_stream(&self, _api_key: &str) -> Result<ListenKey, RestError> {
        Ok(ListenKey::new("listen-key"))
    }

    async fn keep_alive_user_stream(
        &self,
        _api_key: &str,
        _listen_key: &ListenKey,
    ) -> Result<(), RestError> {
        Ok(())
    }

    async fn close_user_stream(
        &self,
        _api_key: &str,
        _listen_key: &ListenKey,
    ) -> Result<(), RestError> {
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn manager(transport: &Arc<ScriptedTransport>, rest: Arc<dyn ExchangeRest>) -> StreamManager {
    let transport = Arc::clone(transport);
    StreamManager::with_transport_factory(
        "wss://test",
        &StreamSettings::default(),
        rest,
        None,
        move || Arc::clone(&transport) as Arc<dyn FrameTransport>,
    )
}

fn trade_json(symbol: &str, trade_id: u64) -> String {
    format!(
        r#"{{"e":"trade","E":1700000000000,"s":"{symbol}","t":{trade_id},"p":"2000.5","q":"0.1","T":1700000000000,"m":false}}"#
    )
}

fn depth_json(first: u64, last: u64, bid: &str) -> String {
    format!(
        r#"{{"e":"depthUpdate","E":1700000000000,"s":"BTCUSDT","U":{first},"u":{last},"b":[["{bid}","2"]],"a":[]}}"#
    )
}

fn ticker_json(symbol: &str, last_price: &str) -> String {
    format!(
        r#"{{"e":"24hrTicker","E":1700000000000,"s":"{symbol}","p":"1","P":"0.5","w":"10","x":"9","c":"{last_price}","Q":"1","b":"9.9","B":"1","a":"10.1","A":"1","o":"9","h":"11","l":"8","v":"100","q":"1000","O":1699913600000,"C":1700000000000,"F":1,"L":10,"n":10}}"#
    )
}

fn envelope(stream: &str, data: &str) -> String {
    format!(r#"{{"stream":"{stream}","data":{data}}}"#)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn connection_target_follows_topic_set() {
    let (transport, frames) = ScriptedTransport::new();
    let manager = manager(&transport, FakeRest::new(1));
    let mut events = manager.trades().events();

    manager.suppress_auto_run();
    manager
        .trades()
        .subscribe(Symbol::new("BTCUSDT"), None)
        .await
        .unwrap();
    manager
        .trades()
        .subscribe(Symbol::new("ETHUSDT"), None)
        .await
        .unwrap();
    assert_eq!(manager.trades().status(), ControllerStatus::Idle);
    manager.resume_auto_run();

    let uris = transport.wait_for_uris(1).await;
    assert_eq!(uris[0], "wss://test/stream?streams=btcusdt@trade/ethusdt@trade");

    frames
        .send(envelope("ethusdt@trade", &trade_json("ETHUSDT", 7)))
        .unwrap();
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.topic.as_str(), "ethusdt@trade");
    assert_eq!(event.data.trade_id, 7);

    assert!(
        manager
            .trades()
            .unsubscribe_key(Symbol::new("ETHUSDT"))
            .await
            .unwrap()
    );
    let uris = transport.wait_for_uris(2).await;
    assert_eq!(uris[1], "wss://test/ws/btcusdt@trade");

    // Single-topic connections carry the bare payload.
    frames.send(trade_json("BTCUSDT", 8)).unwrap();
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.topic.as_str(), "btcusdt@trade");
    assert_eq!(event.data.symbol, Symbol::new("BTCUSDT"));

    manager.shutdown().await;
}

#[tokio::test]
async fn order_book_synchronizes_from_frames() {
    let (transport, frames) = ScriptedTransport::new();
    let rest = FakeRest::new(100);
    let manager = manager(&transport, Arc::clone(&rest) as Arc<dyn ExchangeRest>);
    let cache = OrderBookCache::new(
        Arc::new(manager.depth().clone()),
        Arc::clone(&rest) as Arc<dyn ExchangeRest>,
        CacheSettings::default(),
    );
    let btc = Symbol::new("BTCUSDT");

    cache.subscribe(btc.clone(), None).await.unwrap();
    let uris = transport.wait_for_uris(1).await;
    assert_eq!(uris[0], "wss://test/ws/btcusdt@depth");

    frames.send(depth_json(95, 100, "99")).unwrap();
    frames.send(depth_json(101, 102, "98")).unwrap();
    frames.send(depth_json(103, 105, "97")).unwrap();

    eventually(|| {
        cache
            .snapshot(&btc)
            .is_some_and(|book| book.last_update_id == 105)
    })
    .await;

    let book = cache.snapshot(&btc).unwrap();
    let bids: Vec<Decimal> = book.bids.iter().map(|level| level.price).collect();
    assert_eq!(bids, vec![Decimal::from(100), Decimal::from(98), Decimal::from(97)]);
    assert_eq!(book.best_ask().unwrap().price, Decimal::from(101));
    assert_eq!(rest.order_book_calls.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn order_book_snapshot_waits_for_open_stream() {
    let (transport, frames) = ScriptedTransport::new();
    let rest = FakeRest::new(100);
    let manager = manager(&transport, Arc::clone(&rest) as Arc<dyn ExchangeRest>);
    let cache = OrderBookCache::new(
        Arc::new(manager.depth().clone()),
        Arc::clone(&rest) as Arc<dyn ExchangeRest>,
        CacheSettings::default(),
    );
    let btc = Symbol::new("BTCUSDT");

    manager.suppress_auto_run();
    cache.subscribe(btc.clone(), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rest.order_book_calls.load(Ordering::SeqCst), 0);
    assert!(cache.snapshot(&btc).is_none());

    manager.resume_auto_run();
    transport.wait_for_uris(1).await;
    assert_eq!(rest.order_book_calls.load(Ordering::SeqCst), 0);

    frames.send(depth_json(101, 102, "98")).unwrap();
    eventually(|| {
        cache
            .snapshot(&btc)
            .is_some_and(|book| book.last_update_id == 102)
    })
    .await;
    assert_eq!(rest.order_book_calls.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn statistics_cache_collects_all_tickers() {
    let (transport, frames) = ScriptedTransport::new();
    let manager = manager(&transport, FakeRest::new(1));
    let cache = StatisticsCache::new(Arc::new(manager.statistics().clone()));

    cache.subscribe(StatisticsKey::All).await.unwrap();
    let uris = transport.wait_for_uris(1).await;
    assert_eq!(uris[0], "wss://test/ws/!ticker@arr");

    let array = format!(
        "[{},{}]",
        ticker_json("BTCUSDT", "42000.5"),
        ticker_json("ETHUSDT", "2000.25")
    );
    frames.send(array).unwrap();

    eventually(|| cache.all().len() == 2).await;
    let symbols: Vec<Symbol> = cache.all().into_iter().map(|s| s.symbol).collect();
    assert_eq!(symbols, vec![Symbol::new("BTCUSDT"), Symbol::new("ETHUSDT")]);
    assert_eq!(
        cache.get(&Symbol::new("ETHUSDT")).unwrap().last_price,
        Decimal::new(200_025, 2)
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_leaves_every_family_idle() {
    let (transport, _frames) = ScriptedTransport::new();
    let manager = manager(&transport, FakeRest::new(1));

    manager
        .aggregate_trades()
        .subscribe(Symbol::new("BNBUSDT"), None)
        .await
        .unwrap();
    transport.wait_for_uris(1).await;

    manager.shutdown().await;
    assert_eq!(manager.aggregate_trades().status(), ControllerStatus::Idle);
    assert!(manager.is_auto_run_suppressed());
}
