//! Stream Multiplexer
//!
//! Carries many topics over one connection. The topic set lives in a
//! [`SubscriptionTable`]; each connection attempt freezes the table into a
//! [`ConnectionTarget`] and routes every received frame to the callbacks
//! registered for its topic.
//!
//! # Routing
//!
//! - Combined targets unwrap the `{stream, data}` envelope; a single-topic
//!   target treats every frame as belonging to its one topic.
//! - Frames for topics nobody listens to are dropped silently.
//! - Callbacks run in registration order on the connection's read loop;
//!   one failing or panicking callback never affects its siblings or the
//!   stream.
//! - Subscriber changes made while connected only affect the next attempt.

use std::any::Any;
use std::error::Error;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::JsonCodec;
use super::transport::{FrameTransport, TransportError, TransportObserver};
use crate::application::ports::{OperationError, StreamOperation};
use crate::domain::subscription::{SubscriptionStats, SubscriptionTable};
use crate::domain::topic::{ConnectionTarget, Topic};
use crate::infrastructure::metrics::{self, DropReason};

const RAW_FRAME_CAPACITY: usize = 1024;

// =============================================================================
// Types
// =============================================================================

/// Error returned by a subscriber callback.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// One routed frame, borrowed from the read loop.
#[derive(Debug, Clone, Copy)]
pub struct StreamFrame<'a> {
    /// Topic the frame belongs to.
    pub topic: &'a Topic,
    /// Undecoded payload.
    pub payload: &'a str,
    /// Cancellation signal of the running attempt.
    pub cancel: &'a CancellationToken,
}

/// Callback invoked for every frame of a topic.
pub type FrameHandler = dyn Fn(&StreamFrame<'_>) -> Result<(), HandlerError> + Send + Sync;

/// Shared handle to a [`FrameHandler`]; identity is the allocation.
pub type FrameCallback = Arc<FrameHandler>;

/// Owned copy of a routed frame for raw listeners.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Topic the frame belongs to.
    pub topic: Topic,
    /// Undecoded payload.
    pub payload: Arc<str>,
}

/// Multiplexer errors.
#[derive(Debug, thiserror::Error)]
pub enum MultiplexerError {
    /// Nothing to connect to.
    #[error("no topics subscribed")]
    NoTopics,

    /// The connection target cannot change while a connection is open.
    #[error("connection target is frozen while streaming")]
    TargetFrozen,

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// =============================================================================
// Multiplexer
// =============================================================================

/// Topic multiplexer over one [`FrameTransport`].
pub struct StreamMultiplexer {
    label: &'static str,
    base_uri: RwLock<String>,
    transport: Arc<dyn FrameTransport>,
    table: RwLock<SubscriptionTable<FrameHandler>>,
    active_target: RwLock<Option<ConnectionTarget>>,
    raw: broadcast::Sender<RawFrame>,
    opened: AtomicU64,
}

impl StreamMultiplexer {
    /// Create a multiplexer; `label` names it in logs and metrics.
    #[must_use]
    pub fn new(
        label: &'static str,
        base_uri: impl Into<String>,
        transport: Arc<dyn FrameTransport>,
    ) -> Self {
        let (raw, _) = broadcast::channel(RAW_FRAME_CAPACITY);
        Self {
            label,
            base_uri: RwLock::new(base_uri.into()),
            transport,
            table: RwLock::new(SubscriptionTable::new()),
            active_target: RwLock::new(None),
            raw,
            opened: AtomicU64::new(0),
        }
    }

    /// Add a topic, optionally with a callback.
    ///
    /// Without a callback the topic is pinned so it stays in the target for
    /// raw listeners. Returns whether the table changed.
    pub fn subscribe(&self, topic: Topic, callback: Option<FrameCallback>) -> bool {
        let mut table = self.table.write();
        let changed = match callback {
            Some(callback) => table.add(topic.clone(), callback),
            None => table.pin(topic.clone()),
        };
        if changed {
            debug!(stream = self.label, topic = %topic, "subscribed");
        }
        changed
    }

    /// Remove a callback (or the pin, with `None`) from a topic.
    ///
    /// Unknown pairs are a no-op. Returns whether the table changed.
    pub fn unsubscribe(&self, topic: &Topic, callback: Option<&FrameCallback>) -> bool {
        let mut table = self.table.write();
        let changed = match callback {
            Some(callback) => table.remove(topic, callback),
            None => table.unpin(topic),
        };
        if changed {
            debug!(stream = self.label, topic = %topic, "unsubscribed");
        }
        changed
    }

    /// Subscribed topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.table.read().topics()
    }

    /// Whether `topic` is part of the next target.
    #[must_use]
    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.table.read().contains(topic)
    }

    /// Table statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.table.read().stats()
    }

    /// Target the next attempt would connect to.
    #[must_use]
    pub fn target(&self) -> Option<ConnectionTarget> {
        let topics = self.table.read().topics();
        ConnectionTarget::build(&self.base_uri.read(), &topics)
    }

    /// Target of the attempt in progress.
    #[must_use]
    pub fn active_target(&self) -> Option<ConnectionTarget> {
        self.active_target.read().clone()
    }

    /// Change the WebSocket base URI for subsequent attempts.
    pub fn set_base_uri(&self, base_uri: impl Into<String>) -> Result<(), MultiplexerError> {
        if self.transport.is_streaming() {
            return Err(MultiplexerError::TargetFrozen);
        }
        *self.base_uri.write() = base_uri.into();
        Ok(())
    }

    /// Receive a copy of every routed frame.
    #[must_use]
    pub fn raw_frames(&self) -> broadcast::Receiver<RawFrame> {
        self.raw.subscribe()
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        self.label
    }

    /// Run one connection attempt against the current topic set.
    pub async fn stream(&self, cancel: CancellationToken) -> Result<(), MultiplexerError> {
        let target = self.target().ok_or(MultiplexerError::NoTopics)?;
        *self.active_target.write() = Some(target.clone());

        let router = FrameRouter {
            multiplexer: self,
            codec: JsonCodec::new(),
            target: &target,
            cancel: &cancel,
        };
        let result = self
            .transport
            .stream(target.uri(), cancel.clone(), &router)
            .await;

        *self.active_target.write() = None;
        result.map_err(MultiplexerError::from)
    }
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("label", &self.label)
            .field("base_uri", &*self.base_uri.read())
            .field("topics", &self.table.read().topics())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamOperation for StreamMultiplexer {
    async fn run(&self, cancel: CancellationToken) -> Result<(), OperationError> {
        self.stream(cancel).await.map_err(OperationError::from)
    }

    fn is_ready(&self) -> bool {
        !self.table.read().is_empty()
    }

    fn is_running(&self) -> bool {
        self.transport.is_streaming()
    }

    fn opened_count(&self) -> u64 {
        self.opened.load(Ordering::Acquire)
    }

    fn name(&self) -> &'static str {
        self.label
    }
}

// =============================================================================
// Frame Router
// =============================================================================

struct FrameRouter<'a> {
    multiplexer: &'a StreamMultiplexer,
    codec: JsonCodec,
    target: &'a ConnectionTarget,
    cancel: &'a CancellationToken,
}

impl FrameRouter<'_> {
    fn route(&self, topic: &Topic, payload: &str) {
        let label = self.multiplexer.label;
        metrics::record_frame_received(label);

        let callbacks: Vec<FrameCallback> = self
            .multiplexer
            .table
            .read()
            .callbacks(topic)
            .map(<[FrameCallback]>::to_vec)
            .unwrap_or_default();
        let tapped = self.multiplexer.raw.receiver_count() > 0;

        if callbacks.is_empty() && !tapped {
            debug!(stream = label, topic = %topic, "dropping unrouted frame");
            metrics::record_frame_dropped(label, DropReason::Unrouted);
            return;
        }

        let frame = StreamFrame {
            topic,
            payload,
            cancel: self.cancel,
        };
        for callback in &callbacks {
            invoke_isolated(label, topic, || callback(&frame));
        }

        if tapped {
            let _ = self.multiplexer.raw.send(RawFrame {
                topic: topic.clone(),
                payload: Arc::from(payload),
            });
        }
    }
}

impl TransportObserver for FrameRouter<'_> {
    fn on_open(&self) {
        let label = self.multiplexer.label;
        self.multiplexer.opened.fetch_add(1, Ordering::AcqRel);
        metrics::record_connection(label, true);
        info!(
            stream = label,
            topics = self.target.topics().len(),
            combined = self.target.is_combined(),
            "stream connected"
        );
    }

    fn on_message(&self, text: &str) {
        if self.target.is_combined() {
            match self.codec.envelope(text) {
                Ok(envelope) => {
                    let topic = Topic::new(envelope.stream);
                    self.route(&topic, envelope.data.get());
                }
                Err(e) => {
                    debug!(
                        stream = self.multiplexer.label,
                        error = %e,
                        "dropping frame without envelope"
                    );
                    metrics::record_frame_dropped(self.multiplexer.label, DropReason::Unaddressed);
                }
            }
        } else if let Some(topic) = self.target.single_topic() {
            self.route(topic, text);
        }
    }

    fn on_close(&self) {
        metrics::record_connection(self.multiplexer.label, false);
        info!(stream = self.multiplexer.label, "stream disconnected");
    }
}

/// Run one subscriber callback, containing its errors and panics.
pub(crate) fn invoke_isolated(
    stream: &'static str,
    topic: &Topic,
    callback: impl FnOnce() -> Result<(), HandlerError>,
) {
    match std::panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(stream, topic = %topic, error = %e, "subscriber callback failed");
            metrics::record_callback_failure(stream);
        }
        Err(panic) => {
            error!(
                stream,
                topic = %topic,
                panic = panic_message(&*panic),
                "subscriber callback panicked"
            );
            metrics::record_callback_failure(stream);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use parking_lot::Mutex;

    use super::*;
    use crate::domain::market::Symbol;

    /// Replays scripted frames on every `stream` call.
    #[derive(Default)]
    struct ScriptedTransport {
        frames: Vec<String>,
        uris: Mutex<Vec<String>>,
        streaming: std::sync::atomic::AtomicBool,
    }

    impl ScriptedTransport {
        fn new(frames: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                frames: frames.iter().map(ToString::to_string).collect(),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl FrameTransport for ScriptedTransport {
        async fn stream(
            &self,
            uri: &str,
            _cancel: CancellationToken,
            observer: &dyn TransportObserver,
        ) -> Result<(), TransportError> {
            self.uris.lock().push(uri.to_string());
            observer.on_open();
            for frame in &self.frames {
                observer.on_message(frame);
            }
            observer.on_close();
            Ok(())
        }

        fn is_streaming(&self) -> bool {
            self.streaming.load(Ordering::SeqCst)
        }
    }

    fn handler(
        f: impl Fn(&StreamFrame<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> FrameCallback {
        Arc::new(f)
    }

    fn counting(counter: &Arc<AtomicU32>) -> FrameCallback {
        let counter = Arc::clone(counter);
        handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn trade_topic() -> Topic {
        Topic::trade(&Symbol::new("BTCUSDT"))
    }

    #[tokio::test]
    async fn empty_table_fails_fast() {
        let transport = ScriptedTransport::new(&[]);
        let mux = StreamMultiplexer::new("test", "wss://example", transport.clone());

        let result = mux.stream(CancellationToken::new()).await;
        assert!(matches!(result, Err(MultiplexerError::NoTopics)));
        assert!(transport.uris.lock().is_empty());
        assert!(!mux.is_ready());
    }

    #[tokio::test]
    async fn single_topic_frames_route_without_envelope() {
        let transport = ScriptedTransport::new(&[r#"{"e":"trade"}"#, r#"{"e":"trade"}"#]);
        let mux = StreamMultiplexer::new("test", "wss://example", transport.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        mux.subscribe(
            trade_topic(),
            Some(handler(move |frame| {
                sink.lock().push(format!("{}|{}", frame.topic, frame.payload));
                Ok(())
            })),
        );

        mux.stream(CancellationToken::new()).await.unwrap();

        assert_eq!(
            *transport.uris.lock(),
            vec!["wss://example/ws/btcusdt@trade"]
        );
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(seen.lock()[0], r#"btcusdt@trade|{"e":"trade"}"#);
        assert_eq!(mux.opened_count(), 1);
    }

    #[tokio::test]
    async fn combined_frames_are_unwrapped_and_unrouted_dropped() {
        let transport = ScriptedTransport::new(&[
            r#"{"stream":"btcusdt@trade","data":{"e":"trade"}}"#,
            r#"{"stream":"ethusdt@trade","data":{"e":"trade"}}"#,
            r#"{"stream":"xrpusdt@trade","data":{"e":"trade"}}"#,
            "not json",
        ]);
        let mux = StreamMultiplexer::new("test", "wss://example", transport.clone());
        let btc = Arc::new(AtomicU32::new(0));
        let eth = Arc::new(AtomicU32::new(0));
        mux.subscribe(trade_topic(), Some(counting(&btc)));
        mux.subscribe(Topic::trade(&Symbol::new("ETHUSDT")), Some(counting(&eth)));

        mux.stream(CancellationToken::new()).await.unwrap();

        assert_eq!(
            *transport.uris.lock(),
            vec!["wss://example/stream?streams=btcusdt@trade/ethusdt@trade"]
        );
        assert_eq!(btc.load(Ordering::SeqCst), 1);
        assert_eq!(eth.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_callback_does_not_stop_siblings() {
        let transport = ScriptedTransport::new(&["{}", "{}"]);
        let mux = StreamMultiplexer::new("test", "wss://example", transport);
        let after = Arc::new(AtomicU32::new(0));

        mux.subscribe(trade_topic(), Some(handler(|_| Err("boom".into()))));
        mux.subscribe(trade_topic(), Some(handler(|_| panic!("handler bug"))));
        mux.subscribe(trade_topic(), Some(counting(&after)));

        mux.stream(CancellationToken::new()).await.unwrap();
        assert_eq!(after.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_callback_and_unknown_unsubscribe_are_noops() {
        let mux = StreamMultiplexer::new("test", "wss://example", ScriptedTransport::new(&[]));
        let counter = Arc::new(AtomicU32::new(0));
        let callback = counting(&counter);
        let other = counting(&counter);

        assert!(mux.subscribe(trade_topic(), Some(Arc::clone(&callback))));
        assert!(!mux.subscribe(trade_topic(), Some(Arc::clone(&callback))));
        assert!(!mux.unsubscribe(&trade_topic(), Some(&other)));
        assert!(!mux.unsubscribe(&Topic::new("nothing"), Some(&callback)));
        assert_eq!(mux.topics().len(), 1);

        assert!(mux.unsubscribe(&trade_topic(), Some(&callback)));
        assert!(mux.topics().is_empty());
    }

    #[tokio::test]
    async fn pinned_topic_feeds_raw_listeners() {
        let transport = ScriptedTransport::new(&[r#"{"e":"trade"}"#]);
        let mux = StreamMultiplexer::new("test", "wss://example", transport);
        let mut raw = mux.raw_frames();

        assert!(mux.subscribe(trade_topic(), None));
        mux.stream(CancellationToken::new()).await.unwrap();

        let frame = raw.try_recv().unwrap();
        assert_eq!(frame.topic, trade_topic());
        assert_eq!(&*frame.payload, r#"{"e":"trade"}"#);

        assert!(mux.unsubscribe(&trade_topic(), None));
        assert!(!mux.is_ready());
    }

    #[tokio::test]
    async fn base_uri_is_frozen_while_streaming() {
        let transport = ScriptedTransport::new(&[]);
        let mux = StreamMultiplexer::new("test", "wss://example", transport.clone());

        transport.streaming.store(true, Ordering::SeqCst);
        assert!(matches!(
            mux.set_base_uri("wss://other"),
            Err(MultiplexerError::TargetFrozen)
        ));

        transport.streaming.store(false, Ordering::SeqCst);
        mux.set_base_uri("wss://other").unwrap();
        mux.subscribe(trade_topic(), None);
        assert_eq!(
            mux.target().unwrap().uri(),
            "wss://other/ws/btcusdt@trade"
        );
    }

    #[tokio::test]
    async fn subscription_during_attempt_applies_to_next_attempt() {
        let transport = ScriptedTransport::new(&[r#"{"e":"trade"}"#]);
        let mux = Arc::new(StreamMultiplexer::new(
            "test",
            "wss://example",
            transport.clone(),
        ));
        let weak = Arc::downgrade(&mux);
        mux.subscribe(
            trade_topic(),
            Some(handler(move |_| {
                if let Some(mux) = weak.upgrade() {
                    mux.subscribe(Topic::trade(&Symbol::new("ETHUSDT")), None);
                }
                Ok(())
            })),
        );

        mux.stream(CancellationToken::new()).await.unwrap();
        mux.stream(CancellationToken::new()).await.unwrap();

        let uris = transport.uris.lock().clone();
        assert_eq!(uris[0], "wss://example/ws/btcusdt@trade");
        assert_eq!(
            uris[1],
            "wss://example/stream?streams=btcusdt@trade/ethusdt@trade"
        );
    }
}
