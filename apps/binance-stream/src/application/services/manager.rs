//! Stream Manager
//!
//! Owns one typed client and one stream controller per family. Every
//! subscription change goes through a per-family queue worker that runs
//! the cancel-mutate-restart sequence:
//!
//! ```text
//! subscribe() ──► queue ──► controller.cancel().await
//!                           client mutation
//!                           controller.begin()   (unless auto-run is suppressed)
//! ```
//!
//! One worker per family means two concurrent calls can never interleave
//! their steps. All families share one auto-run flag so callers can batch
//! subscriptions before the first connection attempt, and one error
//! channel carrying the originating family.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::ClockSync;
use super::controller::{ControllerEvent, ControllerStatus, StreamController};
use super::retry::{ReconnectConfig, RetryStrategy};
use crate::StreamSettings;
use crate::application::ports::ExchangeRest;
use crate::domain::topic::Topic;
use crate::infrastructure::binance::client::{
    ClientError, EventCallback, EventClient, EventFamily, EventSubscriber, StreamEvent,
    SubscriptionId,
};
use crate::infrastructure::binance::families::{
    AggregateTradeFamily, CandlestickFamily, DepthFamily, StatisticsFamily, TradeFamily,
    UserDataFamily,
};
use crate::infrastructure::binance::multiplexer::StreamMultiplexer;
use crate::infrastructure::binance::transport::{FrameTransport, WebSocketTransport};

const ERROR_CAPACITY: usize = 256;

// =============================================================================
// Errors
// =============================================================================

/// An error raised by one family's controller or queued mutation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{family} client: {source}")]
pub struct ManagerError {
    /// Family that raised the error.
    pub family: &'static str,
    /// Underlying error.
    pub source: Arc<dyn Error + Send + Sync>,
}

impl ManagerError {
    fn new(family: &'static str, source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            family,
            source: Arc::new(source),
        }
    }
}

// =============================================================================
// Managed Client
// =============================================================================

type Job<F> = Box<dyn FnOnce(&EventClient<F>) -> Result<(), ClientError> + Send>;

enum Command<F: EventFamily> {
    Mutate(Job<F>),
    Start,
}

/// State shared by every managed client of one manager.
#[derive(Clone)]
struct Shared {
    suppressed: Arc<AtomicBool>,
    errors: broadcast::Sender<ManagerError>,
    shutdown: CancellationToken,
}

/// A typed client whose mutations are serialized with its controller.
pub struct ManagedClient<F: EventFamily> {
    client: Arc<EventClient<F>>,
    controller: Arc<StreamController>,
    commands: mpsc::UnboundedSender<Command<F>>,
}

impl<F: EventFamily> Clone for ManagedClient<F> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            controller: Arc::clone(&self.controller),
            commands: self.commands.clone(),
        }
    }
}

impl<F: EventFamily> ManagedClient<F> {
    /// Start the queue worker and error forwarder for one family.
    fn spawn(
        client: Arc<EventClient<F>>,
        controller: Arc<StreamController>,
        shared: &Shared,
    ) -> Self {
        let (commands, queue) = mpsc::unbounded_channel();

        tokio::spawn(run_queue(
            Arc::clone(&client),
            Arc::clone(&controller),
            queue,
            shared.clone(),
        ));
        tokio::spawn(forward_errors::<F>(controller.events(), shared.clone()));

        Self {
            client,
            controller,
            commands,
        }
    }

    /// Queue a mutation and wait for its result.
    async fn enqueue<T, J>(&self, job: J) -> Result<T, ClientError>
    where
        T: Send + 'static,
        J: FnOnce(&EventClient<F>) -> Result<T, ClientError> + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let job: Job<F> = Box::new(move |client| {
            let outcome = job(client);
            let status = outcome.as_ref().map(|_| ()).map_err(Clone::clone);
            let _ = reply.send(outcome);
            status
        });
        self.commands
            .send(Command::Mutate(job))
            .map_err(|_| ClientError::WorkerStopped)?;
        result.await.map_err(|_| ClientError::WorkerStopped)?
    }

    /// Ask the worker to begin streaming if allowed and idle.
    fn start(&self) {
        if self.commands.send(Command::Start).is_err() {
            debug!(family = F::NAME, "start ignored, worker stopped");
        }
    }

    /// Register a callback (or only the key).
    pub async fn subscribe(
        &self,
        key: F::Key,
        callback: Option<EventCallback<F::Event>>,
    ) -> Result<SubscriptionId, ClientError> {
        self.enqueue(move |client| client.subscribe(key, callback))
            .await
    }

    /// Remove one subscription.
    pub async fn unsubscribe(&self, key: F::Key, id: SubscriptionId) -> Result<bool, ClientError> {
        self.enqueue(move |client| Ok(client.unsubscribe(&key, id)))
            .await
    }

    /// Remove every subscription of a key.
    pub async fn unsubscribe_key(&self, key: F::Key) -> Result<bool, ClientError> {
        self.enqueue(move |client| Ok(client.unsubscribe_key(&key)))
            .await
    }

    /// Move the subscriptions of `old` to `new`.
    pub async fn rekey(&self, old: F::Key, new: F::Key) -> Result<bool, ClientError> {
        self.enqueue(move |client| client.rekey(&old, new)).await
    }

    /// Receive every decoded event of the family.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StreamEvent<F::Event>> {
        self.client.events()
    }

    /// Subscribed topics.
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.client.topics()
    }

    /// Controller status.
    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        self.controller.status()
    }

    /// The underlying typed client.
    #[must_use]
    pub const fn client(&self) -> &Arc<EventClient<F>> {
        &self.client
    }

    /// The family's controller.
    #[must_use]
    pub const fn controller(&self) -> &Arc<StreamController> {
        &self.controller
    }
}

impl<F: EventFamily> fmt::Debug for ManagedClient<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedClient")
            .field("family", &F::NAME)
            .field("status", &self.controller.status())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F: EventFamily> EventSubscriber<F> for ManagedClient<F> {
    async fn subscribe(
        &self,
        key: F::Key,
        callback: Option<EventCallback<F::Event>>,
    ) -> Result<SubscriptionId, ClientError> {
        Self::subscribe(self, key, callback).await
    }

    async fn unsubscribe(&self, key: F::Key, id: SubscriptionId) -> Result<bool, ClientError> {
        Self::unsubscribe(self, key, id).await
    }

    async fn unsubscribe_key(&self, key: F::Key) -> Result<bool, ClientError> {
        Self::unsubscribe_key(self, key).await
    }

    async fn rekey(&self, old: F::Key, new: F::Key) -> Result<bool, ClientError> {
        Self::rekey(self, old, new).await
    }

    fn events(&self) -> broadcast::Receiver<StreamEvent<F::Event>> {
        Self::events(self)
    }
}

async fn run_queue<F: EventFamily>(
    client: Arc<EventClient<F>>,
    controller: Arc<StreamController>,
    mut queue: mpsc::UnboundedReceiver<Command<F>>,
    shared: Shared,
) {
    loop {
        let command = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            command = queue.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        if let Command::Mutate(job) = command {
            controller.cancel().await;
            if let Err(error) = job(&client) {
                warn!(family = F::NAME, error = %error, "queued mutation failed");
                let _ = shared.errors.send(ManagerError::new(F::NAME, error));
            }
        }

        if !shared.suppressed.load(Ordering::Acquire)
            && controller.is_idle()
            && controller.begin()
        {
            debug!(family = F::NAME, topics = client.topics().len(), "stream started");
        }
    }
    debug!(family = F::NAME, "queue worker stopped");
}

async fn forward_errors<F: EventFamily>(
    mut events: broadcast::Receiver<ControllerEvent>,
    shared: Shared,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(ControllerEvent::Error(source)) => {
                let _ = shared.errors.send(ManagerError {
                    family: F::NAME,
                    source,
                });
            }
            Ok(ControllerEvent::Pausing { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(family = F::NAME, skipped, "controller events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// =============================================================================
// Stream Manager
// =============================================================================

/// One managed client per stream family.
pub struct StreamManager {
    trades: ManagedClient<TradeFamily>,
    aggregate_trades: ManagedClient<AggregateTradeFamily>,
    candlesticks: ManagedClient<CandlestickFamily>,
    depth: ManagedClient<DepthFamily>,
    statistics: ManagedClient<StatisticsFamily>,
    user_data: ManagedClient<UserDataFamily>,
    shared: Shared,
}

impl StreamManager {
    /// Create a manager streaming over WebSockets.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        stream_url: &str,
        settings: &StreamSettings,
        rest: Arc<dyn ExchangeRest>,
        clock: Option<Arc<ClockSync>>,
    ) -> Self {
        let close_timeout = settings.close_timeout;
        Self::with_transport_factory(stream_url, settings, rest, clock, move || {
            Arc::new(WebSocketTransport::new(close_timeout))
        })
    }

    /// Create a manager whose connections use transports from `factory`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn with_transport_factory(
        stream_url: &str,
        settings: &StreamSettings,
        rest: Arc<dyn ExchangeRest>,
        clock: Option<Arc<ClockSync>>,
        factory: impl Fn() -> Arc<dyn FrameTransport>,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        let shared = Shared {
            suppressed: Arc::new(AtomicBool::new(false)),
            errors,
            shutdown: CancellationToken::new(),
        };
        let builder = FamilyBuilder {
            stream_url,
            settings,
            rest: &rest,
            clock: &clock,
            shared: &shared,
            factory: &factory,
        };

        Self {
            trades: builder.build(),
            aggregate_trades: builder.build(),
            candlesticks: builder.build(),
            depth: builder.build(),
            statistics: builder.build(),
            user_data: builder.build(),
            shared,
        }
    }

    /// Trade stream client.
    #[must_use]
    pub const fn trades(&self) -> &ManagedClient<TradeFamily> {
        &self.trades
    }

    /// Aggregate trade stream client.
    #[must_use]
    pub const fn aggregate_trades(&self) -> &ManagedClient<AggregateTradeFamily> {
        &self.aggregate_trades
    }

    /// Candlestick stream client.
    #[must_use]
    pub const fn candlesticks(&self) -> &ManagedClient<CandlestickFamily> {
        &self.candlesticks
    }

    /// Depth stream client.
    #[must_use]
    pub const fn depth(&self) -> &ManagedClient<DepthFamily> {
        &self.depth
    }

    /// 24h statistics stream client.
    #[must_use]
    pub const fn statistics(&self) -> &ManagedClient<StatisticsFamily> {
        &self.statistics
    }

    /// User-data stream client.
    #[must_use]
    pub const fn user_data(&self) -> &ManagedClient<UserDataFamily> {
        &self.user_data
    }

    /// Hold connection attempts back while subscriptions are batched.
    pub fn suppress_auto_run(&self) {
        self.shared.suppressed.store(true, Ordering::Release);
    }

    /// Allow connection attempts again and start every idle family.
    pub fn resume_auto_run(&self) {
        self.shared.suppressed.store(false, Ordering::Release);
        self.trades.start();
        self.aggregate_trades.start();
        self.candlesticks.start();
        self.depth.start();
        self.statistics.start();
        self.user_data.start();
    }

    /// Whether connection attempts are held back.
    #[must_use]
    pub fn is_auto_run_suppressed(&self) -> bool {
        self.shared.suppressed.load(Ordering::Acquire)
    }

    /// Receive errors from every family.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<ManagerError> {
        self.shared.errors.subscribe()
    }

    /// Stop the queue workers and cancel every connection.
    pub async fn shutdown(&self) {
        self.suppress_auto_run();
        self.shared.shutdown.cancel();
        self.trades.controller.cancel().await;
        self.aggregate_trades.controller.cancel().await;
        self.candlesticks.controller.cancel().await;
        self.depth.controller.cancel().await;
        self.statistics.controller.cancel().await;
        self.user_data.controller.cancel().await;
        info!("stream manager stopped");
    }
}

impl fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamManager")
            .field("trades", &self.trades)
            .field("aggregate_trades", &self.aggregate_trades)
            .field("candlesticks", &self.candlesticks)
            .field("depth", &self.depth)
            .field("statistics", &self.statistics)
            .field("user_data", &self.user_data)
            .field("suppressed", &self.is_auto_run_suppressed())
            .finish()
    }
}

struct FamilyBuilder<'a, T> {
    stream_url: &'a str,
    settings: &'a StreamSettings,
    rest: &'a Arc<dyn ExchangeRest>,
    clock: &'a Option<Arc<ClockSync>>,
    shared: &'a Shared,
    factory: &'a T,
}

impl<T: Fn() -> Arc<dyn FrameTransport>> FamilyBuilder<'_, T> {
    fn build<F: EventFamily>(&self) -> ManagedClient<F> {
        let multiplexer = Arc::new(StreamMultiplexer::new(
            F::NAME,
            self.stream_url,
            (self.factory)(),
        ));
        let client = Arc::new(EventClient::<F>::with_clock(
            Arc::clone(&multiplexer),
            self.settings.event_capacity,
            self.clock.clone(),
        ));
        let strategy = RetryStrategy::Exponential(ReconnectConfig::from_stream_settings(
            self.settings,
        ));
        let controller = Arc::new(
            StreamController::new(multiplexer, strategy).with_maintenance_check(
                Arc::clone(self.rest),
                self.settings.maintenance_check_interval,
            ),
        );
        ManagedClient::spawn(client, controller, self.shared)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::application::ports::MockExchangeRest;
    use crate::domain::market::{Symbol, SystemStatus};
    use crate::infrastructure::binance::families::DepthKey;
    use crate::infrastructure::binance::transport::{TransportError, TransportObserver};

    /// Records every URI and stays connected until cancelled.
    #[derive(Default)]
    struct HoldingTransport {
        uris: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FrameTransport for HoldingTransport {
        async fn stream(
            &self,
            uri: &str,
            cancel: CancellationToken,
            observer: &dyn TransportObserver,
        ) -> Result<(), TransportError> {
            self.uris.lock().push(uri.to_string());
            observer.on_open();
            cancel.cancelled().await;
            observer.on_close();
            Ok(())
        }

        fn is_streaming(&self) -> bool {
            false
        }
    }

    fn rest() -> Arc<dyn ExchangeRest> {
        let mut rest = MockExchangeRest::new();
        rest.expect_system_status()
            .returning(|| Ok(SystemStatus::Normal));
        Arc::new(rest)
    }

    fn manager(transport: &Arc<HoldingTransport>) -> StreamManager {
        let transport = Arc::clone(transport);
        StreamManager::with_transport_factory(
            "wss://test",
            &StreamSettings::default(),
            rest(),
            None,
            move || Arc::clone(&transport) as Arc<dyn FrameTransport>,
        )
    }

    async fn wait_for_uris(transport: &HoldingTransport, count: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let uris = transport.uris.lock().clone();
                if uris.len() >= count {
                    return uris;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn each_subscription_restarts_with_new_target() {
        let transport = Arc::new(HoldingTransport::default());
        let manager = manager(&transport);

        manager
            .trades()
            .subscribe(Symbol::new("BTCUSDT"), None)
            .await
            .unwrap();
        wait_for_uris(&transport, 1).await;

        manager
            .trades()
            .subscribe(Symbol::new("ETHUSDT"), None)
            .await
            .unwrap();
        let uris = wait_for_uris(&transport, 2).await;

        assert_eq!(uris[0], "wss://test/ws/btcusdt@trade");
        assert_eq!(uris[1], "wss://test/stream?streams=btcusdt@trade/ethusdt@trade");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn suppressed_auto_run_batches_subscriptions() {
        let transport = Arc::new(HoldingTransport::default());
        let manager = manager(&transport);
        manager.suppress_auto_run();

        for symbol in ["BTCUSDT", "ETHUSDT", "BNBUSDT"] {
            manager
                .trades()
                .subscribe(Symbol::new(symbol), None)
                .await
                .unwrap();
        }
        assert!(transport.uris.lock().is_empty());
        assert_eq!(manager.trades().status(), ControllerStatus::Idle);

        manager.resume_auto_run();
        let uris = wait_for_uris(&transport, 1).await;
        assert_eq!(
            uris,
            vec!["wss://test/stream?streams=bnbusdt@trade/btcusdt@trade/ethusdt@trade".to_string()]
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_subscriptions_are_serialized() {
        let transport = Arc::new(HoldingTransport::default());
        let manager = manager(&transport);
        manager.suppress_auto_run();

        let symbols: Vec<Symbol> = (0..16).map(|i| Symbol::new(format!("SYM{i}USDT"))).collect();
        let calls = symbols
            .iter()
            .map(|symbol| manager.trades().subscribe(symbol.clone(), None));
        let ids = futures::future::join_all(calls).await;

        assert!(ids.iter().all(Result::is_ok));
        assert_eq!(manager.trades().topics().len(), 16);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_mutation_reaches_error_channel() {
        let transport = Arc::new(HoldingTransport::default());
        let manager = manager(&transport);
        let mut errors = manager.errors();

        let key = DepthKey::diff(Symbol::new("BTCUSDT"));
        manager.depth().subscribe(key.clone(), None).await.unwrap();
        let duplicate = manager.depth().subscribe(key, None).await;

        assert!(matches!(duplicate, Err(ClientError::DuplicateSubscription(_))));
        let error = errors.recv().await.unwrap();
        assert_eq!(error.family, "depth");
        assert!(error.to_string().contains("already subscribed"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unsubscribing_everything_leaves_controller_idle() {
        let transport = Arc::new(HoldingTransport::default());
        let manager = manager(&transport);

        let id = manager
            .trades()
            .subscribe(Symbol::new("BTCUSDT"), None)
            .await
            .unwrap();
        wait_for_uris(&transport, 1).await;

        assert!(manager
            .trades()
            .unsubscribe(Symbol::new("BTCUSDT"), id)
            .await
            .unwrap());
        assert_eq!(manager.trades().status(), ControllerStatus::Idle);
        assert!(manager.trades().topics().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn calls_after_shutdown_report_stopped_worker() {
        let transport = Arc::new(HoldingTransport::default());
        let manager = manager(&transport);
        manager.shutdown().await;
        tokio::task::yield_now().await;

        let result = manager.trades().subscribe(Symbol::new("BTCUSDT"), None).await;
        assert_eq!(result, Err(ClientError::WorkerStopped));
    }
}
