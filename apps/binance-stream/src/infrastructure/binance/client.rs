//! Typed Event Client
//!
//! One decode-and-route engine shared by every stream family. An
//! [`EventFamily`] supplies the topic naming rule and the payload decoder;
//! [`EventClient`] keeps the per-key registrations, installs a single
//! dispatcher callback per topic on the [`StreamMultiplexer`], and for each
//! decoded event invokes:
//!
//! 1. the callbacks registered for that key, in registration order, each
//!    isolated from the others;
//! 2. the family-wide broadcast channel.
//!
//! Undecodable frames are logged, counted and dropped.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::{CodecError, JsonCodec};
use super::multiplexer::{
    FrameCallback, HandlerError, StreamFrame, StreamMultiplexer, invoke_isolated,
};
use crate::application::services::clock::ClockSync;
use crate::domain::topic::Topic;
use crate::infrastructure::metrics;

// =============================================================================
// Family Contract
// =============================================================================

/// Inputs available to a family decoder.
#[derive(Clone, Copy)]
pub struct DecodeContext<'a, K> {
    /// Key the topic was subscribed with.
    pub key: &'a K,
    /// Undecoded payload.
    pub payload: &'a str,
    /// Shared JSON codec.
    pub codec: &'a JsonCodec,
    /// Exchange clock, for payloads without an event time.
    pub clock: Option<&'a ClockSync>,
}

impl<K> DecodeContext<'_, K> {
    /// Exchange "now" (local time when no clock is attached).
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.map_or_else(Utc::now, ClockSync::now)
    }
}

/// A stream family: topic naming plus payload decoding.
pub trait EventFamily: Send + Sync + 'static {
    /// Subscription key (symbol, symbol and interval, listen key, ...).
    type Key: Clone + Eq + fmt::Debug + Send + Sync + 'static;

    /// Decoded event payload.
    type Event: Clone + fmt::Debug + Send + Sync + 'static;

    /// Family name used in logs, metrics and errors.
    const NAME: &'static str;

    /// Whether a key may only be subscribed once.
    const UNIQUE_PER_KEY: bool = false;

    /// Topic carrying the events for `key`.
    fn topic(key: &Self::Key) -> Topic;

    /// Reject keys the exchange would not accept.
    fn validate(_key: &Self::Key) -> Result<(), String> {
        Ok(())
    }

    /// Decode one payload into its event time and event.
    fn decode(
        context: &DecodeContext<'_, Self::Key>,
    ) -> Result<(DateTime<Utc>, Self::Event), CodecError>;
}

// =============================================================================
// Types
// =============================================================================

/// A decoded event with its routing context.
#[derive(Debug, Clone)]
pub struct StreamEvent<E> {
    /// Topic the event arrived on.
    pub topic: Topic,
    /// Exchange event time.
    pub event_time: DateTime<Utc>,
    /// Cancellation signal of the connection that delivered the event.
    pub cancel: CancellationToken,
    /// Event payload.
    pub data: E,
}

/// Callback receiving decoded events.
pub type EventCallback<E> =
    Arc<dyn Fn(&StreamEvent<E>) -> Result<(), HandlerError> + Send + Sync>;

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Client errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The family allows one subscription per key and the key is taken.
    #[error("already subscribed to {0}")]
    DuplicateSubscription(Topic),

    /// The key is not valid for the family.
    #[error("invalid subscription key: {0}")]
    InvalidKey(String),

    /// The client's mutation queue is gone.
    #[error("client worker stopped")]
    WorkerStopped,
}

/// Subscription operations shared by plain and managed clients.
#[async_trait]
pub trait EventSubscriber<F: EventFamily>: Send + Sync {
    /// Register a callback (or only the key, with `None`).
    async fn subscribe(
        &self,
        key: F::Key,
        callback: Option<EventCallback<F::Event>>,
    ) -> Result<SubscriptionId, ClientError>;

    /// Remove one subscription; unknown subscriptions are a no-op.
    async fn unsubscribe(&self, key: F::Key, id: SubscriptionId) -> Result<bool, ClientError>;

    /// Remove every subscription of a key.
    async fn unsubscribe_key(&self, key: F::Key) -> Result<bool, ClientError>;

    /// Move all subscriptions of `old` to `new` without losing callbacks.
    async fn rekey(&self, old: F::Key, new: F::Key) -> Result<bool, ClientError>;

    /// Receive every decoded event of the family.
    fn events(&self) -> broadcast::Receiver<StreamEvent<F::Event>>;
}

// =============================================================================
// Registry
// =============================================================================

struct Registration<F: EventFamily> {
    key: F::Key,
    subscribers: Vec<(SubscriptionId, Option<EventCallback<F::Event>>)>,
}

impl<F: EventFamily> Registration<F> {
    fn callbacks(&self) -> Vec<EventCallback<F::Event>> {
        self.subscribers
            .iter()
            .filter_map(|(_, callback)| callback.clone())
            .collect()
    }
}

type Registry<F> = std::collections::BTreeMap<Topic, Registration<F>>;

// =============================================================================
// Event Client
// =============================================================================

/// Typed client for one stream family.
pub struct EventClient<F: EventFamily> {
    multiplexer: Arc<StreamMultiplexer>,
    registry: Arc<RwLock<Registry<F>>>,
    events: broadcast::Sender<StreamEvent<F::Event>>,
    dispatcher: FrameCallback,
    next_id: AtomicU64,
}

impl<F: EventFamily> EventClient<F> {
    /// Create a client publishing into a channel of `capacity` events.
    #[must_use]
    pub fn new(multiplexer: Arc<StreamMultiplexer>, capacity: usize) -> Self {
        Self::with_clock(multiplexer, capacity, None)
    }

    /// Create a client whose decoder can consult the exchange clock.
    #[must_use]
    pub fn with_clock(
        multiplexer: Arc<StreamMultiplexer>,
        capacity: usize,
        clock: Option<Arc<ClockSync>>,
    ) -> Self {
        let registry: Arc<RwLock<Registry<F>>> = Arc::default();
        let (events, _) = broadcast::channel(capacity.max(1));
        let dispatcher = dispatcher(Arc::clone(&registry), events.clone(), clock);
        Self {
            multiplexer,
            registry,
            events,
            dispatcher,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback for `key`, or only the key when `callback` is `None`.
    pub fn subscribe(
        &self,
        key: F::Key,
        callback: Option<EventCallback<F::Event>>,
    ) -> Result<SubscriptionId, ClientError> {
        F::validate(&key).map_err(ClientError::InvalidKey)?;
        let topic = F::topic(&key);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut registry = self.registry.write();
        match registry.get_mut(&topic) {
            Some(_) if F::UNIQUE_PER_KEY => {
                return Err(ClientError::DuplicateSubscription(topic));
            }
            Some(registration) => registration.subscribers.push((id, callback)),
            None => {
                registry.insert(
                    topic.clone(),
                    Registration {
                        key,
                        subscribers: vec![(id, callback)],
                    },
                );
                self.multiplexer
                    .subscribe(topic.clone(), Some(Arc::clone(&self.dispatcher)));
            }
        }
        debug!(family = F::NAME, topic = %topic, id = id.0, "subscription added");
        Ok(id)
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, key: &F::Key, id: SubscriptionId) -> bool {
        let topic = F::topic(key);
        let mut registry = self.registry.write();
        let Some(registration) = registry.get_mut(&topic) else {
            return false;
        };
        let before = registration.subscribers.len();
        registration.subscribers.retain(|(existing, _)| *existing != id);
        if registration.subscribers.len() == before {
            return false;
        }
        if registration.subscribers.is_empty() {
            registry.remove(&topic);
            self.multiplexer.unsubscribe(&topic, Some(&self.dispatcher));
        }
        true
    }

    /// Remove every subscription of `key`. Returns whether any existed.
    pub fn unsubscribe_key(&self, key: &F::Key) -> bool {
        let topic = F::topic(key);
        let removed = self.registry.write().remove(&topic).is_some();
        if removed {
            self.multiplexer.unsubscribe(&topic, Some(&self.dispatcher));
        }
        removed
    }

    /// Re-point every subscription of `old` to `new` in one step.
    ///
    /// Returns `false` when `old` had no subscriptions.
    pub fn rekey(&self, old: &F::Key, new: F::Key) -> Result<bool, ClientError> {
        F::validate(&new).map_err(ClientError::InvalidKey)?;
        let old_topic = F::topic(old);
        let new_topic = F::topic(&new);
        if old_topic == new_topic {
            return Ok(self.registry.read().contains_key(&old_topic));
        }

        let mut registry = self.registry.write();
        if registry.contains_key(&new_topic) {
            return Err(ClientError::DuplicateSubscription(new_topic));
        }
        let Some(mut registration) = registry.remove(&old_topic) else {
            return Ok(false);
        };
        registration.key = new;
        registry.insert(new_topic.clone(), registration);
        self.multiplexer
            .subscribe(new_topic.clone(), Some(Arc::clone(&self.dispatcher)));
        self.multiplexer.unsubscribe(&old_topic, Some(&self.dispatcher));
        debug!(family = F::NAME, from = %old_topic, to = %new_topic, "subscriptions re-keyed");
        Ok(true)
    }

    /// Topics with at least one subscription.
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.registry.read().keys().cloned().collect()
    }

    /// Subscribed keys.
    #[must_use]
    pub fn keys(&self) -> Vec<F::Key> {
        self.registry
            .read()
            .values()
            .map(|registration| registration.key.clone())
            .collect()
    }

    /// Receive every decoded event of the family.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StreamEvent<F::Event>> {
        self.events.subscribe()
    }

    /// The multiplexer carrying the family's topics.
    #[must_use]
    pub const fn multiplexer(&self) -> &Arc<StreamMultiplexer> {
        &self.multiplexer
    }
}

impl<F: EventFamily> fmt::Debug for EventClient<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventClient")
            .field("family", &F::NAME)
            .field("topics", &self.topics())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F: EventFamily> EventSubscriber<F> for EventClient<F> {
    async fn subscribe(
        &self,
        key: F::Key,
        callback: Option<EventCallback<F::Event>>,
    ) -> Result<SubscriptionId, ClientError> {
        Self::subscribe(self, key, callback)
    }

    async fn unsubscribe(&self, key: F::Key, id: SubscriptionId) -> Result<bool, ClientError> {
        Ok(Self::unsubscribe(self, &key, id))
    }

    async fn unsubscribe_key(&self, key: F::Key) -> Result<bool, ClientError> {
        Ok(Self::unsubscribe_key(self, &key))
    }

    async fn rekey(&self, old: F::Key, new: F::Key) -> Result<bool, ClientError> {
        Self::rekey(self, &old, new)
    }

    fn events(&self) -> broadcast::Receiver<StreamEvent<F::Event>> {
        Self::events(self)
    }
}

// =============================================================================
// Dispatch
// =============================================================================

fn dispatcher<F: EventFamily>(
    registry: Arc<RwLock<Registry<F>>>,
    events: broadcast::Sender<StreamEvent<F::Event>>,
    clock: Option<Arc<ClockSync>>,
) -> FrameCallback {
    let codec = JsonCodec::new();
    Arc::new(move |frame: &StreamFrame<'_>| -> Result<(), HandlerError> {
        let (key, callbacks) = {
            let registry = registry.read();
            let Some(registration) = registry.get(frame.topic) else {
                return Ok(());
            };
            (registration.key.clone(), registration.callbacks())
        };
        if callbacks.is_empty() && events.receiver_count() == 0 {
            return Ok(());
        }

        let context = DecodeContext {
            key: &key,
            payload: frame.payload,
            codec: &codec,
            clock: clock.as_deref(),
        };
        let (event_time, data) = match F::decode(&context) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    family = F::NAME,
                    topic = %frame.topic,
                    error = %e,
                    "dropping undecodable frame"
                );
                metrics::record_decode_error(F::NAME);
                return Ok(());
            }
        };

        let event = StreamEvent {
            topic: frame.topic.clone(),
            event_time,
            cancel: frame.cancel.clone(),
            data,
        };
        for callback in &callbacks {
            invoke_isolated(F::NAME, frame.topic, || callback(&event));
        }
        let _ = events.send(event);
        Ok(())
    })
}
