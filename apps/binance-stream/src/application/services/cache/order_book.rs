//! Order Book Cache
//!
//! Keeps a local order book per symbol. Diff books follow the exchange
//! procedure:
//!
//! 1. Subscribe to `{symbol}@depth` and buffer updates.
//! 2. Once the first update is buffered, fetch a REST snapshot and
//!    reconcile the buffer against it.
//! 3. Apply live updates, checking sequence continuity.
//!
//! Any gap hands the symbol back to its resync task, which refetches the
//! snapshot with a delay between attempts. After too many consecutive
//! failures the book is abandoned and a [`CacheError::ResyncExhausted`] is
//! published; [`OrderBookCache::resync`] starts over.
//!
//! Partial book streams (`@depth5/10/20`) carry whole books and replace the
//! local copy directly.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::CacheError;
use crate::application::ports::ExchangeRest;
use crate::domain::events::{DepthUpdate, DepthUpdateKind};
use crate::domain::market::Symbol;
use crate::domain::order_book::{DepthSynchronizer, SyncOutcome, SyncPhase};
use crate::domain::order_book::{OrderBook, OrderBookSnapshot};
use crate::infrastructure::binance::client::{
    EventCallback, EventSubscriber, StreamEvent, SubscriptionId,
};
use crate::infrastructure::binance::families::{DepthFamily, DepthKey};
use crate::infrastructure::binance::multiplexer::HandlerError;
use crate::infrastructure::config::CacheSettings;
use crate::infrastructure::metrics::{self, ResyncOutcome};

const UPDATE_CAPACITY: usize = 1024;
const ERROR_CAPACITY: usize = 64;

enum BookState {
    Diff(DepthSynchronizer),
    Partial(Option<OrderBook>),
}

impl BookState {
    fn snapshot(&self) -> Option<OrderBookSnapshot> {
        match self {
            Self::Diff(sync) => sync.snapshot(),
            Self::Partial(book) => book.as_ref().map(OrderBook::snapshot),
        }
    }
}

struct BookEntry {
    key: DepthKey,
    state: Mutex<BookState>,
    resync: Notify,
    buffered: Notify,
    cancel: CancellationToken,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl BookEntry {
    fn symbol(&self) -> &Symbol {
        &self.key.symbol
    }

    /// Fold one stream update into the book; returns the new snapshot when
    /// the book changed.
    fn on_update(&self, update: &DepthUpdate) -> Option<OrderBookSnapshot> {
        let mut state = self.state.lock();
        match &mut *state {
            BookState::Diff(sync) => match sync.on_update(update) {
                Ok(SyncOutcome::Applied) => sync.snapshot(),
                Ok(SyncOutcome::Buffered) => {
                    self.buffered.notify_one();
                    None
                }
                Ok(SyncOutcome::Ignored) => None,
                Err(desync) => {
                    warn!(symbol = %self.symbol(), error = %desync, "order book desynchronized");
                    metrics::record_resync(self.symbol().as_str(), ResyncOutcome::Requested);
                    self.resync.notify_one();
                    None
                }
            },
            BookState::Partial(book) => {
                if update.kind != DepthUpdateKind::Partial {
                    return None;
                }
                let book = book.get_or_insert_with(|| OrderBook::new(self.symbol().clone()));
                book.replace(update.last_update_id, &update.bids, &update.asks);
                Some(book.snapshot())
            }
        }
    }
}

/// Locally synchronized order books.
pub struct OrderBookCache {
    client: Arc<dyn EventSubscriber<DepthFamily>>,
    rest: Arc<dyn ExchangeRest>,
    settings: CacheSettings,
    books: RwLock<HashMap<Symbol, Arc<BookEntry>>>,
    updates: broadcast::Sender<OrderBookSnapshot>,
    errors: broadcast::Sender<CacheError>,
}

impl OrderBookCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(
        client: Arc<dyn EventSubscriber<DepthFamily>>,
        rest: Arc<dyn ExchangeRest>,
        settings: CacheSettings,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        Self {
            client,
            rest,
            settings,
            books: RwLock::new(HashMap::new()),
            updates,
            errors,
        }
    }

    /// Start maintaining a book for `symbol`.
    ///
    /// `levels` selects a partial book stream (5, 10 or 20 levels) instead
    /// of the diff stream. Must be called from within a Tokio runtime.
    pub async fn subscribe(&self, symbol: Symbol, levels: Option<u16>) -> Result<(), CacheError> {
        let key = DepthKey { symbol, levels };
        let entry = {
            let mut books = self.books.write();
            if books.contains_key(&key.symbol) {
                return Err(CacheError::AlreadySubscribed(key.symbol.to_string()));
            }
            let state = if key.is_partial() {
                BookState::Partial(None)
            } else {
                let mut sync = DepthSynchronizer::new(key.symbol.clone());
                sync.start_buffering();
                BookState::Diff(sync)
            };
            let entry = Arc::new(BookEntry {
                key: key.clone(),
                state: Mutex::new(state),
                resync: Notify::new(),
                buffered: Notify::new(),
                cancel: CancellationToken::new(),
                subscription: Mutex::new(None),
            });
            books.insert(key.symbol.clone(), Arc::clone(&entry));
            entry
        };

        // The topic opens before the snapshot request so no update is missed.
        let callback = book_callback(Arc::clone(&entry), self.updates.clone());
        let id = match self.client.subscribe(key.clone(), Some(callback)).await {
            Ok(id) => id,
            Err(error) => {
                self.books.write().remove(&key.symbol);
                return Err(error.into());
            }
        };
        *entry.subscription.lock() = Some(id);

        if !key.is_partial() {
            tokio::spawn(
                Resync {
                    entry: Arc::clone(&entry),
                    rest: Arc::clone(&self.rest),
                    settings: self.settings.clone(),
                    updates: self.updates.clone(),
                    errors: self.errors.clone(),
                }
                .run(),
            );
            entry.resync.notify_one();
        }
        info!(symbol = %key.symbol, levels = ?key.levels, "order book subscribed");
        Ok(())
    }

    /// Stop maintaining the book for `symbol`. Returns whether it existed.
    pub async fn unsubscribe(&self, symbol: &Symbol) -> Result<bool, CacheError> {
        let Some(entry) = self.books.write().remove(symbol) else {
            return Ok(false);
        };
        entry.cancel.cancel();
        let id = entry.subscription.lock().take();
        if let Some(id) = id {
            self.client.unsubscribe(entry.key.clone(), id).await?;
        }
        Ok(true)
    }

    /// Restart synchronization for `symbol`, e.g. after it was abandoned.
    pub fn resync(&self, symbol: &Symbol) -> bool {
        let Some(entry) = self.books.read().get(symbol).cloned() else {
            return false;
        };
        let restarted = match &mut *entry.state.lock() {
            BookState::Diff(sync) => {
                sync.reset();
                sync.start_buffering();
                true
            }
            BookState::Partial(_) => false,
        };
        if restarted {
            entry.resync.notify_one();
        }
        restarted
    }

    /// Immutable copy of the book, once it is consistent.
    #[must_use]
    pub fn snapshot(&self, symbol: &Symbol) -> Option<OrderBookSnapshot> {
        let entry = self.books.read().get(symbol).cloned()?;
        let state = entry.state.lock();
        state.snapshot()
    }

    /// Synchronization phase of a diff book.
    #[must_use]
    pub fn phase(&self, symbol: &Symbol) -> Option<SyncPhase> {
        let entry = self.books.read().get(symbol).cloned()?;
        let state = entry.state.lock();
        match &*state {
            BookState::Diff(sync) => Some(sync.phase()),
            BookState::Partial(_) => None,
        }
    }

    /// Cached symbols.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.books.read().keys().cloned().collect()
    }

    /// Receive a snapshot after every change to a consistent book.
    #[must_use]
    pub fn updates(&self) -> broadcast::Receiver<OrderBookSnapshot> {
        self.updates.subscribe()
    }

    /// Receive cache errors (abandoned books).
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<CacheError> {
        self.errors.subscribe()
    }
}

impl Drop for OrderBookCache {
    fn drop(&mut self) {
        for entry in self.books.read().values() {
            entry.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for OrderBookCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderBookCache")
            .field("symbols", &self.symbols())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn book_callback(
    entry: Arc<BookEntry>,
    updates: broadcast::Sender<OrderBookSnapshot>,
) -> EventCallback<DepthUpdate> {
    Arc::new(move |event: &StreamEvent<DepthUpdate>| -> Result<(), HandlerError> {
        if let Some(snapshot) = entry.on_update(&event.data) {
            let _ = updates.send(snapshot);
        }
        Ok(())
    })
}

// =============================================================================
// Resync Task
// =============================================================================

struct Resync {
    entry: Arc<BookEntry>,
    rest: Arc<dyn ExchangeRest>,
    settings: CacheSettings,
    updates: broadcast::Sender<OrderBookSnapshot>,
    errors: broadcast::Sender<CacheError>,
}

enum Attempt {
    Settled,
    Retry,
    Abandoned,
}

impl Resync {
    async fn run(self) {
        loop {
            tokio::select! {
                () = self.entry.cancel.cancelled() => return,
                () = self.entry.resync.notified() => {}
            }

            loop {
                match self.attempt().await {
                    None => return,
                    Some(Attempt::Settled | Attempt::Abandoned) => break,
                    Some(Attempt::Retry) => {
                        tokio::select! {
                            () = self.entry.cancel.cancelled() => return,
                            () = tokio::time::sleep(self.settings.resync_delay) => {}
                        }
                    }
                }
            }
        }
    }

    /// Wait until the stream has delivered an update to reconcile against.
    ///
    /// A snapshot fetched before the connection is live would predate
    /// every streamed update. Returns `false` when cancelled.
    async fn stream_live(&self) -> bool {
        loop {
            let waiting = match &*self.entry.state.lock() {
                BookState::Diff(sync) => {
                    sync.phase() == SyncPhase::Buffering && sync.buffered() == 0
                }
                BookState::Partial(_) => false,
            };
            if !waiting {
                return true;
            }
            tokio::select! {
                () = self.entry.cancel.cancelled() => return false,
                () = self.entry.buffered.notified() => {}
            }
        }
    }

    /// One snapshot fetch and reconciliation; `None` when cancelled.
    async fn attempt(&self) -> Option<Attempt> {
        if !self.stream_live().await {
            return None;
        }
        let symbol = self.entry.symbol();
        debug!(symbol = %symbol, "fetching order book snapshot");
        let fetched = tokio::select! {
            () = self.entry.cancel.cancelled() => return None,
            fetched = self.rest.order_book(symbol, self.settings.depth_snapshot_limit) => fetched,
        };

        let mut state = self.entry.state.lock();
        let BookState::Diff(sync) = &mut *state else {
            return Some(Attempt::Settled);
        };

        let failure = match fetched {
            Ok(snapshot) => match sync.on_snapshot(&snapshot) {
                Ok(phase) => {
                    if phase == SyncPhase::Synchronized {
                        metrics::record_resync(symbol.as_str(), ResyncOutcome::Reconciled);
                        if let Some(snapshot) = sync.snapshot() {
                            let _ = self.updates.send(snapshot);
                        }
                    }
                    info!(symbol = %symbol, phase = ?phase, "order book snapshot applied");
                    return Some(Attempt::Settled);
                }
                Err(desync) => desync.to_string(),
            },
            Err(error) => {
                sync.record_failure();
                error.to_string()
            }
        };

        metrics::record_resync(symbol.as_str(), ResyncOutcome::Failed);
        let attempts = sync.failures();
        if attempts >= self.settings.max_resync_attempts {
            sync.reset();
            drop(state);
            error!(symbol = %symbol, attempts, "order book abandoned");
            metrics::record_resync(symbol.as_str(), ResyncOutcome::Abandoned);
            let _ = self.errors.send(CacheError::ResyncExhausted {
                symbol: symbol.clone(),
                attempts,
            });
            return Some(Attempt::Abandoned);
        }

        warn!(symbol = %symbol, attempts, error = %failure, "order book resync failed, retrying");
        Some(Attempt::Retry)
    }
}
