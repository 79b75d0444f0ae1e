//! Statistics Cache
//!
//! Latest rolling 24h statistics per symbol, fed by per-symbol tickers or
//! the all-symbols array stream.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::CacheError;
use crate::domain::events::{StatisticsUpdate, SymbolStatistics};
use crate::domain::market::Symbol;
use crate::infrastructure::binance::client::{EventSubscriber, StreamEvent, SubscriptionId};
use crate::infrastructure::binance::families::{StatisticsFamily, StatisticsKey};
use crate::infrastructure::binance::multiplexer::HandlerError;

type Table = Arc<RwLock<HashMap<Symbol, SymbolStatistics>>>;

/// Latest statistics per symbol.
pub struct StatisticsCache {
    client: Arc<dyn EventSubscriber<StatisticsFamily>>,
    table: Table,
    subscriptions: RwLock<HashMap<StatisticsKey, SubscriptionId>>,
}

impl StatisticsCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(client: Arc<dyn EventSubscriber<StatisticsFamily>>) -> Self {
        Self {
            client,
            table: Arc::default(),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Follow statistics for one symbol or, with [`StatisticsKey::All`], every symbol.
    pub async fn subscribe(&self, key: StatisticsKey) -> Result<(), CacheError> {
        if self.subscriptions.read().contains_key(&key) {
            return Err(CacheError::AlreadySubscribed(format!("{key:?}")));
        }

        let table = Arc::clone(&self.table);
        let id = self
            .client
            .subscribe(
                key.clone(),
                Some(Arc::new(
                    move |event: &StreamEvent<StatisticsUpdate>| -> Result<(), HandlerError> {
                        let mut table = table.write();
                        for statistics in &event.data.statistics {
                            table.insert(statistics.symbol.clone(), statistics.clone());
                        }
                        Ok(())
                    },
                )),
            )
            .await?;
        self.subscriptions.write().insert(key, id);
        Ok(())
    }

    /// Stop following `key`. Cached values are kept.
    pub async fn unsubscribe(&self, key: &StatisticsKey) -> Result<bool, CacheError> {
        let Some(id) = self.subscriptions.write().remove(key) else {
            return Ok(false);
        };
        self.client.unsubscribe(key.clone(), id).await?;
        Ok(true)
    }

    /// Latest statistics for `symbol`.
    #[must_use]
    pub fn get(&self, symbol: &Symbol) -> Option<SymbolStatistics> {
        self.table.read().get(symbol).cloned()
    }

    /// Latest statistics for every symbol seen.
    #[must_use]
    pub fn all(&self) -> Vec<SymbolStatistics> {
        let mut all: Vec<SymbolStatistics> = self.table.read().values().cloned().collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }
}

impl std::fmt::Debug for StatisticsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsCache")
            .field("symbols", &self.table.read().len())
            .finish_non_exhaustive()
    }
}
