//! Subscription Table
//!
//! Maps each topic to the callbacks registered for it.
//!
//! # Design
//!
//! The table tracks:
//! - Which topics are part of the next connection target
//! - The callbacks for each topic, in registration order
//! - Whether a topic is pinned by a key-only subscription
//!
//! A callback is identified by reference (`Arc::ptr_eq`): registering the
//! same callback twice for a topic is a no-op. A topic stays in the table
//! while it has callbacks or is pinned; removing the last callback of an
//! unpinned topic removes the topic.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::topic::Topic;

// =============================================================================
// Entry
// =============================================================================

#[derive(Debug)]
struct TopicEntry<T: ?Sized> {
    callbacks: Vec<Arc<T>>,
    pinned: bool,
}

impl<T: ?Sized> TopicEntry<T> {
    const fn new() -> Self {
        Self {
            callbacks: Vec::new(),
            pinned: false,
        }
    }

    fn is_vacant(&self) -> bool {
        self.callbacks.is_empty() && !self.pinned
    }
}

// =============================================================================
// Subscription Table
// =============================================================================

/// Topic to callback table.
///
/// Not synchronized; owners wrap it in a lock.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use binance_stream::domain::subscription::SubscriptionTable;
/// use binance_stream::domain::topic::Topic;
///
/// let mut table: SubscriptionTable<dyn Fn(&str) + Send + Sync> = SubscriptionTable::new();
/// let callback: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(|_: &str| {});
///
/// assert!(table.add(Topic::new("btcusdt@trade"), Arc::clone(&callback)));
/// // Same callback again: no-op
/// assert!(!table.add(Topic::new("btcusdt@trade"), Arc::clone(&callback)));
///
/// assert!(table.remove(&Topic::new("btcusdt@trade"), &callback));
/// assert!(table.is_empty());
/// ```
#[derive(Debug)]
pub struct SubscriptionTable<T: ?Sized> {
    entries: BTreeMap<Topic, TopicEntry<T>>,
}

impl<T: ?Sized> Default for SubscriptionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> SubscriptionTable<T> {
    /// Create an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Pin a topic without a callback.
    ///
    /// Returns `true` if the topic was not in the table before.
    pub fn pin(&mut self, topic: Topic) -> bool {
        let mut added = false;
        let entry = self.entries.entry(topic).or_insert_with(|| {
            added = true;
            TopicEntry::new()
        });
        entry.pinned = true;
        added
    }

    /// Release a key-only pin.
    ///
    /// The topic is removed when it has no callbacks left. Returns `true`
    /// if the topic was removed.
    pub fn unpin(&mut self, topic: &Topic) -> bool {
        let Some(entry) = self.entries.get_mut(topic) else {
            return false;
        };
        entry.pinned = false;
        if entry.is_vacant() {
            self.entries.remove(topic);
            return true;
        }
        false
    }

    /// Register a callback for a topic.
    ///
    /// Returns `false` if the same callback is already registered.
    pub fn add(&mut self, topic: Topic, callback: Arc<T>) -> bool {
        let entry = self.entries.entry(topic).or_insert_with(TopicEntry::new);
        if entry.callbacks.iter().any(|c| Arc::ptr_eq(c, &callback)) {
            return false;
        }
        entry.callbacks.push(callback);
        true
    }

    /// Remove a callback from a topic.
    ///
    /// Returns `true` if the callback was registered.
    pub fn remove(&mut self, topic: &Topic, callback: &Arc<T>) -> bool {
        let Some(entry) = self.entries.get_mut(topic) else {
            return false;
        };
        let before = entry.callbacks.len();
        entry.callbacks.retain(|c| !Arc::ptr_eq(c, callback));
        let removed = entry.callbacks.len() != before;

        if entry.is_vacant() {
            self.entries.remove(topic);
        }
        removed
    }

    /// Callbacks registered for a topic, in registration order.
    #[must_use]
    pub fn callbacks(&self, topic: &Topic) -> Option<&[Arc<T>]> {
        self.entries.get(topic).map(|e| e.callbacks.as_slice())
    }

    /// Whether the topic is part of the table.
    #[must_use]
    pub fn contains(&self, topic: &Topic) -> bool {
        self.entries.contains_key(topic)
    }

    /// All topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.entries.keys().cloned().collect()
    }

    /// Number of topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no topics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every topic and callback.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Get table statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            topic_count: self.entries.len(),
            callback_count: self.entries.values().map(|e| e.callbacks.len()).sum(),
            pinned_count: self.entries.values().filter(|e| e.pinned).count(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for a subscription table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of topics in the table.
    pub topic_count: usize,
    /// Number of registered callbacks across all topics.
    pub callback_count: usize,
    /// Number of topics pinned without a callback.
    pub pinned_count: usize,
}
