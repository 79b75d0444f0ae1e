//! Order Book
//!
//! Price-indexed bid/ask ladders keyed by exact decimal price. A level with
//! zero quantity removes that price. Readers never see the live ladders:
//! they get an [`OrderBookSnapshot`], an immutable copy taken after an
//! update has been fully applied.

mod sync;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market::Symbol;

pub use sync::{DepthSynchronizer, Desync, SyncOutcome, SyncPhase};

// =============================================================================
// Price Level
// =============================================================================

/// A price and the quantity resting at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Level price.
    pub price: Decimal,
    /// Resting quantity; zero means "remove".
    pub quantity: Decimal,
}

impl PriceLevel {
    /// Create a level.
    #[must_use]
    pub const fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Full book as returned by the REST depth endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    /// Update id the snapshot is consistent with.
    pub last_update_id: u64,
    /// Bid levels.
    pub bids: Vec<PriceLevel>,
    /// Ask levels.
    pub asks: Vec<PriceLevel>,
}

// =============================================================================
// Order Book
// =============================================================================

/// Mutable local order book for one symbol.
#[derive(Debug, Clone)]
pub struct OrderBook {
    symbol: Symbol,
    last_update_id: u64,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    updated_at: Option<DateTime<Utc>>,
}

impl OrderBook {
    /// Create an empty book.
    #[must_use]
    pub const fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            last_update_id: 0,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            updated_at: None,
        }
    }

    /// Create a book holding exactly the levels of a snapshot.
    #[must_use]
    pub fn from_snapshot(symbol: Symbol, snapshot: &DepthSnapshot) -> Self {
        let mut book = Self::new(symbol);
        book.replace(snapshot.last_update_id, &snapshot.bids, &snapshot.asks);
        book
    }

    /// Replace every level, as a partial book stream does.
    pub fn replace(&mut self, last_update_id: u64, bids: &[PriceLevel], asks: &[PriceLevel]) {
        self.bids.clear();
        self.asks.clear();
        self.apply(last_update_id, bids, asks);
    }

    /// Apply level changes and advance the update id.
    pub fn apply(&mut self, last_update_id: u64, bids: &[PriceLevel], asks: &[PriceLevel]) {
        apply_side(&mut self.bids, bids);
        apply_side(&mut self.asks, asks);
        self.last_update_id = last_update_id;
        self.updated_at = Some(Utc::now());
    }

    /// Trading pair.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Last update id folded into the book.
    #[must_use]
    pub const fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Highest bid.
    #[must_use]
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .iter()
            .next_back()
            .map(|(price, qty)| PriceLevel::new(*price, *qty))
    }

    /// Lowest ask.
    #[must_use]
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .iter()
            .next()
            .map(|(price, qty)| PriceLevel::new(*price, *qty))
    }

    /// Immutable copy of the current book.
    #[must_use]
    pub fn snapshot(&self) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: self.symbol.clone(),
            last_update_id: self.last_update_id,
            bids: self
                .bids
                .iter()
                .rev()
                .map(|(price, qty)| PriceLevel::new(*price, *qty))
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(price, qty)| PriceLevel::new(*price, *qty))
                .collect(),
            updated_at: self.updated_at,
        }
    }
}

fn apply_side(side: &mut BTreeMap<Decimal, Decimal>, levels: &[PriceLevel]) {
    for level in levels {
        if level.quantity.is_zero() {
            side.remove(&level.price);
        } else {
            side.insert(level.price, level.quantity);
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable copy of an order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    /// Trading pair.
    pub symbol: Symbol,
    /// Last update id folded into the copy.
    pub last_update_id: u64,
    /// Bids, best (highest) first.
    pub bids: Vec<PriceLevel>,
    /// Asks, best (lowest) first.
    pub asks: Vec<PriceLevel>,
    /// When the book was last changed.
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrderBookSnapshot {
    /// Highest bid.
    #[must_use]
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    /// Lowest ask.
    #[must_use]
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Best ask minus best bid.
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Midpoint of the best bid and ask.
    #[must_use]
    pub fn mid_price(&self) -> Option<Decimal> {
        Some((self.best_ask()?.price + self.best_bid()?.price) / Decimal::TWO)
    }
}
