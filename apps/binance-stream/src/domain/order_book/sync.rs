//! Depth Synchronizer
//!
//! Reconciles a REST snapshot with the diff-depth stream:
//!
//! 1. Updates arriving before the snapshot are buffered.
//! 2. Once the snapshot (last update id `S`) is in, buffered updates are
//!    replayed in `last_update_id` order. Updates with `u <= S` are stale.
//! 3. The first applied update must bridge the snapshot: `U <= S + 1 <= u`.
//!    Until an update newer than `S` shows up, the book waits for it.
//! 4. After that every update must start exactly where the previous one
//!    ended (`U == previous u + 1`).
//!
//! Any violation is a [`Desync`]: the book is dropped and buffering starts
//! again until a fresh snapshot arrives.

use super::{DepthSnapshot, OrderBook, OrderBookSnapshot};
use crate::domain::events::DepthUpdate;
use crate::domain::market::Symbol;

/// Where the synchronizer is in the snapshot/stream reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    /// Not following the stream.
    Uninitialized,
    /// Collecting updates until a snapshot bridges them.
    Buffering,
    /// Applying updates to a consistent book.
    Synchronized,
}

/// Result of feeding an update to the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Held until a snapshot arrives.
    Buffered,
    /// Already covered by the book, or not following the stream.
    Ignored,
    /// Folded into the book.
    Applied,
}

/// Sequencing failure; a new snapshot is required.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Desync {
    /// The first update newer than the snapshot starts past it.
    #[error(
        "update {first_update_id}..={last_update_id} does not bridge snapshot {snapshot_id}"
    )]
    NoBridge {
        /// Snapshot last update id.
        snapshot_id: u64,
        /// First id of the offending update.
        first_update_id: u64,
        /// Last id of the offending update.
        last_update_id: u64,
    },
    /// An update does not start right after the previous one.
    #[error("sequence gap: expected update {expected}, got {first_update_id}")]
    Gap {
        /// Id the next update had to start at.
        expected: u64,
        /// First id of the offending update.
        first_update_id: u64,
    },
}

/// Snapshot plus diff-stream sequencing for one symbol.
#[derive(Debug)]
pub struct DepthSynchronizer {
    symbol: Symbol,
    phase: SyncPhase,
    buffer: Vec<DepthUpdate>,
    book: Option<OrderBook>,
    bridged: bool,
    failures: u32,
}

impl DepthSynchronizer {
    /// Create an uninitialized synchronizer.
    #[must_use]
    pub const fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            phase: SyncPhase::Uninitialized,
            buffer: Vec::new(),
            book: None,
            bridged: false,
            failures: 0,
        }
    }

    /// Start (or restart) buffering, dropping any local book.
    pub fn start_buffering(&mut self) {
        self.phase = SyncPhase::Buffering;
        self.book = None;
        self.bridged = false;
    }

    /// Stop following the stream and drop all state.
    pub fn reset(&mut self) {
        self.phase = SyncPhase::Uninitialized;
        self.buffer.clear();
        self.book = None;
        self.bridged = false;
        self.failures = 0;
    }

    /// Feed one diff update.
    pub fn on_update(&mut self, update: &DepthUpdate) -> Result<SyncOutcome, Desync> {
        match self.phase {
            SyncPhase::Uninitialized => Ok(SyncOutcome::Ignored),
            SyncPhase::Buffering if self.book.is_none() => {
                self.buffer.push(update.clone());
                Ok(SyncOutcome::Buffered)
            }
            SyncPhase::Buffering | SyncPhase::Synchronized => {
                self.apply(update).inspect_err(|_| {
                    self.start_buffering();
                    self.buffer.push(update.clone());
                })
            }
        }
    }

    /// Reconcile a freshly fetched snapshot with the buffered updates.
    ///
    /// Returns the resulting phase: [`SyncPhase::Synchronized`] once an
    /// update bridged the snapshot, [`SyncPhase::Buffering`] while the book
    /// waits for the first newer update.
    pub fn on_snapshot(&mut self, snapshot: &DepthSnapshot) -> Result<SyncPhase, Desync> {
        self.phase = SyncPhase::Buffering;
        self.book = Some(OrderBook::from_snapshot(self.symbol.clone(), snapshot));
        self.bridged = false;

        let mut pending = std::mem::take(&mut self.buffer);
        pending.sort_by_key(|u| u.last_update_id);

        let mut replay = pending.into_iter();
        for update in replay.by_ref() {
            if let Err(desync) = self.apply(&update) {
                // Keep everything from the offending update on; a later
                // snapshot may still bridge it.
                self.start_buffering();
                self.buffer.push(update);
                self.buffer.extend(replay);
                return Err(desync);
            }
        }

        Ok(self.phase)
    }

    /// Record a failed resynchronization attempt (for example a REST error).
    pub const fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// Consecutive failures since the book was last bridged.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Number of buffered updates.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The book, once synchronized.
    #[must_use]
    pub fn book(&self) -> Option<&OrderBook> {
        match self.phase {
            SyncPhase::Synchronized => self.book.as_ref(),
            _ => None,
        }
    }

    /// Immutable copy of the book, once synchronized.
    #[must_use]
    pub fn snapshot(&self) -> Option<OrderBookSnapshot> {
        self.book().map(OrderBook::snapshot)
    }

    fn apply(&mut self, update: &DepthUpdate) -> Result<SyncOutcome, Desync> {
        let Some(book) = self.book.as_mut() else {
            self.buffer.push(update.clone());
            return Ok(SyncOutcome::Buffered);
        };

        let current = book.last_update_id();
        if update.last_update_id <= current {
            return Ok(SyncOutcome::Ignored);
        }

        if self.bridged {
            if update.first_update_id != current + 1 {
                self.failures = self.failures.saturating_add(1);
                return Err(Desync::Gap {
                    expected: current + 1,
                    first_update_id: update.first_update_id,
                });
            }
        } else {
            // u > S holds here, so U <= S + 1 is the whole bridge check.
            if update.first_update_id > current + 1 {
                self.failures = self.failures.saturating_add(1);
                return Err(Desync::NoBridge {
                    snapshot_id: current,
                    first_update_id: update.first_update_id,
                    last_update_id: update.last_update_id,
                });
            }
            self.bridged = true;
            self.phase = SyncPhase::Synchronized;
            self.failures = 0;
        }

        book.apply(update.last_update_id, &update.bids, &update.asks);
        Ok(SyncOutcome::Applied)
    }
}
