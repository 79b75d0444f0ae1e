//! Candlestick Series
//!
//! A bounded, time-ordered window of candlesticks for one symbol and
//! interval. Live updates for the open candle replace it in place, a newer
//! open time appends, older updates are ignored.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market::{CandlestickInterval, Symbol};

/// One OHLCV candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candlestick {
    /// Trading pair.
    pub symbol: Symbol,
    /// Candle interval.
    pub interval: CandlestickInterval,
    /// Open time.
    pub open_time: DateTime<Utc>,
    /// Close time.
    pub close_time: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close (or last) price.
    pub close: Decimal,
    /// Base asset volume.
    pub volume: Decimal,
    /// Quote asset volume.
    pub quote_volume: Decimal,
    /// Number of trades.
    pub trade_count: u64,
    /// Taker buy base asset volume.
    pub taker_buy_base_volume: Decimal,
    /// Taker buy quote asset volume.
    pub taker_buy_quote_volume: Decimal,
    /// Whether the candle is closed.
    pub is_final: bool,
}

/// What [`CandlestickSeries::apply`] did with a candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesChange {
    /// Replaced the candle with the same open time.
    Replaced,
    /// Appended a newer candle.
    Appended,
    /// Older than the newest candle and not present; dropped.
    Ignored,
}

/// Bounded candlestick window.
#[derive(Debug, Clone)]
pub struct CandlestickSeries {
    capacity: usize,
    candles: VecDeque<Candlestick>,
}

impl CandlestickSeries {
    /// Create an empty series holding at most `capacity` candles.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            candles: VecDeque::with_capacity(capacity),
        }
    }

    /// Apply one live candle.
    pub fn apply(&mut self, candle: Candlestick) -> SeriesChange {
        let Some(last) = self.candles.back_mut() else {
            self.candles.push_back(candle);
            return SeriesChange::Appended;
        };

        if candle.open_time == last.open_time {
            *last = candle;
            return SeriesChange::Replaced;
        }

        if candle.open_time > last.open_time {
            self.candles.push_back(candle);
            while self.candles.len() > self.capacity {
                self.candles.pop_front();
            }
            return SeriesChange::Appended;
        }

        // A late update for a candle still in the window replaces it.
        if let Some(existing) = self
            .candles
            .iter_mut()
            .find(|c| c.open_time == candle.open_time)
        {
            *existing = candle;
            return SeriesChange::Replaced;
        }

        SeriesChange::Ignored
    }

    /// Merge historical candles underneath the live ones.
    ///
    /// Live candles win over history with the same open time.
    pub fn seed(&mut self, history: impl IntoIterator<Item = Candlestick>) {
        let live = std::mem::take(&mut self.candles);
        let mut history: Vec<Candlestick> = history.into_iter().collect();
        history.sort_by_key(|c| c.open_time);

        for candle in history {
            self.apply(candle);
        }
        for candle in live {
            self.apply(candle);
        }
    }

    /// Newest candle.
    #[must_use]
    pub fn latest(&self) -> Option<&Candlestick> {
        self.candles.back()
    }

    /// Copy of the window, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Candlestick> {
        self.candles.iter().cloned().collect()
    }

    /// Number of candles held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    /// Whether no candles are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Maximum number of candles held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
