//! Synchronizing Caches
//!
//! Local state kept consistent with the exchange by combining live streams
//! with REST data:
//!
//! - `OrderBookCache`: snapshot plus diff-depth sequencing, with bounded
//!   resynchronization on gaps (or whole partial books)
//! - `CandlestickCache`: REST history merged with live candles
//! - `StatisticsCache`: latest 24h statistics per symbol

mod candlestick;
mod order_book;
mod statistics;

pub use candlestick::CandlestickCache;
pub use order_book::OrderBookCache;
pub use statistics::StatisticsCache;

use crate::application::ports::RestError;
use crate::domain::market::Symbol;
use crate::infrastructure::binance::client::ClientError;

/// Cache errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Subscribing or unsubscribing the stream failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// REST request failed.
    #[error(transparent)]
    Rest(#[from] RestError),

    /// The order book could not be resynchronized within the budget.
    #[error("order book for {symbol} abandoned after {attempts} failed resyncs")]
    ResyncExhausted {
        /// Affected symbol.
        symbol: Symbol,
        /// Consecutive failures.
        attempts: u32,
    },

    /// The key is already cached.
    #[error("already cached: {0}")]
    AlreadySubscribed(String),
}
