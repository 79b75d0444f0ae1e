//! Stream Topics
//!
//! A topic is the exchange-defined name of one logical stream, such as
//! `btcusdt@trade` or `ethbtc@kline_1m`. A set of topics maps onto exactly
//! one connection URI: a single topic uses the raw endpoint
//! (`{base}/ws/{topic}`), several topics use the combined endpoint
//! (`{base}/stream?streams=a/b/c`) whose frames carry a `{stream, data}`
//! envelope.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::market::{CandlestickInterval, ListenKey, Symbol};

// =============================================================================
// Topic
// =============================================================================

/// Name of a single logical stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Topic carrying every symbol's rolling 24h statistics.
    pub const ALL_TICKERS: &'static str = "!ticker@arr";

    /// Wrap a raw topic name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw topic name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `{symbol}@trade`
    #[must_use]
    pub fn trade(symbol: &Symbol) -> Self {
        Self(format!("{}@trade", symbol.stream_name()))
    }

    /// `{symbol}@aggTrade`
    #[must_use]
    pub fn aggregate_trade(symbol: &Symbol) -> Self {
        Self(format!("{}@aggTrade", symbol.stream_name()))
    }

    /// `{symbol}@kline_{interval}`
    #[must_use]
    pub fn candlestick(symbol: &Symbol, interval: CandlestickInterval) -> Self {
        Self(format!("{}@kline_{interval}", symbol.stream_name()))
    }

    /// `{symbol}@depth` for the diff stream, `{symbol}@depth{levels}` for
    /// the partial book stream.
    #[must_use]
    pub fn depth(symbol: &Symbol, levels: Option<u16>) -> Self {
        match levels {
            Some(levels) => Self(format!("{}@depth{levels}", symbol.stream_name())),
            None => Self(format!("{}@depth", symbol.stream_name())),
        }
    }

    /// `{symbol}@ticker`
    #[must_use]
    pub fn ticker(symbol: &Symbol) -> Self {
        Self(format!("{}@ticker", symbol.stream_name()))
    }

    /// `!ticker@arr`
    #[must_use]
    pub fn all_tickers() -> Self {
        Self(Self::ALL_TICKERS.to_string())
    }

    /// User-data streams are named by their listen key.
    #[must_use]
    pub fn user_data(listen_key: &ListenKey) -> Self {
        Self(listen_key.as_str().to_string())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// Connection Target
// =============================================================================

/// The URI a connection attempt opens, derived from the topic set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    uri: String,
    topics: Vec<Topic>,
}

impl ConnectionTarget {
    /// Build the target for `topics` under `base_uri`.
    ///
    /// Returns `None` when there are no topics: an empty set has no URI.
    #[must_use]
    pub fn build(base_uri: &str, topics: &[Topic]) -> Option<Self> {
        let base = base_uri.trim_end_matches('/');
        let uri = match topics {
            [] => return None,
            [single] => format!("{base}/ws/{single}"),
            many => {
                let names: Vec<&str> = many.iter().map(Topic::as_str).collect();
                format!("{base}/stream?streams={}", names.join("/"))
            }
        };

        Some(Self {
            uri,
            topics: topics.to_vec(),
        })
    }

    /// The connection URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Topics this target was built from, in table order.
    #[must_use]
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Whether frames arrive wrapped in a `{stream, data}` envelope.
    #[must_use]
    pub const fn is_combined(&self) -> bool {
        self.topics.len() > 1
    }

    /// The only topic of a raw single-topic connection.
    #[must_use]
    pub fn single_topic(&self) -> Option<&Topic> {
        match self.topics.as_slice() {
            [single] => Some(single),
            _ => None,
        }
    }
}
