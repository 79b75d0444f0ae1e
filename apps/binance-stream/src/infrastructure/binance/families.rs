//! Stream Families
//!
//! The concrete [`EventFamily`] implementations: topic naming and payload
//! decoding for trades, aggregate trades, candlesticks, depth, 24h
//! statistics and user data.

use std::fmt;

use chrono::{DateTime, Utc};

use super::client::{DecodeContext, EventFamily};
use super::codec::{CodecError, timestamp};
use super::messages::{
    AccountPositionMessage, AggregateTradeMessage, BalanceUpdateMessage, CandlestickMessage,
    DepthUpdateMessage, ExecutionReportMessage, ListStatusMessage, ListenKeyExpiredMessage,
    PartialDepthMessage, TickerMessage, TradeMessage,
};
use crate::domain::events::{
    AggregateTrade, CandlestickUpdate, DepthUpdate, DepthUpdateKind, StatisticsUpdate, Trade,
    UserDataEvent,
};
use crate::domain::market::{CandlestickInterval, ListenKey, Symbol};
use crate::domain::order_book::DepthSnapshot;
use crate::domain::topic::Topic;

/// Book depths offered by the partial book stream.
pub const PARTIAL_DEPTH_LEVELS: [u16; 3] = [5, 10, 20];

fn require_symbol(symbol: &Symbol) -> Result<(), String> {
    if symbol.is_empty() {
        Err("symbol cannot be empty".to_string())
    } else {
        Ok(())
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Candlestick subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandlestickKey {
    /// Trading pair.
    pub symbol: Symbol,
    /// Candle interval.
    pub interval: CandlestickInterval,
}

impl CandlestickKey {
    /// Create a key.
    #[must_use]
    pub const fn new(symbol: Symbol, interval: CandlestickInterval) -> Self {
        Self { symbol, interval }
    }
}

impl fmt::Display for CandlestickKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.symbol, self.interval)
    }
}

/// Depth subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepthKey {
    /// Trading pair.
    pub symbol: Symbol,
    /// Partial book depth; `None` selects the diff stream.
    pub levels: Option<u16>,
}

impl DepthKey {
    /// Diff depth stream.
    #[must_use]
    pub const fn diff(symbol: Symbol) -> Self {
        Self {
            symbol,
            levels: None,
        }
    }

    /// Partial book stream with `levels` per side.
    #[must_use]
    pub const fn partial(symbol: Symbol, levels: u16) -> Self {
        Self {
            symbol,
            levels: Some(levels),
        }
    }

    /// Whether this key selects the partial book stream.
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        self.levels.is_some()
    }
}

/// Statistics subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatisticsKey {
    /// One symbol.
    Symbol(Symbol),
    /// Every symbol on the exchange.
    All,
}

// =============================================================================
// Trades
// =============================================================================

/// `{symbol}@trade`.
#[derive(Debug)]
pub struct TradeFamily;

impl EventFamily for TradeFamily {
    type Key = Symbol;
    type Event = Trade;
    const NAME: &'static str = "trade";

    fn topic(key: &Symbol) -> Topic {
        Topic::trade(key)
    }

    fn validate(key: &Symbol) -> Result<(), String> {
        require_symbol(key)
    }

    fn decode(context: &DecodeContext<'_, Symbol>) -> Result<(DateTime<Utc>, Trade), CodecError> {
        let message: TradeMessage = context.codec.decode_event(context.payload, "trade")?;
        Ok((timestamp(message.event_time)?, message.into_domain()?))
    }
}

/// `{symbol}@aggTrade`.
#[derive(Debug)]
pub struct AggregateTradeFamily;

impl EventFamily for AggregateTradeFamily {
    type Key = Symbol;
    type Event = AggregateTrade;
    const NAME: &'static str = "aggTrade";

    fn topic(key: &Symbol) -> Topic {
        Topic::aggregate_trade(key)
    }

    fn validate(key: &Symbol) -> Result<(), String> {
        require_symbol(key)
    }

    fn decode(
        context: &DecodeContext<'_, Symbol>,
    ) -> Result<(DateTime<Utc>, AggregateTrade), CodecError> {
        let message: AggregateTradeMessage =
            context.codec.decode_event(context.payload, "aggTrade")?;
        Ok((timestamp(message.event_time)?, message.into_domain()?))
    }
}

// =============================================================================
// Candlesticks
// =============================================================================

/// `{symbol}@kline_{interval}`.
#[derive(Debug)]
pub struct CandlestickFamily;

impl EventFamily for CandlestickFamily {
    type Key = CandlestickKey;
    type Event = CandlestickUpdate;
    const NAME: &'static str = "kline";

    fn topic(key: &CandlestickKey) -> Topic {
        Topic::candlestick(&key.symbol, key.interval)
    }

    fn validate(key: &CandlestickKey) -> Result<(), String> {
        require_symbol(&key.symbol)
    }

    fn decode(
        context: &DecodeContext<'_, CandlestickKey>,
    ) -> Result<(DateTime<Utc>, CandlestickUpdate), CodecError> {
        let message: CandlestickMessage = context.codec.decode_event(context.payload, "kline")?;
        Ok((timestamp(message.event_time)?, message.into_domain()?))
    }
}

// =============================================================================
// Depth
// =============================================================================

/// `{symbol}@depth` (diff) or `{symbol}@depth{levels}` (partial book).
///
/// One subscription per key: the order book cache owns each depth stream.
#[derive(Debug)]
pub struct DepthFamily;

impl EventFamily for DepthFamily {
    type Key = DepthKey;
    type Event = DepthUpdate;
    const NAME: &'static str = "depth";
    const UNIQUE_PER_KEY: bool = true;

    fn topic(key: &DepthKey) -> Topic {
        Topic::depth(&key.symbol, key.levels)
    }

    fn validate(key: &DepthKey) -> Result<(), String> {
        require_symbol(&key.symbol)?;
        match key.levels {
            Some(levels) if !PARTIAL_DEPTH_LEVELS.contains(&levels) => Err(format!(
                "partial depth must be one of {PARTIAL_DEPTH_LEVELS:?}, got {levels}"
            )),
            _ => Ok(()),
        }
    }

    fn decode(
        context: &DecodeContext<'_, DepthKey>,
    ) -> Result<(DateTime<Utc>, DepthUpdate), CodecError> {
        if context.key.is_partial() {
            // Partial books carry no event time or symbol.
            let message: PartialDepthMessage = context.codec.decode(context.payload)?;
            let snapshot = DepthSnapshot::from(message);
            let update = DepthUpdate {
                symbol: context.key.symbol.clone(),
                kind: DepthUpdateKind::Partial,
                first_update_id: snapshot.last_update_id,
                last_update_id: snapshot.last_update_id,
                bids: snapshot.bids,
                asks: snapshot.asks,
            };
            return Ok((context.now(), update));
        }

        let message: DepthUpdateMessage =
            context.codec.decode_event(context.payload, "depthUpdate")?;
        let event_time = timestamp(message.event_time)?;
        let symbol = Symbol::new(&message.symbol);
        let first_update_id = message.first_update_id;
        let last_update_id = message.last_update_id;
        let (bids, asks) = message.into_levels();
        Ok((
            event_time,
            DepthUpdate {
                symbol,
                kind: DepthUpdateKind::Diff,
                first_update_id,
                last_update_id,
                bids,
                asks,
            },
        ))
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// `{symbol}@ticker` or `!ticker@arr`.
#[derive(Debug)]
pub struct StatisticsFamily;

impl EventFamily for StatisticsFamily {
    type Key = StatisticsKey;
    type Event = StatisticsUpdate;
    const NAME: &'static str = "ticker";

    fn topic(key: &StatisticsKey) -> Topic {
        match key {
            StatisticsKey::Symbol(symbol) => Topic::ticker(symbol),
            StatisticsKey::All => Topic::all_tickers(),
        }
    }

    fn validate(key: &StatisticsKey) -> Result<(), String> {
        match key {
            StatisticsKey::Symbol(symbol) => require_symbol(symbol),
            StatisticsKey::All => Ok(()),
        }
    }

    fn decode(
        context: &DecodeContext<'_, StatisticsKey>,
    ) -> Result<(DateTime<Utc>, StatisticsUpdate), CodecError> {
        let messages: Vec<TickerMessage> = match context.key {
            StatisticsKey::Symbol(_) => {
                vec![context.codec.decode_event(context.payload, "24hrTicker")?]
            }
            StatisticsKey::All => context.codec.decode(context.payload)?,
        };

        let event_time = match messages.iter().map(|m| m.event_time).max() {
            Some(millis) => timestamp(millis)?,
            None => context.now(),
        };
        let statistics = messages
            .into_iter()
            .map(TickerMessage::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((event_time, StatisticsUpdate { statistics }))
    }
}

// =============================================================================
// User Data
// =============================================================================

/// User-data stream; the topic is the listen key.
#[derive(Debug)]
pub struct UserDataFamily;

impl EventFamily for UserDataFamily {
    type Key = ListenKey;
    type Event = UserDataEvent;
    const NAME: &'static str = "userData";
    const UNIQUE_PER_KEY: bool = true;

    fn topic(key: &ListenKey) -> Topic {
        Topic::user_data(key)
    }

    fn validate(key: &ListenKey) -> Result<(), String> {
        if key.is_empty() {
            Err("listen key cannot be empty".to_string())
        } else {
            Ok(())
        }
    }

    fn decode(
        context: &DecodeContext<'_, ListenKey>,
    ) -> Result<(DateTime<Utc>, UserDataEvent), CodecError> {
        let codec = context.codec;
        let payload = context.payload;
        match codec.event_type(payload)?.as_str() {
            "outboundAccountPosition" => {
                let m: AccountPositionMessage = codec.decode(payload)?;
                Ok((timestamp(m.event_time)?, UserDataEvent::AccountUpdate(m.into_domain()?)))
            }
            "balanceUpdate" => {
                let m: BalanceUpdateMessage = codec.decode(payload)?;
                Ok((timestamp(m.event_time)?, UserDataEvent::BalanceUpdate(m.into_domain()?)))
            }
            "executionReport" => {
                let m: ExecutionReportMessage = codec.decode(payload)?;
                Ok((
                    timestamp(m.event_time)?,
                    UserDataEvent::OrderUpdate(Box::new(m.into_domain()?)),
                ))
            }
            "listStatus" => {
                let m: ListStatusMessage = codec.decode(payload)?;
                Ok((timestamp(m.event_time)?, UserDataEvent::ListStatus(m.into_domain()?)))
            }
            "listenKeyExpired" => {
                let m: ListenKeyExpiredMessage = codec.decode(payload)?;
                Ok((timestamp(m.event_time)?, UserDataEvent::ListenKeyExpired))
            }
            other => Err(CodecError::UnexpectedEventType {
                expected: "user data event",
                actual: other.to_string(),
            }),
        }
    }
}
