//! Binance Message Types
//!
//! Wire format types for Binance stream payloads and the REST responses the
//! runtime consumes. Field names follow the exchange's single-letter keys;
//! prices and quantities arrive as decimal strings.
//!
//! # Stream Payloads
//!
//! - `trade`, `aggTrade`: individual and aggregated trades
//! - `kline`: candlestick updates
//! - `depthUpdate`: diff depth; partial depth has no event type
//! - `24hrTicker`: rolling window statistics (single or array)
//! - `outboundAccountPosition`, `balanceUpdate`, `executionReport`,
//!   `listStatus`, `listenKeyExpired`: user data
//!
//! # References
//!
//! - [WebSocket Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams)
//! - [User Data Streams](https://developers.binance.com/docs/binance-spot-api-docs/user-data-stream)

use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::IgnoredAny;

use super::codec::{CodecError, timestamp};
use crate::domain::candlestick::Candlestick;
use crate::domain::events::{
    AccountUpdate, AggregateTrade, AssetBalance, BalanceUpdate, CandlestickUpdate, ListStatus,
    OrderSide, OrderUpdate, SymbolStatistics, Trade,
};
use crate::domain::market::{CandlestickInterval, ListenKey, Symbol};
use crate::domain::order_book::{DepthSnapshot, PriceLevel};

// =============================================================================
// Shared
// =============================================================================

/// `["price","quantity"]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PriceLevelMessage(
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
);

impl From<PriceLevelMessage> for PriceLevel {
    fn from(level: PriceLevelMessage) -> Self {
        Self::new(level.0, level.1)
    }
}

fn levels(levels: Vec<PriceLevelMessage>) -> Vec<PriceLevel> {
    levels.into_iter().map(PriceLevel::from).collect()
}

fn trade_id(id: i64) -> Option<u64> {
    u64::try_from(id).ok()
}

// =============================================================================
// Trades
// =============================================================================

/// `trade` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeMessage {
    /// Event time (epoch millis).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Trade ID.
    #[serde(rename = "t")]
    pub trade_id: u64,
    /// Price.
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    /// Trade time (epoch millis).
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Buyer is the market maker.
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl TradeMessage {
    /// Convert to the domain trade.
    pub fn into_domain(self) -> Result<Trade, CodecError> {
        Ok(Trade {
            symbol: Symbol::new(self.symbol),
            trade_id: self.trade_id,
            price: self.price,
            quantity: self.quantity,
            trade_time: timestamp(self.trade_time)?,
            is_buyer_maker: self.is_buyer_maker,
        })
    }
}

/// `aggTrade` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateTradeMessage {
    /// Event time (epoch millis).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Aggregate trade ID.
    #[serde(rename = "a")]
    pub aggregate_trade_id: u64,
    /// Price.
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    /// First trade ID.
    #[serde(rename = "f")]
    pub first_trade_id: u64,
    /// Last trade ID.
    #[serde(rename = "l")]
    pub last_trade_id: u64,
    /// Trade time (epoch millis).
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Buyer is the market maker.
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl AggregateTradeMessage {
    /// Convert to the domain aggregate trade.
    pub fn into_domain(self) -> Result<AggregateTrade, CodecError> {
        Ok(AggregateTrade {
            symbol: Symbol::new(self.symbol),
            aggregate_trade_id: self.aggregate_trade_id,
            price: self.price,
            quantity: self.quantity,
            first_trade_id: self.first_trade_id,
            last_trade_id: self.last_trade_id,
            trade_time: timestamp(self.trade_time)?,
            is_buyer_maker: self.is_buyer_maker,
        })
    }
}

// =============================================================================
// Candlesticks
// =============================================================================

/// `kline` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CandlestickMessage {
    /// Event time (epoch millis).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Candle data.
    #[serde(rename = "k")]
    pub candle: CandleMessage,
}

/// Candle data inside a `kline` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CandleMessage {
    /// Open time (epoch millis).
    #[serde(rename = "t")]
    pub open_time: i64,
    /// Close time (epoch millis).
    #[serde(rename = "T")]
    pub close_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Interval.
    #[serde(rename = "i")]
    pub interval: CandlestickInterval,
    /// First trade ID (-1 without trades).
    #[serde(rename = "f")]
    pub first_trade_id: i64,
    /// Last trade ID (-1 without trades).
    #[serde(rename = "L")]
    pub last_trade_id: i64,
    /// Open price.
    #[serde(rename = "o", with = "rust_decimal::serde::str")]
    pub open: Decimal,
    /// Close price.
    #[serde(rename = "c", with = "rust_decimal::serde::str")]
    pub close: Decimal,
    /// High price.
    #[serde(rename = "h", with = "rust_decimal::serde::str")]
    pub high: Decimal,
    /// Low price.
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub low: Decimal,
    /// Base asset volume.
    #[serde(rename = "v", with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    /// Number of trades.
    #[serde(rename = "n")]
    pub trade_count: u64,
    /// Whether the candle is closed.
    #[serde(rename = "x")]
    pub is_final: bool,
    /// Quote asset volume.
    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub quote_volume: Decimal,
    /// Taker buy base asset volume.
    #[serde(rename = "V", with = "rust_decimal::serde::str")]
    pub taker_buy_base_volume: Decimal,
    /// Taker buy quote asset volume.
    #[serde(rename = "Q", with = "rust_decimal::serde::str")]
    pub taker_buy_quote_volume: Decimal,
}

impl CandlestickMessage {
    /// Convert to the domain candlestick update.
    pub fn into_domain(self) -> Result<CandlestickUpdate, CodecError> {
        let k = self.candle;
        Ok(CandlestickUpdate {
            first_trade_id: trade_id(k.first_trade_id),
            last_trade_id: trade_id(k.last_trade_id),
            candlestick: Candlestick {
                symbol: Symbol::new(k.symbol),
                interval: k.interval,
                open_time: timestamp(k.open_time)?,
                close_time: timestamp(k.close_time)?,
                open: k.open,
                high: k.high,
                low: k.low,
                close: k.close,
                volume: k.volume,
                quote_volume: k.quote_volume,
                trade_count: k.trade_count,
                taker_buy_base_volume: k.taker_buy_base_volume,
                taker_buy_quote_volume: k.taker_buy_quote_volume,
                is_final: k.is_final,
            },
        })
    }
}

/// One row of the REST `klines` response.
///
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume,
/// trades, takerBuyBase, takerBuyQuote, ignore]`
#[derive(Debug, Clone, Deserialize)]
pub struct KlineRow(
    pub i64,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    pub i64,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    pub u64,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    IgnoredAny,
);

impl KlineRow {
    /// Convert to a closed-or-open candlestick; only the newest row can be open.
    pub fn into_domain(
        self,
        symbol: &Symbol,
        interval: CandlestickInterval,
        is_final: bool,
    ) -> Result<Candlestick, CodecError> {
        Ok(Candlestick {
            symbol: symbol.clone(),
            interval,
            open_time: timestamp(self.0)?,
            open: self.1,
            high: self.2,
            low: self.3,
            close: self.4,
            volume: self.5,
            close_time: timestamp(self.6)?,
            quote_volume: self.7,
            trade_count: self.8,
            taker_buy_base_volume: self.9,
            taker_buy_quote_volume: self.10,
            is_final,
        })
    }
}

// =============================================================================
// Depth
// =============================================================================

/// `depthUpdate` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdateMessage {
    /// Event time (epoch millis).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// First update ID in event.
    #[serde(rename = "U")]
    pub first_update_id: u64,
    /// Final update ID in event.
    #[serde(rename = "u")]
    pub last_update_id: u64,
    /// Bids to update.
    #[serde(rename = "b")]
    pub bids: Vec<PriceLevelMessage>,
    /// Asks to update.
    #[serde(rename = "a")]
    pub asks: Vec<PriceLevelMessage>,
}

/// Partial book stream payload and REST `depth` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialDepthMessage {
    /// Book update ID the levels are consistent with.
    pub last_update_id: u64,
    /// Bid levels, best first.
    pub bids: Vec<PriceLevelMessage>,
    /// Ask levels, best first.
    pub asks: Vec<PriceLevelMessage>,
}

impl From<PartialDepthMessage> for DepthSnapshot {
    fn from(message: PartialDepthMessage) -> Self {
        Self {
            last_update_id: message.last_update_id,
            bids: levels(message.bids),
            asks: levels(message.asks),
        }
    }
}

impl DepthUpdateMessage {
    /// Bid and ask levels in domain form.
    #[must_use]
    pub fn into_levels(self) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        (levels(self.bids), levels(self.asks))
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// `24hrTicker` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerMessage {
    /// Event time (epoch millis).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Price change.
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price_change: Decimal,
    /// Price change percent.
    #[serde(rename = "P", with = "rust_decimal::serde::str")]
    pub price_change_percent: Decimal,
    /// Weighted average price.
    #[serde(rename = "w", with = "rust_decimal::serde::str")]
    pub weighted_average_price: Decimal,
    /// Previous day's close price.
    #[serde(rename = "x", with = "rust_decimal::serde::str")]
    pub previous_close_price: Decimal,
    /// Last price.
    #[serde(rename = "c", with = "rust_decimal::serde::str")]
    pub last_price: Decimal,
    /// Last quantity.
    #[serde(rename = "Q", with = "rust_decimal::serde::str")]
    pub last_quantity: Decimal,
    /// Best bid price.
    #[serde(rename = "b", with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    /// Best bid quantity.
    #[serde(rename = "B", with = "rust_decimal::serde::str")]
    pub bid_quantity: Decimal,
    /// Best ask price.
    #[serde(rename = "a", with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
    /// Best ask quantity.
    #[serde(rename = "A", with = "rust_decimal::serde::str")]
    pub ask_quantity: Decimal,
    /// Open price.
    #[serde(rename = "o", with = "rust_decimal::serde::str")]
    pub open_price: Decimal,
    /// High price.
    #[serde(rename = "h", with = "rust_decimal::serde::str")]
    pub high_price: Decimal,
    /// Low price.
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub low_price: Decimal,
    /// Base asset volume.
    #[serde(rename = "v", with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    /// Quote asset volume.
    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub quote_volume: Decimal,
    /// Window open time (epoch millis).
    #[serde(rename = "O")]
    pub open_time: i64,
    /// Window close time (epoch millis).
    #[serde(rename = "C")]
    pub close_time: i64,
    /// First trade ID.
    #[serde(rename = "F")]
    pub first_trade_id: i64,
    /// Last trade ID.
    #[serde(rename = "L")]
    pub last_trade_id: i64,
    /// Number of trades.
    #[serde(rename = "n")]
    pub trade_count: u64,
}

impl TickerMessage {
    /// Convert to domain statistics.
    pub fn into_domain(self) -> Result<SymbolStatistics, CodecError> {
        Ok(SymbolStatistics {
            symbol: Symbol::new(self.symbol),
            price_change: self.price_change,
            price_change_percent: self.price_change_percent,
            weighted_average_price: self.weighted_average_price,
            previous_close_price: self.previous_close_price,
            last_price: self.last_price,
            last_quantity: self.last_quantity,
            bid_price: self.bid_price,
            bid_quantity: self.bid_quantity,
            ask_price: self.ask_price,
            ask_quantity: self.ask_quantity,
            open_price: self.open_price,
            high_price: self.high_price,
            low_price: self.low_price,
            volume: self.volume,
            quote_volume: self.quote_volume,
            open_time: timestamp(self.open_time)?,
            close_time: timestamp(self.close_time)?,
            first_trade_id: self.first_trade_id,
            last_trade_id: self.last_trade_id,
            trade_count: self.trade_count,
        })
    }
}

// =============================================================================
// User Data
// =============================================================================

/// Balance entry in `outboundAccountPosition`.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceMessage {
    /// Asset.
    #[serde(rename = "a")]
    pub asset: String,
    /// Free amount.
    #[serde(rename = "f", with = "rust_decimal::serde::str")]
    pub free: Decimal,
    /// Locked amount.
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub locked: Decimal,
}

/// `outboundAccountPosition` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountPositionMessage {
    /// Event time (epoch millis).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Time of last account update (epoch millis).
    #[serde(rename = "u")]
    pub last_update_time: i64,
    /// Changed balances.
    #[serde(rename = "B")]
    pub balances: Vec<BalanceMessage>,
}

impl AccountPositionMessage {
    /// Convert to the domain account update.
    pub fn into_domain(self) -> Result<AccountUpdate, CodecError> {
        Ok(AccountUpdate {
            last_update_time: timestamp(self.last_update_time)?,
            balances: self
                .balances
                .into_iter()
                .map(|b| AssetBalance {
                    asset: b.asset,
                    free: b.free,
                    locked: b.locked,
                })
                .collect(),
        })
    }
}

/// `balanceUpdate` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceUpdateMessage {
    /// Event time (epoch millis).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Asset.
    #[serde(rename = "a")]
    pub asset: String,
    /// Balance delta.
    #[serde(rename = "d", with = "rust_decimal::serde::str")]
    pub delta: Decimal,
    /// Clear time (epoch millis).
    #[serde(rename = "T")]
    pub clear_time: i64,
}

impl BalanceUpdateMessage {
    /// Convert to the domain balance update.
    pub fn into_domain(self) -> Result<BalanceUpdate, CodecError> {
        Ok(BalanceUpdate {
            asset: self.asset,
            delta: self.delta,
            clear_time: timestamp(self.clear_time)?,
        })
    }
}

/// `executionReport` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionReportMessage {
    /// Event time (epoch millis).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Client order ID.
    #[serde(rename = "c")]
    pub client_order_id: String,
    /// Side.
    #[serde(rename = "S")]
    pub side: OrderSide,
    /// Order type.
    #[serde(rename = "o")]
    pub order_type: String,
    /// Time in force.
    #[serde(rename = "f")]
    pub time_in_force: String,
    /// Order quantity.
    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    /// Order price.
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Current execution type.
    #[serde(rename = "x")]
    pub execution_type: String,
    /// Current order status.
    #[serde(rename = "X")]
    pub order_status: String,
    /// Reject reason.
    #[serde(rename = "r")]
    pub reject_reason: String,
    /// Order ID.
    #[serde(rename = "i")]
    pub order_id: u64,
    /// Last executed quantity.
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub last_executed_quantity: Decimal,
    /// Cumulative filled quantity.
    #[serde(rename = "z", with = "rust_decimal::serde::str")]
    pub cumulative_filled_quantity: Decimal,
    /// Last executed price.
    #[serde(rename = "L", with = "rust_decimal::serde::str")]
    pub last_executed_price: Decimal,
    /// Commission amount.
    #[serde(rename = "n", with = "rust_decimal::serde::str")]
    pub commission: Decimal,
    /// Commission asset.
    #[serde(rename = "N")]
    pub commission_asset: Option<String>,
    /// Transaction time (epoch millis).
    #[serde(rename = "T")]
    pub transaction_time: i64,
    /// Trade ID (-1 when not a trade).
    #[serde(rename = "t")]
    pub trade_id: i64,
}

impl ExecutionReportMessage {
    /// Convert to the domain order update.
    pub fn into_domain(self) -> Result<OrderUpdate, CodecError> {
        Ok(OrderUpdate {
            symbol: Symbol::new(self.symbol),
            client_order_id: self.client_order_id,
            side: self.side,
            order_type: self.order_type,
            time_in_force: self.time_in_force,
            quantity: self.quantity,
            price: self.price,
            execution_type: self.execution_type,
            order_status: self.order_status,
            reject_reason: self.reject_reason,
            order_id: self.order_id,
            last_executed_quantity: self.last_executed_quantity,
            cumulative_filled_quantity: self.cumulative_filled_quantity,
            last_executed_price: self.last_executed_price,
            commission: self.commission,
            commission_asset: self.commission_asset,
            transaction_time: timestamp(self.transaction_time)?,
            trade_id: self.trade_id,
        })
    }
}

/// `listStatus` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListStatusMessage {
    /// Event time (epoch millis).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Order list ID.
    #[serde(rename = "g")]
    pub order_list_id: i64,
    /// Contingency type.
    #[serde(rename = "c")]
    pub contingency_type: String,
    /// List status type.
    #[serde(rename = "l")]
    pub list_status_type: String,
    /// List order status.
    #[serde(rename = "L")]
    pub list_order_status: String,
    /// List client order ID.
    #[serde(rename = "C")]
    pub list_client_order_id: String,
    /// Transaction time (epoch millis).
    #[serde(rename = "T")]
    pub transaction_time: i64,
}

impl ListStatusMessage {
    /// Convert to the domain list status.
    pub fn into_domain(self) -> Result<ListStatus, CodecError> {
        Ok(ListStatus {
            symbol: Symbol::new(self.symbol),
            order_list_id: self.order_list_id,
            contingency_type: self.contingency_type,
            list_status_type: self.list_status_type,
            list_order_status: self.list_order_status,
            list_client_order_id: self.list_client_order_id,
            transaction_time: timestamp(self.transaction_time)?,
        })
    }
}

/// `listenKeyExpired` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenKeyExpiredMessage {
    /// Event time (epoch millis).
    #[serde(rename = "E")]
    pub event_time: i64,
}

// =============================================================================
// REST Responses
// =============================================================================

/// `GET /sapi/v1/system/status` response.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemStatusResponse {
    /// 0 normal, 1 maintenance.
    pub status: u8,
    /// Status message.
    #[serde(default)]
    pub msg: String,
}

/// `GET /api/v3/time` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTimeResponse {
    /// Exchange time (epoch millis).
    pub server_time: i64,
}

/// `POST /api/v3/userDataStream` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKeyResponse {
    /// Issued listen key.
    pub listen_key: String,
}

impl From<ListenKeyResponse> for ListenKey {
    fn from(response: ListenKeyResponse) -> Self {
        Self::new(response.listen_key)
    }
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// Exchange error code.
    pub code: i64,
    /// Error message.
    pub msg: String,
}
