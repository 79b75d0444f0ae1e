//! Stream Event Payloads
//!
//! Canonical decoded payloads for each stream family. These types are
//! codec-agnostic: the wire structs in the infrastructure layer convert
//! into them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::candlestick::Candlestick;
use super::market::Symbol;
use super::order_book::PriceLevel;

// =============================================================================
// Trades
// =============================================================================

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Trading pair.
    pub symbol: Symbol,
    /// Exchange trade identifier.
    pub trade_id: u64,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub quantity: Decimal,
    /// Execution time.
    pub trade_time: DateTime<Utc>,
    /// Whether the buyer was the resting (maker) side.
    pub is_buyer_maker: bool,
}

/// Trades aggregated by price, side and taker order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTrade {
    /// Trading pair.
    pub symbol: Symbol,
    /// Aggregate trade identifier.
    pub aggregate_trade_id: u64,
    /// Execution price.
    pub price: Decimal,
    /// Total quantity.
    pub quantity: Decimal,
    /// First underlying trade identifier.
    pub first_trade_id: u64,
    /// Last underlying trade identifier.
    pub last_trade_id: u64,
    /// Execution time.
    pub trade_time: DateTime<Utc>,
    /// Whether the buyer was the resting (maker) side.
    pub is_buyer_maker: bool,
}

// =============================================================================
// Candlesticks
// =============================================================================

/// A candlestick update; `candlestick.is_final` marks the closing update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandlestickUpdate {
    /// The candlestick state carried by the update.
    pub candlestick: Candlestick,
    /// First trade identifier in the candle, if any trade happened.
    pub first_trade_id: Option<u64>,
    /// Last trade identifier in the candle, if any trade happened.
    pub last_trade_id: Option<u64>,
}

// =============================================================================
// Depth
// =============================================================================

/// Which depth stream produced an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepthUpdateKind {
    /// Incremental changes; must be sequenced against a snapshot.
    Diff,
    /// Complete top-N book; replaces local state.
    Partial,
}

/// One order book update.
///
/// For a diff update `first_update_id..=last_update_id` is the range of
/// book update ids it covers. A partial update has a single id in both
/// fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthUpdate {
    /// Trading pair.
    pub symbol: Symbol,
    /// Diff or partial book.
    pub kind: DepthUpdateKind,
    /// First update id in the range.
    pub first_update_id: u64,
    /// Last update id in the range.
    pub last_update_id: u64,
    /// Changed bid levels; zero quantity removes a level.
    pub bids: Vec<PriceLevel>,
    /// Changed ask levels; zero quantity removes a level.
    pub asks: Vec<PriceLevel>,
}

// =============================================================================
// Statistics
// =============================================================================

/// Rolling 24h statistics for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolStatistics {
    /// Trading pair.
    pub symbol: Symbol,
    /// Absolute price change over the window.
    pub price_change: Decimal,
    /// Relative price change in percent.
    pub price_change_percent: Decimal,
    /// Volume weighted average price.
    pub weighted_average_price: Decimal,
    /// Last price before the window opened.
    pub previous_close_price: Decimal,
    /// Last traded price.
    pub last_price: Decimal,
    /// Last traded quantity.
    pub last_quantity: Decimal,
    /// Best bid price.
    pub bid_price: Decimal,
    /// Best bid quantity.
    pub bid_quantity: Decimal,
    /// Best ask price.
    pub ask_price: Decimal,
    /// Best ask quantity.
    pub ask_quantity: Decimal,
    /// Price at window open.
    pub open_price: Decimal,
    /// Highest price in the window.
    pub high_price: Decimal,
    /// Lowest price in the window.
    pub low_price: Decimal,
    /// Base asset volume.
    pub volume: Decimal,
    /// Quote asset volume.
    pub quote_volume: Decimal,
    /// Window open time.
    pub open_time: DateTime<Utc>,
    /// Window close time.
    pub close_time: DateTime<Utc>,
    /// First trade id in the window.
    pub first_trade_id: i64,
    /// Last trade id in the window.
    pub last_trade_id: i64,
    /// Number of trades in the window.
    pub trade_count: u64,
}

/// Statistics for one or many symbols, as delivered by a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsUpdate {
    /// One entry for a symbol topic, every symbol for `!ticker@arr`.
    pub statistics: Vec<SymbolStatistics>,
}

// =============================================================================
// User Data
// =============================================================================

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

/// Free and locked amounts of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    /// Asset code.
    pub asset: String,
    /// Available amount.
    pub free: Decimal,
    /// Amount locked in open orders.
    pub locked: Decimal,
}

/// Balances that changed with an account update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdate {
    /// Time of the last account update.
    pub last_update_time: DateTime<Utc>,
    /// Changed balances.
    pub balances: Vec<AssetBalance>,
}

/// Deposit, withdrawal or transfer affecting one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    /// Asset code.
    pub asset: String,
    /// Signed balance delta.
    pub delta: Decimal,
    /// Clear time.
    pub clear_time: DateTime<Utc>,
}

/// Execution report for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUpdate {
    /// Trading pair.
    pub symbol: Symbol,
    /// Client order id.
    pub client_order_id: String,
    /// Order side.
    pub side: OrderSide,
    /// Order type (`LIMIT`, `MARKET`, ...).
    pub order_type: String,
    /// Time in force (`GTC`, `IOC`, ...).
    pub time_in_force: String,
    /// Order quantity.
    pub quantity: Decimal,
    /// Order price.
    pub price: Decimal,
    /// Execution type of this report (`NEW`, `TRADE`, `CANCELED`, ...).
    pub execution_type: String,
    /// Current order status.
    pub order_status: String,
    /// Reject reason, `NONE` when accepted.
    pub reject_reason: String,
    /// Exchange order id.
    pub order_id: u64,
    /// Quantity filled by this execution.
    pub last_executed_quantity: Decimal,
    /// Quantity filled so far.
    pub cumulative_filled_quantity: Decimal,
    /// Price of this execution.
    pub last_executed_price: Decimal,
    /// Commission charged for this execution.
    pub commission: Decimal,
    /// Commission asset, absent when nothing was charged.
    pub commission_asset: Option<String>,
    /// Transaction time.
    pub transaction_time: DateTime<Utc>,
    /// Trade id, `-1` when the report is not a fill.
    pub trade_id: i64,
}

/// Status change of an order list (OCO).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListStatus {
    /// Trading pair.
    pub symbol: Symbol,
    /// Order list id.
    pub order_list_id: i64,
    /// Contingency type (`OCO`).
    pub contingency_type: String,
    /// List status type.
    pub list_status_type: String,
    /// List order status.
    pub list_order_status: String,
    /// Client id of the list.
    pub list_client_order_id: String,
    /// Transaction time.
    pub transaction_time: DateTime<Utc>,
}

/// Any event delivered on a user-data stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserDataEvent {
    /// `outboundAccountPosition`
    AccountUpdate(AccountUpdate),
    /// `balanceUpdate`
    BalanceUpdate(BalanceUpdate),
    /// `executionReport`
    OrderUpdate(Box<OrderUpdate>),
    /// `listStatus`
    ListStatus(ListStatus),
    /// `listenKeyExpired`; the stream must be re-keyed.
    ListenKeyExpired,
}
