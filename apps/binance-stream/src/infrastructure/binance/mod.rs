//! Binance Stream Adapters
//!
//! Everything between a WebSocket frame and a typed event:
//!
//! - **Transport**: one connection at a time, text frames to an observer
//! - **Multiplexer**: topic subscriptions, single vs combined URIs, routing
//! - **Client**: typed decoding and fan-out per stream family
//! - **Families**: trade, aggTrade, kline, depth, ticker, user data
//! - **REST**: snapshots, history, server time and listen keys

pub mod client;
pub mod codec;
pub mod families;
pub mod messages;
pub mod multiplexer;
pub mod rest;
pub mod transport;

pub use client::{
    ClientError, DecodeContext, EventCallback, EventClient, EventFamily, EventSubscriber,
    StreamEvent, SubscriptionId,
};
pub use codec::{CodecError, JsonCodec};
pub use families::{
    AggregateTradeFamily, CandlestickFamily, CandlestickKey, DepthFamily, DepthKey,
    PARTIAL_DEPTH_LEVELS, StatisticsFamily, StatisticsKey, TradeFamily, UserDataFamily,
};
pub use multiplexer::{
    FrameCallback, FrameHandler, HandlerError, MultiplexerError, RawFrame, StreamFrame,
    StreamMultiplexer,
};
pub use rest::BinanceRestClient;
pub use transport::{FrameTransport, TransportError, TransportObserver, WebSocketTransport};
